//! Segment file naming and on-disk finalization.
//!
//! Open segments live at `<root>/<YYYY-MM-DD>/<HH-MM-SS>__open[_N].opus`;
//! finalization renames them to `<HH-MM-SS>__<HH-MM-SS>[_N].opus` together
//! with their loudness sidecars.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use starling_media::waveform::{sidecar_name, unescape_uid, SIDECAR_EXT};

pub const AUDIO_EXT: &str = "opus";
const OPEN_MARKER: &str = "open";

/// Everything the recorder needs to address a freshly created segment.
#[derive(Debug, Clone)]
pub struct SegmentPaths {
    pub dir: PathBuf,
    pub path: PathBuf,
    pub file_name: String,
    /// File stem, e.g. `12-30-05__open`; sidecar names derive from it.
    pub base: String,
    /// Forward-slash path below the recording root.
    pub file_id: String,
}

/// Pick a collision-free `__open` name under the UTC day folder and create
/// the folder. The file itself is created by the caller.
pub fn create_open_paths(root: &Path, start: DateTime<Utc>) -> io::Result<SegmentPaths> {
    let day = start.format("%Y-%m-%d").to_string();
    let dir = root.join(&day);
    std::fs::create_dir_all(&dir)?;

    let stem = format!("{}__{OPEN_MARKER}", start.format("%H-%M-%S"));
    for n in 0u32.. {
        let base = if n == 0 {
            stem.clone()
        } else {
            format!("{stem}_{n}")
        };
        let file_name = format!("{base}.{AUDIO_EXT}");
        let path = dir.join(&file_name);
        if !path.exists() {
            return Ok(SegmentPaths {
                dir,
                path,
                file_id: format!("{day}/{file_name}"),
                file_name,
                base,
            });
        }
    }
    unreachable!("collision suffixes are unbounded")
}

/// Whether a segment file name still carries the open marker.
pub fn is_open_name(file_name: &str) -> bool {
    let Some(stem) = file_name.strip_suffix(&format!(".{AUDIO_EXT}")) else {
        return false;
    };
    match stem.split_once("__") {
        Some((_, rest)) => rest == OPEN_MARKER || rest.starts_with("open_"),
        None => false,
    }
}

/// Finalized name for an open segment: the open marker is replaced by the
/// end time, any collision suffix is preserved.
pub fn final_file_name(open_name: &str, end: DateTime<Utc>) -> Option<String> {
    let stem = open_name.strip_suffix(&format!(".{AUDIO_EXT}"))?;
    let (start_part, rest) = stem.split_once("__")?;
    let suffix = if rest == OPEN_MARKER {
        ""
    } else {
        rest.strip_prefix("open")?
    };
    Some(format!(
        "{start_part}__{}{suffix}.{AUDIO_EXT}",
        end.format("%H-%M-%S")
    ))
}

/// UTC start instant parsed back out of `<YYYY-MM-DD>/<HH-MM-SS>__...`.
pub fn start_from_file_id(file_id: &str) -> Option<DateTime<Utc>> {
    let (day, name) = file_id.rsplit_once('/')?;
    let date = NaiveDate::parse_from_str(day.rsplit('/').next()?, "%Y-%m-%d").ok()?;
    let (clock, _) = name.split_once("__")?;
    let time = NaiveTime::parse_from_str(clock, "%H-%M-%S").ok()?;
    Some(NaiveDateTime::new(date, time).and_utc())
}

/// Forward-slash-normalized path of `path` below `root`.
pub fn file_id_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Rename `path` to `desired` in the same directory, appending `_1`, `_2`, ...
/// to the stem until the target is free. Returns the final path.
pub fn rename_with_collisions(path: &Path, desired: &str) -> io::Result<PathBuf> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let desired_path = Path::new(desired);
    let stem = desired_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| desired.to_string());
    let ext = desired_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    for n in 0u32.. {
        let candidate = if n == 0 {
            format!("{stem}{ext}")
        } else {
            format!("{stem}_{n}{ext}")
        };
        let target = dir.join(&candidate);
        if !target.exists() {
            std::fs::rename(path, &target)?;
            return Ok(target);
        }
    }
    unreachable!("collision suffixes are unbounded")
}

/// Sidecars belonging to the audio file (same directory, `<stem>__*.wfm`).
pub fn sidecars_for(audio_path: &Path) -> io::Result<Vec<PathBuf>> {
    let Some(dir) = audio_path.parent() else {
        return Ok(Vec::new());
    };
    let Some(stem) = audio_path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{stem}__");
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(&format!(".{SIDECAR_EXT}")) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Delete every sidecar of the audio file; returns how many went.
pub fn delete_sidecars(audio_path: &Path) -> io::Result<usize> {
    let sidecars = sidecars_for(audio_path)?;
    let count = sidecars.len();
    for path in sidecars {
        std::fs::remove_file(path)?;
    }
    Ok(count)
}

/// Every audio file below the root, sorted by path. Shared by quota
/// enforcement and crash recovery.
pub fn walk_audio_files(root: &Path) -> Vec<PathBuf> {
    fn visit(dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                visit(&path, out);
            } else if path.extension().is_some_and(|e| e == AUDIO_EXT) {
                out.push(path);
            }
        }
    }
    let mut out = Vec::new();
    visit(root, &mut out);
    out.sort();
    out
}

/// One renamed sidecar: uid plus its new location.
#[derive(Debug, Clone)]
pub struct RenamedSidecar {
    pub uid: String,
    pub path: PathBuf,
    pub file_id: String,
}

/// Result of the on-disk half of finalization.
#[derive(Debug, Clone)]
pub struct FinalizedFiles {
    pub path: PathBuf,
    pub file_name: String,
    pub file_id: String,
    pub sidecars: Vec<RenamedSidecar>,
}

/// Rename an open segment and its sidecars to their finalized names.
pub fn rename_finalized(
    root: &Path,
    audio_path: &Path,
    end: DateTime<Utc>,
) -> Result<FinalizedFiles> {
    let open_name = audio_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("segment path has no file name: {}", audio_path.display()))?;
    let old_stem = audio_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sidecars = sidecars_for(audio_path)?;

    let desired = final_file_name(&open_name, end).unwrap_or_else(|| open_name.clone());
    let final_path = rename_with_collisions(audio_path, &desired)
        .with_context(|| format!("failed to rename {}", audio_path.display()))?;
    let final_stem = final_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_id = file_id_for(root, &final_path)
        .ok_or_else(|| anyhow!("finalized segment escaped the root"))?;

    let mut renamed = Vec::with_capacity(sidecars.len());
    let old_prefix = format!("{old_stem}__");
    for sidecar in sidecars {
        let name = sidecar
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(tail) = name.strip_prefix(&old_prefix) else {
            continue;
        };
        let uid = tail
            .strip_suffix(&format!(".{SIDECAR_EXT}"))
            .and_then(unescape_uid)
            .unwrap_or_else(|| tail.to_string());
        let new_path = rename_with_collisions(&sidecar, &sidecar_name(&final_stem, &uid))
            .with_context(|| format!("failed to rename sidecar {}", sidecar.display()))?;
        let sidecar_id = file_id_for(root, &new_path)
            .ok_or_else(|| anyhow!("finalized sidecar escaped the root"))?;
        renamed.push(RenamedSidecar {
            uid,
            path: new_path,
            file_id: sidecar_id,
        });
    }

    Ok(FinalizedFiles {
        path: final_path,
        file_name,
        file_id,
        sidecars: renamed,
    })
}
