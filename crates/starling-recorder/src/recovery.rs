//! Startup recovery of segments orphaned by a crash.
//!
//! Any `*__open*.opus` left under the recording root is closed out: its
//! duration is reconstructed from the last Ogg page's granule, sidecar
//! headers are patched, files are renamed to their finalized names and the
//! index row is fixed up (or created, when the crash predated the insert).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use starling_media::mixer::WAVEFORM_RATE;
use starling_media::ogg;
use starling_media::waveform::patch_header_samples;
use starling_store::{FinalizeUpdate, RecordingStore, WaveformInfo};

use crate::config::RecordingConfig;
use crate::quota;
use crate::segment;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub discarded: usize,
    pub failed: usize,
}

/// Scan the recording root and finalize every orphaned open segment, then
/// run one quota sweep over the result. Failures leave the file in place
/// for manual inspection and never abort startup.
pub fn recover_orphans(
    root: &Path,
    bot_id: i64,
    store: &RecordingStore,
    cfg: &RecordingConfig,
) -> RecoveryReport {
    let min_duration = cfg.min_duration();
    let mut report = RecoveryReport::default();
    for path in segment::walk_audio_files(root) {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if !segment::is_open_name(&name) {
            continue;
        }
        match recover_one(root, bot_id, store, min_duration, &path) {
            Ok(true) => report.recovered += 1,
            Ok(false) => report.discarded += 1,
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "crash recovery failed, leaving file in place"
                );
                report.failed += 1;
            }
        }
    }
    if report != RecoveryReport::default() {
        info!(
            recovered = report.recovered,
            discarded = report.discarded,
            failed = report.failed,
            "crash recovery finished"
        );
    }
    // Recovered segments count against the quota like any other finalize.
    // No segment is open yet at startup, so nothing is spared.
    if let Some(limit) = cfg.max_total_size_bytes() {
        quota::enforce_quota(root, bot_id, store, limit, None);
    }
    report
}

fn recover_one(
    root: &Path,
    bot_id: i64,
    store: &RecordingStore,
    min_duration: Duration,
    path: &Path,
) -> Result<bool> {
    let file_id =
        segment::file_id_for(root, path).ok_or_else(|| anyhow!("orphan outside recording root"))?;
    let granule = ogg::last_granule(path)
        .with_context(|| format!("failed to scan {}", path.display()))?
        .unwrap_or(0);
    let duration_ms = granule / 48;

    let row = store.get(bot_id, &file_id)?;
    let start = row
        .as_ref()
        .map(|r| r.start)
        .or_else(|| segment::start_from_file_id(&file_id))
        .or_else(|| {
            // Last resort: work backwards from the file's mtime.
            std::fs::metadata(path)
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| DateTime::<Utc>::from(t) - chrono::Duration::milliseconds(duration_ms as i64))
        })
        .unwrap_or_else(Utc::now);

    if (duration_ms as u128) < min_duration.as_millis() {
        info!(file_id = %file_id, duration_ms, "orphan discarded (too short)");
        std::fs::remove_file(path)?;
        let _ = segment::delete_sidecars(path);
        let _ = store.delete_unchecked(bot_id, &file_id);
        return Ok(false);
    }

    for sidecar in segment::sidecars_for(path)? {
        if let Err(e) = patch_header_samples(&sidecar) {
            warn!(error = %e, path = %sidecar.display(), "failed to patch sidecar header");
        }
    }

    let end = start + chrono::Duration::milliseconds(duration_ms as i64);
    let finalized = segment::rename_finalized(root, path, end)?;
    let size_bytes = std::fs::metadata(&finalized.path)?.len();

    let participants = row.map(|r| r.participants).unwrap_or_default();
    let names: HashMap<&str, &str> = participants
        .iter()
        .map(|p| (p.uid.as_str(), p.name.as_str()))
        .collect();
    let waveforms: Vec<WaveformInfo> = finalized
        .sidecars
        .iter()
        .map(|s| {
            let (samples, max_sample, size) = sidecar_stats(&s.path);
            WaveformInfo {
                uid: s.uid.clone(),
                name: names
                    .get(s.uid.as_str())
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| s.uid.clone()),
                sample_rate: WAVEFORM_RATE,
                samples,
                max_sample,
                size_bytes: size,
                file_id: s.file_id.clone(),
            }
        })
        .collect();

    let update = FinalizeUpdate {
        file_id: finalized.file_id.clone(),
        file_name: finalized.file_name.clone(),
        end,
        duration_ms,
        size_bytes,
        participants: participants.clone(),
        waveforms,
    };
    let matched = store.finalize_by_file_id(bot_id, &file_id, &update)?;
    if !matched {
        store.insert_finalized(bot_id, start, &update)?;
    }
    info!(file_id = %update.file_id, duration_ms, "recovered orphaned recording");
    Ok(true)
}

fn sidecar_stats(path: &Path) -> (u32, u8, u64) {
    match std::fs::read(path) {
        Ok(data) => {
            let body = data.get(16..).unwrap_or(&[]);
            let max = body.iter().copied().max().unwrap_or(0);
            (body.len() as u32, max, data.len() as u64)
        }
        Err(_) => (0, 0, 0),
    }
}
