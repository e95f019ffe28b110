//! TSWF loudness sidecars: one byte per mix tick per tracked participant,
//! plus the reserved `mixed` track for the summed signal.
//!
//! Layout: `"TSWF"` | version | flags | reserved u16 | sample rate u32 LE |
//! sample count u32 LE | raw u8 samples. The count is patched on close.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::mixer::WAVEFORM_RATE;

pub const TSWF_MAGIC: &[u8; 4] = b"TSWF";
pub const TSWF_VERSION: u8 = 1;
pub const TSWF_HEADER_LEN: u64 = 16;
pub const SIDECAR_EXT: &str = "wfm";
/// Reserved uid of the summed-signal track.
pub const MIXED_UID: &str = "mixed";

fn header_bytes(samples: u32) -> [u8; 16] {
    let mut header = [0u8; 16];
    header[..4].copy_from_slice(TSWF_MAGIC);
    header[4] = TSWF_VERSION;
    // flags + reserved stay zero
    header[8..12].copy_from_slice(&WAVEFORM_RATE.to_le_bytes());
    header[12..16].copy_from_slice(&samples.to_le_bytes());
    header
}

/// Percent-escape a uid for filesystem use (RFC 3986 unreserved set kept).
pub fn escape_uid(uid: &str) -> String {
    let mut out = String::with_capacity(uid.len());
    for &byte in uid.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Inverse of [`escape_uid`]; `None` on malformed escapes or invalid UTF-8.
pub fn unescape_uid(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Sidecar file name for a segment base and participant uid.
pub fn sidecar_name(base: &str, uid: &str) -> String {
    format!("{base}__{}.{SIDECAR_EXT}", escape_uid(uid))
}

/// Rewrite a sidecar header's sample count from the file length. Used by
/// crash recovery, where the in-memory track state is gone. Returns the
/// patched count.
pub fn patch_header_samples(path: &Path) -> io::Result<u32> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != TSWF_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a TSWF sidecar",
        ));
    }
    let len = file.metadata()?.len();
    let samples = len.saturating_sub(TSWF_HEADER_LEN) as u32;
    file.seek(SeekFrom::Start(12))?;
    file.write_all(&samples.to_le_bytes())?;
    Ok(samples)
}

struct Track {
    uid: String,
    name: String,
    path: PathBuf,
    file: File,
    pending: Vec<u8>,
    samples: u32,
    max_sample: u8,
}

impl Track {
    fn create(dir: &Path, base: &str, uid: &str, name: &str, prefill: u32) -> io::Result<Self> {
        let path = dir.join(sidecar_name(base, uid));
        let mut file = File::create(&path)?;
        file.write_all(&header_bytes(0))?;
        // Late-created tracks catch up so every track in the segment shares
        // the same sample count.
        if prefill > 0 {
            file.write_all(&vec![0u8; prefill as usize])?;
        }
        Ok(Self {
            uid: uid.to_string(),
            name: name.to_string(),
            path,
            file,
            pending: Vec::new(),
            samples: prefill,
            max_sample: 0,
        })
    }

    fn push(&mut self, value: u8) {
        self.pending.push(value);
        self.samples += 1;
        self.max_sample = self.max_sample.max(value);
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.file.write_all(&self.pending)?;
            self.pending.clear();
        }
        Ok(())
    }
}

/// Per-tick loudness sample for one identified participant.
#[derive(Debug, Clone)]
pub struct TickSample {
    pub uid: String,
    pub name: String,
    pub value: u8,
}

/// Metadata of a closed track, consumed by segment finalization.
#[derive(Debug, Clone)]
pub struct ClosedTrack {
    pub uid: String,
    pub name: String,
    pub path: PathBuf,
    pub samples: u32,
    pub max_sample: u8,
    pub size_bytes: u64,
}

/// Live metadata of an open track.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub uid: String,
    pub name: String,
    pub samples: u32,
    pub max_sample: u8,
}

/// All loudness tracks of one segment. Tracks are created on the first tick
/// that identifies a participant; all tracks advance by exactly one byte per
/// tick.
pub struct WaveformSet {
    dir: PathBuf,
    base: String,
    tracks: Vec<Track>,
    samples: u32,
}

impl WaveformSet {
    pub fn new(dir: &Path, base: &str) -> io::Result<Self> {
        let mut set = Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            tracks: Vec::new(),
            samples: 0,
        };
        set.tracks
            .push(Track::create(&set.dir, &set.base, MIXED_UID, MIXED_UID, 0)?);
        Ok(set)
    }

    pub fn sample_count(&self) -> u32 {
        self.samples
    }

    /// Create a track for `uid` unless one exists. New tracks are
    /// zero-prefilled to the shared sample index.
    pub fn ensure_track(&mut self, uid: &str, name: &str) -> io::Result<()> {
        if !self.tracks.iter().any(|t| t.uid == uid) {
            self.tracks
                .push(Track::create(&self.dir, &self.base, uid, name, self.samples)?);
        }
        Ok(())
    }

    /// Append one tick: `senders` carries the loudness of everyone who was
    /// identified this tick, `mixed` the combined signal. Every other known
    /// track receives a zero.
    pub fn append_tick(&mut self, senders: &[TickSample], mixed: u8) -> io::Result<()> {
        for sample in senders {
            self.ensure_track(&sample.uid, &sample.name)?;
        }
        let by_uid: HashMap<&str, u8> = senders
            .iter()
            .map(|s| (s.uid.as_str(), s.value))
            .collect();
        for track in &mut self.tracks {
            let value = if track.uid == MIXED_UID {
                mixed
            } else {
                by_uid.get(track.uid.as_str()).copied().unwrap_or(0)
            };
            track.push(value);
        }
        self.samples += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        for track in &mut self.tracks {
            track.flush()?;
        }
        Ok(())
    }

    pub fn track_info(&self) -> Vec<TrackInfo> {
        self.tracks
            .iter()
            .map(|t| TrackInfo {
                uid: t.uid.clone(),
                name: t.name.clone(),
                samples: t.samples,
                max_sample: t.max_sample,
            })
            .collect()
    }

    /// Flush everything, patch each header with the real sample count and
    /// close the handles. Files keep their open-segment names; renaming is
    /// the segment finalizer's job.
    pub fn close(mut self) -> io::Result<Vec<ClosedTrack>> {
        let mut closed = Vec::with_capacity(self.tracks.len());
        for mut track in self.tracks.drain(..) {
            track.flush()?;
            track.file.seek(SeekFrom::Start(12))?;
            track.file.write_all(&track.samples.to_le_bytes())?;
            closed.push(ClosedTrack {
                uid: track.uid,
                name: track.name,
                path: track.path,
                samples: track.samples,
                max_sample: track.max_sample,
                size_bytes: TSWF_HEADER_LEN + track.samples as u64,
            });
        }
        Ok(closed)
    }

    /// Delete all sidecar files (min-duration discard).
    pub fn discard(mut self) -> io::Result<()> {
        for track in self.tracks.drain(..) {
            let path = track.path.clone();
            drop(track);
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
