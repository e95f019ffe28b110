//! Quota enforcement over the audio tree.
//!
//! The sweep walks every segment file below the root and deletes the oldest
//! (by filesystem mtime) together with their sidecars and index rows until
//! the total fits the limit. It is shared by the ordinary finalize path and
//! by startup crash recovery, which runs before any segment is open.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{info, warn};

use starling_store::RecordingStore;

use crate::segment;

/// Delete the oldest finished recordings until the audio tree fits `limit`.
/// `current_open` is never a victim. Returns how many files were evicted.
pub fn enforce_quota(
    root: &Path,
    bot_id: i64,
    store: &RecordingStore,
    limit: u64,
    current_open: Option<&Path>,
) -> usize {
    let mut files: Vec<(PathBuf, u64, SystemTime)> = segment::walk_audio_files(root)
        .into_iter()
        .filter_map(|path| {
            let meta = std::fs::metadata(&path).ok()?;
            let mtime = meta.modified().ok()?;
            Some((path, meta.len(), mtime))
        })
        .collect();
    let mut total: u64 = files.iter().map(|(_, size, _)| size).sum();
    if total <= limit {
        return 0;
    }
    files.sort_by_key(|(_, _, mtime)| *mtime);

    let mut evicted = 0usize;
    for (path, size, _) in files {
        if total <= limit {
            break;
        }
        if current_open == Some(path.as_path()) {
            continue;
        }
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(error = %e, path = %path.display(), "quota eviction failed to delete");
            continue;
        }
        let _ = segment::delete_sidecars(&path);
        if let Some(file_id) = segment::file_id_for(root, &path) {
            match store.delete(bot_id, &file_id) {
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, file_id = %file_id, "quota eviction failed to drop index row")
                }
            }
        }
        if let Some(parent) = path.parent() {
            // Prune the day folder once it empties out.
            let _ = std::fs::remove_dir(parent);
        }
        total = total.saturating_sub(size);
        evicted += 1;
    }
    if evicted > 0 {
        info!(evicted, total_bytes = total, limit, "quota eviction complete");
    }
    evicted
}
