//! Byte-range and live-follow file streaming.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Bytes, StreamBody};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use starling_media::ogg;
use starling_recorder::Recorder;

pub const AUDIO_CONTENT_TYPE: &str = "audio/ogg";
pub const WAVEFORM_CONTENT_TYPE: &str = "application/octet-stream";

const CHUNK_LEN: usize = 64 * 1024;
/// How long the follow loop sleeps when it has caught up with the writer.
const FOLLOW_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=<start>-<end?>`
    FromTo(u64, Option<u64>),
    /// `bytes=-<n>`: the final n bytes.
    Suffix(u64),
}

/// Parse a `Range` header. `None` means malformed (which callers answer
/// with 416, since a Range header was present).
pub fn parse_range(raw: &str) -> Option<ByteRange> {
    let spec = raw.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        // Multipart ranges are not supported.
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() {
        Some(ByteRange::Suffix(end.parse().ok()?))
    } else {
        let start = start.parse().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse().ok()?)
        };
        Some(ByteRange::FromTo(start, end))
    }
}

/// Clamp a parsed range against the resource length; `Err` is unsatisfiable.
pub fn resolve_range(range: ByteRange, len: u64) -> Result<(u64, u64), ()> {
    match range {
        ByteRange::FromTo(start, end) => {
            if start >= len {
                return Err(());
            }
            let end = end.map_or(len - 1, |e| e.min(len - 1));
            if end < start {
                Err(())
            } else {
                Ok((start, end))
            }
        }
        ByteRange::Suffix(n) => {
            if n == 0 || len == 0 {
                return Err(());
            }
            let n = n.min(len);
            Ok((len - n, len - 1))
        }
    }
}

fn base_response(status: StatusCode, content_type: &'static str) -> axum::http::response::Builder {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        )
        .header(header::PRAGMA, "no-cache")
        .header("x-accel-buffering", "no")
}

/// Serve a file with full/206/416 range semantics.
pub async fn serve_file(
    path: &Path,
    content_type: &'static str,
    range_header: Option<&str>,
) -> Response {
    let len = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let resolved = match range_header {
        None => None,
        Some(raw) => match parse_range(raw).and_then(|r| resolve_range(r, len).ok()) {
            Some(window) => Some(window),
            None => {
                return base_response(StatusCode::RANGE_NOT_SATISFIABLE, content_type)
                    .header(header::CONTENT_RANGE, format!("bytes */{len}"))
                    .body(axum::body::boxed(axum::body::Empty::new()))
                    .expect("static response")
                    .into_response();
            }
        },
    };

    match resolved {
        None => base_response(StatusCode::OK, content_type)
            .header(header::CONTENT_LENGTH, len)
            .body(axum::body::boxed(stream_range(path.to_path_buf(), 0, len)))
            .expect("static response")
            .into_response(),
        Some((start, end)) => base_response(StatusCode::PARTIAL_CONTENT, content_type)
            .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
            .header(header::CONTENT_LENGTH, end - start + 1)
            .body(axum::body::boxed(stream_range(
                path.to_path_buf(),
                start,
                end - start + 1,
            )))
            .expect("static response")
            .into_response(),
    }
}

type ChunkStream = StreamBody<ReceiverStream<Result<Bytes, std::io::Error>>>;

fn stream_range(path: PathBuf, start: u64, count: u64) -> ChunkStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        if let Err(e) = file.seek(SeekFrom::Start(start)).await {
            let _ = tx.send(Err(e)).await;
            return;
        }
        let mut remaining = count;
        let mut buf = vec![0u8; CHUNK_LEN];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            match file.read(&mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => {
                    remaining -= n as u64;
                    // A failed send means the client hung up.
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    StreamBody::new(ReceiverStream::new(rx))
}

/// Tail the currently open segment: the two Ogg header pages first, then
/// every byte appended from the current length onward, polling until the
/// segment is closed or the client disconnects.
pub fn serve_follow(recorder: Arc<Recorder>, path: PathBuf, file_id: String) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        let start_at = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        let mut head = vec![0u8; (16 * 1024).min(start_at) as usize];
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        if let Err(e) = file.read_exact(&mut head).await {
            let _ = tx.send(Err(e)).await;
            return;
        }
        let Some(header_pages) = ogg::header_pages_in(&head) else {
            let _ = tx
                .send(Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "segment has no ogg headers yet",
                )))
                .await;
            return;
        };
        if tx.send(Ok(Bytes::from(header_pages))).await.is_err() {
            return;
        }

        if let Err(e) = file.seek(SeekFrom::Start(start_at)).await {
            let _ = tx.send(Err(e)).await;
            return;
        }

        let mut buf = vec![0u8; CHUNK_LEN];
        let mut draining = false;
        loop {
            match file.read(&mut buf).await {
                Ok(0) => {
                    if draining {
                        break;
                    }
                    if !recorder.is_open_file_id(&file_id) {
                        // Closed under us: wait one poll for the final EOS
                        // page to land, drain it, then finish.
                        draining = true;
                        tokio::time::sleep(FOLLOW_POLL).await;
                        continue;
                    }
                    tokio::time::sleep(FOLLOW_POLL).await;
                }
                Ok(n) => {
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        debug!(file_id = %file_id, "follow client disconnected");
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
        debug!(file_id = %file_id, "follow stream finished");
    });

    base_response(StatusCode::OK, AUDIO_CONTENT_TYPE)
        .body(axum::body::boxed(StreamBody::new(ReceiverStream::new(rx))))
        .expect("static response")
        .into_response()
}
