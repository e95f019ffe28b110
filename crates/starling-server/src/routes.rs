//! HTTP surface of the recorder, mounted under `/api/recording`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query};
use axum::http::header::RANGE;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Deserialize;
use tracing::{error, info, warn};

use starling_recorder::{segment, Recorder, RecorderStatus};
use starling_store::{ListFilter, Participant, RecordingEntry, RecordingStore};

use crate::stream::{serve_file, serve_follow, AUDIO_CONTENT_TYPE, WAVEFORM_CONTENT_TYPE};

#[derive(Clone)]
pub struct AppState {
    pub bot_id: i64,
    /// Canonical recording root; every served path must stay below it.
    pub root: PathBuf,
    pub store: Arc<RecordingStore>,
    pub recorder: Arc<Recorder>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/recording/status", get(status))
        .route("/api/recording/enable", post(enable))
        .route("/api/recording/list", get(list))
        .route("/api/recording/users", get(users))
        .route("/api/recording/delete/*id", delete(delete_recording))
        .route("/api/recording/get/*id", get(get_recording))
        .route("/api/recording/waveform/*id", get(get_waveform))
        .fallback(fallback)
        .layer(Extension(state))
}

async fn fallback(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("No route for {uri}"))
}

fn internal_error(op: &str, e: impl std::fmt::Display) -> (StatusCode, String) {
    error!("{op} failed: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{op} failed"))
}

/// Resolve a recording id strictly inside the root: the canonical path of
/// the target must keep the canonical root as a proper prefix.
fn resolve_id(root: &Path, id: &str) -> Option<PathBuf> {
    if id.is_empty() {
        return None;
    }
    let candidate = root.join(id);
    let canonical = candidate.canonicalize().ok()?;
    if canonical.starts_with(root) && canonical != *root {
        Some(canonical)
    } else {
        None
    }
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(t.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(NaiveDateTime::new(d, NaiveTime::MIN).and_utc());
    }
    None
}

/// Upper bound for a `to` filter: a bare date (midnight) means the whole
/// day, so it becomes an exclusive bound one day later.
fn parse_to_bound(raw: &str) -> Option<DateTime<Utc>> {
    let t = parse_instant(raw)?;
    if t.time() == NaiveTime::MIN {
        Some(t + Duration::days(1))
    } else {
        Some(t)
    }
}

#[derive(Debug, Deserialize)]
struct EnableRequest {
    enabled: bool,
}

async fn status(Extension(state): Extension<AppState>) -> Json<RecorderStatus> {
    Json(state.recorder.status())
}

async fn enable(
    Extension(state): Extension<AppState>,
    Json(payload): Json<EnableRequest>,
) -> Json<RecorderStatus> {
    state.recorder.set_enabled(payload.enabled);
    Json(state.recorder.status())
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    from: Option<String>,
    to: Option<String>,
    uid: Option<String>,
    name: Option<String>,
}

async fn list(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RecordingEntry>>, (StatusCode, String)> {
    let filter = build_filter(&query)?;
    let mut rows = state
        .store
        .list(state.bot_id, &filter)
        .map_err(|e| internal_error("list recordings", e))?;
    // The open segment's row is served live: size and duration are read
    // fresh under the recording mutex, not from the last index flush.
    if let Some(live) = state.recorder.live_entry() {
        for row in &mut rows {
            if row.file_id == live.file_id {
                *row = live.clone();
            }
        }
    }
    Ok(Json(rows))
}

fn build_filter(query: &ListQuery) -> Result<ListFilter, (StatusCode, String)> {
    let from = match &query.from {
        None => None,
        Some(raw) => Some(parse_instant(raw).ok_or_else(|| bad_time(raw))?),
    };
    let to = match &query.to {
        None => None,
        Some(raw) => Some(parse_to_bound(raw).ok_or_else(|| bad_time(raw))?),
    };
    Ok(ListFilter {
        from,
        to,
        uid: query.uid.clone(),
        name: query.name.clone(),
    })
}

fn bad_time(raw: &str) -> (StatusCode, String) {
    (
        StatusCode::BAD_REQUEST,
        format!("unrecognized time value: {raw}"),
    )
}

async fn users(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Participant>>, (StatusCode, String)> {
    let filter = build_filter(&query)?;
    let people = state
        .store
        .list_participants(state.bot_id, filter.from, filter.to)
        .map_err(|e| internal_error("list participants", e))?;
    Ok(Json(people))
}

async fn delete_recording(
    Extension(state): Extension<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<bool>, (StatusCode, String)> {
    if state.recorder.is_open_file_id(&id) {
        return Err((
            StatusCode::CONFLICT,
            "refusing to delete the recording in progress".to_string(),
        ));
    }
    let path = resolve_id(&state.root, &id);
    let file_deleted = match &path {
        Some(path) => {
            std::fs::remove_file(path).map_err(|e| internal_error("delete recording", e))?;
            let _ = segment::delete_sidecars(path);
            if let Some(parent) = path.parent() {
                let _ = std::fs::remove_dir(parent);
            }
            true
        }
        None => false,
    };
    let row_deleted = match state.store.delete(state.bot_id, &id) {
        Ok(deleted) => deleted,
        Err(starling_store::Error::RecordingOpen(_)) => {
            return Err((
                StatusCode::CONFLICT,
                "refusing to delete the recording in progress".to_string(),
            ));
        }
        Err(e) => return Err(internal_error("delete recording", e)),
    };
    if !file_deleted && !row_deleted {
        return Err((StatusCode::NOT_FOUND, "no such recording".to_string()));
    }
    info!(file_id = %id, file_deleted, row_deleted, "recording deleted");
    Ok(Json(true))
}

async fn get_recording(
    Extension(state): Extension<AppState>,
    UrlPath(id): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let Some(path) = resolve_id(&state.root, &id) else {
        return (StatusCode::NOT_FOUND, "no such recording").into_response();
    };
    let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
    if range.is_none() && state.recorder.is_open_file_id(&id) {
        return serve_follow(state.recorder.clone(), path, id);
    }
    serve_file(&path, AUDIO_CONTENT_TYPE, range).await
}

#[derive(Debug, Deserialize)]
struct WaveformQuery {
    uid: String,
}

async fn get_waveform(
    Extension(state): Extension<AppState>,
    UrlPath(id): UrlPath<String>,
    Query(query): Query<WaveformQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(audio_path) = resolve_id(&state.root, &id) else {
        return (StatusCode::NOT_FOUND, "no such recording").into_response();
    };
    let Some(stem) = audio_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
    else {
        return (StatusCode::NOT_FOUND, "no such recording").into_response();
    };
    let sidecar = audio_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(starling_media::waveform::sidecar_name(&stem, &query.uid));
    if !sidecar.is_file() {
        warn!(file_id = %id, uid = %query.uid, "waveform sidecar not found");
        return (StatusCode::NOT_FOUND, "no such waveform").into_response();
    }
    let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
    serve_file(&sidecar, WAVEFORM_CONTENT_TYPE, range).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn instants_parse_three_formats() {
        assert_eq!(
            parse_instant("2025-06-01"),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_instant("2025-06-01 13:30:00"),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 13, 30, 0).unwrap())
        );
        assert_eq!(
            parse_instant("2025-06-01T13:30:00Z"),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 13, 30, 0).unwrap())
        );
        assert_eq!(parse_instant("yesterday"), None);
    }

    #[test]
    fn bare_date_to_bound_covers_the_whole_day() {
        assert_eq!(
            parse_to_bound("2025-06-01"),
            Some(Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_to_bound("2025-06-01 13:30:00"),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 13, 30, 0).unwrap())
        );
    }

    #[test]
    fn resolve_rejects_escapes_and_misses() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("2025-06-01")).unwrap();
        std::fs::write(root.join("2025-06-01/a.opus"), b"x").unwrap();

        assert!(resolve_id(&root, "2025-06-01/a.opus").is_some());
        assert!(resolve_id(&root, "missing.opus").is_none());
        assert!(resolve_id(&root, "../outside.opus").is_none());
        assert!(resolve_id(&root, "2025-06-01/../../outside.opus").is_none());
        assert!(resolve_id(&root, "").is_none());
        // The root itself is not a recording.
        assert!(resolve_id(&root, ".").is_none());
    }
}
