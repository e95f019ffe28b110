//! Error type for the recording index.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from rusqlite
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    /// Malformed JSON side-data in a row
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The database reports a schema newer than this build understands
    #[error("unsupported schema version {0} (current is {1})")]
    SchemaTooNew(i64, i64),
    /// Refusal to delete the segment that is still being written
    #[error("recording {0} is currently open")]
    RecordingOpen(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Rusqlite(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        ))
    }
}
