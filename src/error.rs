use thiserror::Error;

#[derive(Debug, Error)]
pub enum PapiError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state not found or expired: {0}")]
    StateNotFound(String),
    #[error("state stage mismatch: expected {expected}, found {found}")]
    StageMismatch { expected: String, found: String },
    #[error("state store error: {0}")]
    Store(String),
    #[error("point of access error: {0}")]
    External(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PapiError {
    /// True for errors caused by a bad, stale or foreign state handle.
    pub fn is_invalid_handle(&self) -> bool {
        matches!(
            self,
            Self::StateNotFound(_) | Self::StageMismatch { .. }
        )
    }
}
