use thiserror::Error;

/// Failure modes of a planner call.
///
/// Every backend maps its own failures onto these three classes so the retry
/// policy can treat all backends alike.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlannerError {
    /// Network failure, timeout, rate limit or 5xx. Retried with backoff.
    #[error("transient planner failure: {0}")]
    Transient(String),

    /// The backend answered but the answer could not be turned into a valid plan,
    /// even after the JSON repair pass.
    #[error("malformed planner output: {reason}")]
    Malformed { reason: String, raw: String },

    /// Missing credentials, unknown model, rejected request. Never retried.
    #[error("planner configuration error: {0}")]
    Fatal(String),
}

impl PlannerError {
    pub fn malformed(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

impl From<reqwest::Error> for PlannerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            PlannerError::malformed(format!("response body could not be decoded: {e}"), "")
        } else if e.is_builder() {
            PlannerError::Fatal(format!("request could not be built: {e}"))
        } else {
            // timeouts, refused connections, resets, body read errors
            PlannerError::Transient(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum DeskError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),

    #[error("Invalid action: {0}")]
    Grammar(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl serde::Serialize for DeskError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type DeskResult<T> = Result<T, DeskError>;
