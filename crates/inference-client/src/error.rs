use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl InferenceError {
    /// Worth retrying with backoff: transport failures and 5xx-style
    /// unavailability. A malformed body is not.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            InferenceError::ServiceUnavailable(_) => true,
            InferenceError::MalformedResponse(_) => false,
        }
    }
}

pub type InferenceResult<T> = Result<T, InferenceError>;
