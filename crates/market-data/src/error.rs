use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected payload: {0}")]
    Payload(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),
}

pub type MarketDataResult<T> = Result<T, MarketDataError>;
