use std::time::Duration;

use serde_json::Value;
use signal_core::Decision;

use crate::error::{InferenceError, InferenceResult};
use crate::types::{DecisionResponse, TradeReview};

/// Transient failures back off through these delays before giving up.
const RETRY_DELAYS_SECS: &[u64] = &[1, 2, 4];

/// HTTP client for the external reasoning service. The service sees the
/// full context bundle and returns either a decision or a post-trade
/// review; this client never interprets the reasoning itself.
#[derive(Clone)]
pub struct InferenceClient {
    client: reqwest::Client,
    base_url: String,
}

impl InferenceClient {
    pub fn new(base_url: String, timeout: Duration) -> InferenceResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// Submit a context bundle, get a decision back.
    pub async fn analyze(&self, context: &Value) -> InferenceResult<Decision> {
        let response: DecisionResponse = self.post_with_retries("analyze", context).await?;
        response.into_decision()
    }

    /// Submit a closed-trade report for review and source grading.
    pub async fn review(&self, trade_report: &Value) -> InferenceResult<TradeReview> {
        self.post_with_retries("review", trade_report).await
    }

    pub async fn health(&self) -> InferenceResult<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn post_with_retries<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Value,
    ) -> InferenceResult<T> {
        let mut last_err: Option<InferenceError> = None;
        for (attempt, delay) in std::iter::once(&0u64)
            .chain(RETRY_DELAYS_SECS.iter())
            .enumerate()
        {
            if *delay > 0 {
                tokio::time::sleep(Duration::from_secs(*delay)).await;
            }
            match self.post_once(endpoint, body).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        "inference {} attempt {} failed transiently: {}",
                        endpoint,
                        attempt + 1,
                        e
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| InferenceError::ServiceUnavailable("retries exhausted".to_string())))
    }

    async fn post_once<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Value,
    ) -> InferenceResult<T> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, endpoint))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(InferenceError::ServiceUnavailable(format!(
                "{}: {}",
                endpoint, status
            )));
        }
        if !status.is_success() {
            return Err(InferenceError::MalformedResponse(format!(
                "{} returned {}",
                endpoint, status
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))
    }
}
