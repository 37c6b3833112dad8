use anyhow::Result;
use chrono::Utc;
use signal_core::{DecisionOutcome, LearningEventKind};

use crate::store::TradeStore;

impl TradeStore {
    /// Append the terminal outcome of one pipeline run to the decision log.
    pub async fn record_decision(
        &self,
        instrument: &str,
        action: &str,
        confidence: f64,
        rationale: &str,
        outcome: DecisionOutcome,
        reject_reason: Option<&str>,
        trade_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO decision_log (
                instrument, action, confidence, rationale, outcome,
                reject_reason, trade_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(instrument)
        .bind(action)
        .bind(confidence)
        .bind(rationale)
        .bind(outcome.as_str())
        .bind(reject_reason)
        .bind(trade_id)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn record_learning_event(
        &self,
        kind: LearningEventKind,
        description: &str,
        details: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO learning_log (event_type, description, details, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(kind.as_str())
        .bind(description)
        .bind(details.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Count of learning-log rows of one kind.
    pub async fn learning_event_count(&self, kind: LearningEventKind) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM learning_log WHERE event_type = ?")
                .bind(kind.as_str())
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    /// Per-outcome decision counts since the given instant. Used by the
    /// daily report.
    pub async fn decision_outcome_counts_since(
        &self,
        since_rfc3339: &str,
    ) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT outcome, COUNT(*) FROM decision_log
             WHERE created_at >= ? GROUP BY outcome",
        )
        .bind(since_rfc3339)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
