use anyhow::Result;
use chrono::Utc;
use risk_gate::RiskParameters;

use crate::store::{parse_ts, TradeStore};

impl TradeStore {
    /// Latest committed parameter version. Seeds the defaults on first use
    /// so every later load sees a real versioned row.
    pub async fn latest_risk_parameters(&self) -> Result<RiskParameters> {
        if let Some(params) = self.fetch_latest_params().await? {
            return Ok(params);
        }
        let defaults = RiskParameters::default();
        self.insert_risk_parameters(&defaults).await?;
        Ok(self
            .fetch_latest_params()
            .await?
            .unwrap_or(defaults))
    }

    /// Commit a new parameter version. The version column is assigned by
    /// the database, so concurrent retunes cannot collide.
    pub async fn insert_risk_parameters(&self, params: &RiskParameters) -> Result<i64> {
        let (version,): (i64,) = sqlx::query_as(
            "INSERT INTO risk_parameters (
                soft_daily_loss_pct, max_consecutive_losses, max_trades_per_day,
                cooldown_secs, min_confidence, min_risk_reward, tolerance_pct,
                whitelist, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING version",
        )
        .bind(params.soft_daily_loss_pct)
        .bind(params.max_consecutive_losses)
        .bind(params.max_trades_per_day)
        .bind(params.cooldown_secs)
        .bind(params.min_confidence)
        .bind(params.min_risk_reward)
        .bind(params.tolerance_pct)
        .bind(params.whitelist.join(","))
        .bind(Utc::now().to_rfc3339())
        .fetch_one(self.pool())
        .await?;
        Ok(version)
    }

    async fn fetch_latest_params(&self) -> Result<Option<RiskParameters>> {
        let row: Option<(i64, f64, i64, i64, i64, f64, f64, f64, String, String)> = sqlx::query_as(
            "SELECT version, soft_daily_loss_pct, max_consecutive_losses,
                    max_trades_per_day, cooldown_secs, min_confidence,
                    min_risk_reward, tolerance_pct, whitelist, created_at
             FROM risk_parameters ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(
            |(
                version,
                soft_daily_loss_pct,
                max_consecutive_losses,
                max_trades_per_day,
                cooldown_secs,
                min_confidence,
                min_risk_reward,
                tolerance_pct,
                whitelist,
                created_at,
            )| RiskParameters {
                version,
                soft_daily_loss_pct,
                max_consecutive_losses,
                max_trades_per_day,
                cooldown_secs,
                min_confidence,
                min_risk_reward,
                tolerance_pct,
                whitelist: whitelist
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                created_at: parse_ts(&created_at),
            },
        ))
    }
}
