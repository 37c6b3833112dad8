use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hard limits. Never tunable, not even by the learning loop.
pub const KILL_SWITCH_CUMULATIVE_PCT: f64 = -40.0;
pub const HARD_DAILY_LOSS_PCT: f64 = -20.0;
pub const MAX_POSITION_SIZE_PCT: f64 = 5.0;

/// Safe ranges for the soft parameters. Retunes clamp into these.
pub const SOFT_DAILY_LOSS_RANGE: (f64, f64) = (-18.0, -10.0);
pub const CONSECUTIVE_LOSS_RANGE: (i64, i64) = (2, 5);
pub const DAILY_TRADE_CAP_RANGE: (i64, i64) = (5, 30);
pub const COOLDOWN_SECS_RANGE: (i64, i64) = (60, 1800);
pub const MIN_CONFIDENCE_RANGE: (f64, f64) = (0.55, 0.80);
pub const MIN_RISK_REWARD_RANGE: (f64, f64) = (1.2, 3.0);

/// Versioned gate parameter snapshot. The pipeline loads the latest
/// committed version before each evaluation; retunes insert a new version
/// rather than editing in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    pub version: i64,
    /// Soft daily-loss ceiling in percent (negative). The hard -20 ceiling
    /// sits above this and is a constant.
    pub soft_daily_loss_pct: f64,
    pub max_consecutive_losses: i64,
    pub max_trades_per_day: i64,
    pub cooldown_secs: i64,
    pub min_confidence: f64,
    pub min_risk_reward: f64,
    /// Band width (fraction of the level) used when classifying exits
    /// against stop/target levels.
    pub tolerance_pct: f64,
    pub whitelist: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            version: 1,
            soft_daily_loss_pct: -15.0,
            max_consecutive_losses: 3,
            max_trades_per_day: 20,
            cooldown_secs: 300,
            min_confidence: 0.60,
            min_risk_reward: 1.5,
            tolerance_pct: 0.005,
            whitelist: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            created_at: Utc::now(),
        }
    }
}

/// A learning-loop proposal for the soft parameters. Absent fields keep
/// their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetuneProposal {
    pub min_confidence: Option<f64>,
    pub min_risk_reward: Option<f64>,
    pub soft_daily_loss_pct: Option<f64>,
    pub max_consecutive_losses: Option<i64>,
    pub max_trades_per_day: Option<i64>,
    pub cooldown_secs: Option<i64>,
}

impl RiskParameters {
    /// Produce the next parameter version with the proposal applied.
    /// Every proposed value is clamped into its safe range; hard limits
    /// are constants and cannot be reached from here.
    pub fn apply_retune(&self, proposal: &RetuneProposal) -> RiskParameters {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.created_at = Utc::now();

        if let Some(v) = proposal.min_confidence {
            next.min_confidence = v.clamp(MIN_CONFIDENCE_RANGE.0, MIN_CONFIDENCE_RANGE.1);
        }
        if let Some(v) = proposal.min_risk_reward {
            next.min_risk_reward = v.clamp(MIN_RISK_REWARD_RANGE.0, MIN_RISK_REWARD_RANGE.1);
        }
        if let Some(v) = proposal.soft_daily_loss_pct {
            next.soft_daily_loss_pct = v.clamp(SOFT_DAILY_LOSS_RANGE.0, SOFT_DAILY_LOSS_RANGE.1);
        }
        if let Some(v) = proposal.max_consecutive_losses {
            next.max_consecutive_losses =
                v.clamp(CONSECUTIVE_LOSS_RANGE.0, CONSECUTIVE_LOSS_RANGE.1);
        }
        if let Some(v) = proposal.max_trades_per_day {
            next.max_trades_per_day = v.clamp(DAILY_TRADE_CAP_RANGE.0, DAILY_TRADE_CAP_RANGE.1);
        }
        if let Some(v) = proposal.cooldown_secs {
            next.cooldown_secs = v.clamp(COOLDOWN_SECS_RANGE.0, COOLDOWN_SECS_RANGE.1);
        }

        next
    }
}
