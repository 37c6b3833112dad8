use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trust weights live on a fixed scale; everything that writes one goes
/// through [`clamp_trust_weight`].
pub const TRUST_WEIGHT_MIN: f64 = 0.5;
pub const TRUST_WEIGHT_MAX: f64 = 2.0;
pub const TRUST_WEIGHT_DEFAULT: f64 = 1.0;

pub fn clamp_trust_weight(weight: f64) -> f64 {
    weight.clamp(TRUST_WEIGHT_MIN, TRUST_WEIGHT_MAX)
}

// ---------------------------------------------------------------------------
// Inbound signals
// ---------------------------------------------------------------------------

/// A raw message captured from a signal channel. Append-only; analysis
/// happens downstream and never mutates the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    pub id: i64,
    pub source_id: String,
    pub channel: String,
    pub raw_text: String,
    pub detected_instruments: Vec<String>,
    pub attachment_urls: Vec<String>,
    pub received_at: DateTime<Utc>,
}

/// Rolling reliability record for one signal source. Mutated only by the
/// learning loop after a trade closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProfile {
    pub source_id: String,
    pub trust_weight: f64,
    pub total_calls: i64,
    pub correct_calls: i64,
    pub lifetime_accuracy: f64,
    pub recent_7d_accuracy: f64,
    pub recent_30d_accuracy: f64,
    pub updated_at: DateTime<Utc>,
}

impl SourceProfile {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            trust_weight: TRUST_WEIGHT_DEFAULT,
            total_calls: 0,
            correct_calls: 0,
            lifetime_accuracy: 0.0,
            recent_7d_accuracy: 0.0,
            recent_30d_accuracy: 0.0,
            updated_at: Utc::now(),
        }
    }
}

/// One graded directional call attributed to a source on a specific trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCall {
    pub id: i64,
    pub trade_id: i64,
    pub source_id: String,
    pub direction: Direction,
    pub message_excerpt: String,
    pub recorded_at: DateTime<Utc>,
    /// None until the trade closes and the call is graded.
    pub correct: Option<bool>,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" => Some(Direction::Long),
            "SHORT" => Some(Direction::Short),
            _ => None,
        }
    }

    /// +1 for long, -1 for short. Used in PnL math.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    Long,
    Short,
    Skip,
    Adjust,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::Long => "LONG",
            DecisionAction::Short => "SHORT",
            DecisionAction::Skip => "SKIP",
            DecisionAction::Adjust => "ADJUST",
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            DecisionAction::Long => Some(Direction::Long),
            DecisionAction::Short => Some(Direction::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStrategy {
    Market,
    Limit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub source_id: String,
    /// Whether the source's call agrees with the decision's direction.
    pub agrees: bool,
    pub excerpt: String,
}

/// Amendment request carried by an ADJUST decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustRequest {
    pub trade_id: i64,
    pub new_stop_loss: Option<f64>,
    pub new_take_profits: Option<Vec<f64>>,
}

/// A fully-specified trade proposal out of the inference service.
/// Immutable once produced; the risk gate reads it, never edits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub instrument: String,
    pub action: DecisionAction,
    /// [0.0, 1.0]
    pub confidence: f64,
    pub entry_price: f64,
    pub entry_strategy: EntryStrategy,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: Option<f64>,
    /// Account percentage to commit, before leverage.
    pub size_pct: f64,
    pub risk_reward: f64,
    pub rationale: String,
    pub sources: Vec<SourceAttribution>,
    pub adjust: Option<AdjustRequest>,
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeState {
    Pending,
    Open,
    PartialClose,
    Closed,
    Discarded,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Pending => "PENDING",
            TradeState::Open => "OPEN",
            TradeState::PartialClose => "PARTIAL_CLOSE",
            TradeState::Closed => "CLOSED",
            TradeState::Discarded => "DISCARDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TradeState::Pending),
            "OPEN" => Some(TradeState::Open),
            "PARTIAL_CLOSE" => Some(TradeState::PartialClose),
            "CLOSED" => Some(TradeState::Closed),
            "DISCARDED" => Some(TradeState::Discarded),
            _ => None,
        }
    }

    /// Legal lifecycle edges. Closed and Discarded are terminal.
    pub fn can_transition_to(&self, next: TradeState) -> bool {
        matches!(
            (self, next),
            (TradeState::Pending, TradeState::Open)
                | (TradeState::Pending, TradeState::Discarded)
                | (TradeState::Open, TradeState::PartialClose)
                | (TradeState::Open, TradeState::Closed)
                | (TradeState::PartialClose, TradeState::Closed)
        )
    }

    pub fn is_exposed(&self) -> bool {
        matches!(self, TradeState::Open | TradeState::PartialClose)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeOutcome {
    Stopped,
    TargetHit,
    Liquidated,
    Anomalous,
    Manual,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Stopped => "STOPPED",
            TradeOutcome::TargetHit => "TARGET_HIT",
            TradeOutcome::Liquidated => "LIQUIDATED",
            TradeOutcome::Anomalous => "ANOMALOUS",
            TradeOutcome::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOPPED" => Some(TradeOutcome::Stopped),
            "TARGET_HIT" => Some(TradeOutcome::TargetHit),
            "LIQUIDATED" => Some(TradeOutcome::Liquidated),
            "ANOMALOUS" => Some(TradeOutcome::Anomalous),
            "MANUAL" => Some(TradeOutcome::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub instrument: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: Option<f64>,
    pub size_pct: f64,
    pub leverage: f64,
    /// Base-asset quantity at open. Exchange-reported quantities are
    /// compared against this during reconciliation.
    pub initial_quantity: f64,
    pub state: TradeState,
    pub confidence: f64,
    pub rationale: String,
    /// Technical posture bucket captured at entry; keys pattern learning.
    pub tech_bucket: Option<TechBucket>,
    pub entry_order_id: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Fill price of the TP1 partial, when one happened.
    pub partial_exit_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub realized_pnl_pct: Option<f64>,
    pub outcome: Option<TradeOutcome>,
    pub review_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Risk counters
// ---------------------------------------------------------------------------

/// Point-in-time counters the risk gate reads. Derived from storage at
/// evaluation time; never cached across evaluations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskCounters {
    pub trades_today: i64,
    pub daily_pnl_pct: f64,
    pub consecutive_losses: i64,
    pub cumulative_pnl_pct: f64,
    /// Seconds since the last trade opened on the candidate instrument,
    /// if any trade exists for it.
    pub seconds_since_last_trade: Option<i64>,
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechBucket {
    BullishTech,
    BearishTech,
    MixedTech,
}

impl TechBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            TechBucket::BullishTech => "bullish_tech",
            TechBucket::BearishTech => "bearish_tech",
            TechBucket::MixedTech => "mixed_tech",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bullish_tech" => Some(TechBucket::BullishTech),
            "bearish_tech" => Some(TechBucket::BearishTech),
            "mixed_tech" => Some(TechBucket::MixedTech),
            _ => None,
        }
    }
}

/// Canonical pattern key: sorted source ids joined with '+', then the
/// technical bucket. Sorting makes the key order-insensitive.
pub fn pattern_key(source_ids: &[String], bucket: TechBucket) -> String {
    let mut ids: Vec<&str> = source_ids.iter().map(|s| s.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    format!("{}|{}", ids.join("+"), bucket.as_str())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPattern {
    pub pattern_key: String,
    pub occurrences: i64,
    pub wins: i64,
    pub win_rate: f64,
    pub avg_profit_pct: f64,
    pub last_seen: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Audit records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionOutcome {
    Executed,
    Skip,
    Rejected,
    Cancelled,
    TimedOut,
    Failed,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Executed => "EXECUTED",
            DecisionOutcome::Skip => "SKIP",
            DecisionOutcome::Rejected => "REJECTED",
            DecisionOutcome::Cancelled => "CANCELLED",
            DecisionOutcome::TimedOut => "TIMED_OUT",
            DecisionOutcome::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningEventKind {
    Review,
    WeightUpdate,
    PatternFound,
    ParamsRetuned,
    DataAnomaly,
}

impl LearningEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningEventKind::Review => "review",
            LearningEventKind::WeightUpdate => "weight_update",
            LearningEventKind::PatternFound => "pattern_found",
            LearningEventKind::ParamsRetuned => "params_retuned",
            LearningEventKind::DataAnomaly => "data_anomaly",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_weight_clamps_to_scale() {
        assert_eq!(clamp_trust_weight(3.7), TRUST_WEIGHT_MAX);
        assert_eq!(clamp_trust_weight(0.1), TRUST_WEIGHT_MIN);
        assert_eq!(clamp_trust_weight(1.23), 1.23);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for next in [
            TradeState::Pending,
            TradeState::Open,
            TradeState::PartialClose,
            TradeState::Closed,
            TradeState::Discarded,
        ] {
            assert!(!TradeState::Closed.can_transition_to(next));
            assert!(!TradeState::Discarded.can_transition_to(next));
        }
    }

    #[test]
    fn lifecycle_edges() {
        assert!(TradeState::Pending.can_transition_to(TradeState::Open));
        assert!(TradeState::Pending.can_transition_to(TradeState::Discarded));
        assert!(TradeState::Open.can_transition_to(TradeState::PartialClose));
        assert!(TradeState::Open.can_transition_to(TradeState::Closed));
        assert!(TradeState::PartialClose.can_transition_to(TradeState::Closed));
        // No skipping back to partial once fully closed
        assert!(!TradeState::PartialClose.can_transition_to(TradeState::Open));
        assert!(!TradeState::Pending.can_transition_to(TradeState::PartialClose));
    }

    #[test]
    fn pattern_key_is_order_insensitive() {
        let a = pattern_key(
            &["trader_b".to_string(), "trader_a".to_string()],
            TechBucket::BullishTech,
        );
        let b = pattern_key(
            &["trader_a".to_string(), "trader_b".to_string()],
            TechBucket::BullishTech,
        );
        assert_eq!(a, b);
        assert_eq!(a, "trader_a+trader_b|bullish_tech");
    }
}
