use serde::{Deserialize, Serialize};
use signal_core::{
    AdjustRequest, Decision, DecisionAction, EntryStrategy, SourceAttribution,
};

use crate::error::{InferenceError, InferenceResult};

/// Wire form of a decision as the reasoning service returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionResponse {
    pub action: String,
    pub symbol: String,
    /// [0.0, 1.0]
    pub confidence: f64,
    #[serde(default)]
    pub entry: Option<EntrySpec>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Vec<f64>,
    #[serde(default)]
    pub position_size_pct: Option<f64>,
    #[serde(default)]
    pub risk_reward: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub sources: Vec<SourceMention>,
    // ADJUST-only fields
    #[serde(default)]
    pub trade_id: Option<i64>,
    #[serde(default)]
    pub new_stop_loss: Option<f64>,
    #[serde(default)]
    pub new_take_profit: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntrySpec {
    pub price: f64,
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_strategy() -> String {
    "market".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceMention {
    pub source_id: String,
    #[serde(default)]
    pub agrees: bool,
    #[serde(default)]
    pub excerpt: String,
}

impl DecisionResponse {
    /// Validate the wire decision into the domain type. Trading actions
    /// must carry a full level set; SKIP and ADJUST need less.
    pub fn into_decision(self) -> InferenceResult<Decision> {
        let action = match self.action.to_ascii_uppercase().as_str() {
            "LONG" => DecisionAction::Long,
            "SHORT" => DecisionAction::Short,
            "SKIP" => DecisionAction::Skip,
            "ADJUST" => DecisionAction::Adjust,
            other => {
                return Err(InferenceError::MalformedResponse(format!(
                    "unknown action {other}"
                )))
            }
        };

        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(InferenceError::MalformedResponse(format!(
                "confidence {} out of range",
                self.confidence
            )));
        }

        let adjust = if action == DecisionAction::Adjust {
            let trade_id = self.trade_id.ok_or_else(|| {
                InferenceError::MalformedResponse("ADJUST without trade_id".to_string())
            })?;
            Some(AdjustRequest {
                trade_id,
                new_stop_loss: self.new_stop_loss,
                new_take_profits: self.new_take_profit,
            })
        } else {
            None
        };

        let (entry_price, entry_strategy, stop_loss, tp1, tp2) = if action.direction().is_some() {
            let entry = self.entry.as_ref().ok_or_else(|| {
                InferenceError::MalformedResponse("trade decision without entry".to_string())
            })?;
            let stop = self.stop_loss.ok_or_else(|| {
                InferenceError::MalformedResponse("trade decision without stop_loss".to_string())
            })?;
            let tp1 = self.take_profit.first().copied().ok_or_else(|| {
                InferenceError::MalformedResponse("trade decision without take_profit".to_string())
            })?;
            let strategy = if entry.strategy.eq_ignore_ascii_case("limit") {
                EntryStrategy::Limit
            } else {
                EntryStrategy::Market
            };
            (
                entry.price,
                strategy,
                stop,
                tp1,
                self.take_profit.get(1).copied(),
            )
        } else {
            (0.0, EntryStrategy::Market, 0.0, 0.0, None)
        };

        Ok(Decision {
            instrument: self.symbol,
            action,
            confidence: self.confidence,
            entry_price,
            entry_strategy,
            stop_loss,
            take_profit_1: tp1,
            take_profit_2: tp2,
            size_pct: self.position_size_pct.unwrap_or(0.0),
            risk_reward: self.risk_reward.unwrap_or(0.0),
            rationale: self.reasoning,
            sources: self
                .sources
                .into_iter()
                .map(|s| SourceAttribution {
                    source_id: s.source_id,
                    agrees: s.agrees,
                    excerpt: s.excerpt,
                })
                .collect(),
            adjust,
        })
    }
}

/// Post-trade review: overall take plus per-source grading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeReview {
    pub rationale: String,
    /// [0.0, 1.0] quality score for the trade as a whole.
    pub overall_score: f64,
    #[serde(default)]
    pub source_reviews: Vec<SourceReview>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReview {
    pub source_id: String,
    pub was_correct: bool,
    /// Bounded nudge the reviewer suggests on top of the accuracy-driven
    /// weight, in weight units.
    #[serde(default)]
    pub weight_nudge: f64,
}

/// Reviewer nudges are advisory; anything outside this band is clipped.
pub const MAX_WEIGHT_NUDGE: f64 = 0.1;

impl SourceReview {
    pub fn bounded_nudge(&self) -> f64 {
        self.weight_nudge.clamp(-MAX_WEIGHT_NUDGE, MAX_WEIGHT_NUDGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_decision_parses() {
        let raw: DecisionResponse = serde_json::from_value(serde_json::json!({
            "action": "long",
            "symbol": "BTCUSDT",
            "confidence": 0.72,
            "entry": {"price": 42000.0, "strategy": "market"},
            "stop_loss": 41000.0,
            "take_profit": [43500.0, 45000.0],
            "position_size_pct": 2.0,
            "risk_reward": 1.8,
            "reasoning": "two sources agree with 1h momentum",
            "sources": [{"source_id": "trader_a", "agrees": true, "excerpt": "btc long"}]
        }))
        .unwrap();
        let decision = raw.into_decision().unwrap();
        assert_eq!(decision.action, DecisionAction::Long);
        assert_eq!(decision.take_profit_2, Some(45000.0));
        assert_eq!(decision.sources.len(), 1);
    }

    #[test]
    fn trade_without_levels_is_malformed() {
        let raw: DecisionResponse = serde_json::from_value(serde_json::json!({
            "action": "SHORT",
            "symbol": "ETHUSDT",
            "confidence": 0.8
        }))
        .unwrap();
        assert!(raw.into_decision().is_err());
    }

    #[test]
    fn skip_needs_no_levels() {
        let raw: DecisionResponse = serde_json::from_value(serde_json::json!({
            "action": "SKIP",
            "symbol": "BTCUSDT",
            "confidence": 0.3,
            "reasoning": "sources conflict"
        }))
        .unwrap();
        let decision = raw.into_decision().unwrap();
        assert_eq!(decision.action, DecisionAction::Skip);
    }

    #[test]
    fn adjust_requires_trade_id() {
        let raw: DecisionResponse = serde_json::from_value(serde_json::json!({
            "action": "ADJUST",
            "symbol": "BTCUSDT",
            "confidence": 0.9,
            "new_stop_loss": 41500.0
        }))
        .unwrap();
        assert!(raw.into_decision().is_err());
    }

    #[test]
    fn confidence_out_of_range_rejected() {
        let raw: DecisionResponse = serde_json::from_value(serde_json::json!({
            "action": "SKIP",
            "symbol": "BTCUSDT",
            "confidence": 72.0
        }))
        .unwrap();
        assert!(raw.into_decision().is_err());
    }

    #[test]
    fn reviewer_nudges_are_clipped() {
        let review = SourceReview {
            source_id: "trader_a".to_string(),
            was_correct: true,
            weight_nudge: 0.5,
        };
        assert_eq!(review.bounded_nudge(), MAX_WEIGHT_NUDGE);
    }
}
