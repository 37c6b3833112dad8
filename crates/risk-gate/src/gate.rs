use serde::{Deserialize, Serialize};
use signal_core::{Decision, RiskCounters, Trade};

use crate::fees::FeeSchedule;
use crate::params::{
    RiskParameters, HARD_DAILY_LOSS_PCT, KILL_SWITCH_CUMULATIVE_PCT, MAX_POSITION_SIZE_PCT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    KillSwitch,
    DailyLossHard,
    DailyLossSoft,
    ConsecutiveLosses,
    DailyTradeCap,
    Cooldown,
    DuplicatePosition,
    NotWhitelisted,
    LowConfidence,
    PoorRiskReward,
    OversizedPosition,
    NotActionable,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::KillSwitch => "kill_switch",
            RejectReason::DailyLossHard => "daily_loss_hard",
            RejectReason::DailyLossSoft => "daily_loss_soft",
            RejectReason::ConsecutiveLosses => "consecutive_losses",
            RejectReason::DailyTradeCap => "daily_trade_cap",
            RejectReason::Cooldown => "cooldown",
            RejectReason::DuplicatePosition => "duplicate_position",
            RejectReason::NotWhitelisted => "not_whitelisted",
            RejectReason::LowConfidence => "low_confidence",
            RejectReason::PoorRiskReward => "poor_risk_reward",
            RejectReason::OversizedPosition => "oversized_position",
            RejectReason::NotActionable => "not_actionable",
        }
    }

    /// Kill-switch rejections halt the agent until a manual reset.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RejectReason::KillSwitch)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GateVerdict {
    Approved,
    Rejected { reason: RejectReason, detail: String },
}

impl GateVerdict {
    pub fn approved(&self) -> bool {
        matches!(self, GateVerdict::Approved)
    }

    fn reject(reason: RejectReason, detail: String) -> Self {
        GateVerdict::Rejected { reason, detail }
    }
}

/// Fee-adjusted risk/reward: both the reward and the risk leg absorb the
/// round-trip cost, so thin targets that only pay the fees score below 1.
pub fn fee_adjusted_risk_reward(decision: &Decision, fees: &FeeSchedule) -> f64 {
    let cost = fees.round_trip_cost(decision.entry_price);
    let reward = (decision.take_profit_1 - decision.entry_price).abs() - cost;
    let risk = (decision.entry_price - decision.stop_loss).abs() + cost;
    if risk <= 0.0 {
        return 0.0;
    }
    reward / risk
}

/// Evaluate a proposed decision against current exposure and counters.
///
/// Pure and synchronous: same inputs always give the same verdict, and
/// nothing is mutated. Checks run in a fixed order and the first failure
/// wins, so a rejection reason is stable under re-evaluation.
pub fn evaluate(
    decision: &Decision,
    counters: &RiskCounters,
    open_trades: &[Trade],
    params: &RiskParameters,
    fees: &FeeSchedule,
) -> GateVerdict {
    let direction = match decision.action.direction() {
        Some(d) => d,
        None => {
            return GateVerdict::reject(
                RejectReason::NotActionable,
                format!("action {} opens no position", decision.action.as_str()),
            )
        }
    };

    // 1. Kill switch on cumulative drawdown
    if counters.cumulative_pnl_pct <= KILL_SWITCH_CUMULATIVE_PCT {
        return GateVerdict::reject(
            RejectReason::KillSwitch,
            format!(
                "cumulative PnL {:.2}% breached kill switch at {:.0}%",
                counters.cumulative_pnl_pct, KILL_SWITCH_CUMULATIVE_PCT
            ),
        );
    }

    // 2. Hard daily loss ceiling
    if counters.daily_pnl_pct <= HARD_DAILY_LOSS_PCT {
        return GateVerdict::reject(
            RejectReason::DailyLossHard,
            format!(
                "daily PnL {:.2}% at hard limit {:.0}%",
                counters.daily_pnl_pct, HARD_DAILY_LOSS_PCT
            ),
        );
    }

    // 3. Soft daily loss ceiling (tunable)
    if counters.daily_pnl_pct <= params.soft_daily_loss_pct {
        return GateVerdict::reject(
            RejectReason::DailyLossSoft,
            format!(
                "daily PnL {:.2}% under soft limit {:.1}%",
                counters.daily_pnl_pct, params.soft_daily_loss_pct
            ),
        );
    }

    // 4. Consecutive loss streak
    if counters.consecutive_losses >= params.max_consecutive_losses {
        return GateVerdict::reject(
            RejectReason::ConsecutiveLosses,
            format!(
                "{} consecutive losses (limit {})",
                counters.consecutive_losses, params.max_consecutive_losses
            ),
        );
    }

    // 5. Daily trade count
    if counters.trades_today >= params.max_trades_per_day {
        return GateVerdict::reject(
            RejectReason::DailyTradeCap,
            format!(
                "{} trades today (cap {})",
                counters.trades_today, params.max_trades_per_day
            ),
        );
    }

    // 6. Per-instrument cooldown
    if let Some(elapsed) = counters.seconds_since_last_trade {
        if elapsed < params.cooldown_secs {
            return GateVerdict::reject(
                RejectReason::Cooldown,
                format!(
                    "{} opened {}s ago (cooldown {}s)",
                    decision.instrument, elapsed, params.cooldown_secs
                ),
            );
        }
    }

    // 7. Existing exposure on the instrument. Direction does not matter:
    // one exposed trade per instrument at a time, so an opposite-side
    // proposal is rejected rather than netted against the open position.
    if let Some(existing) = open_trades
        .iter()
        .find(|t| t.state.is_exposed() && t.instrument == decision.instrument)
    {
        return GateVerdict::reject(
            RejectReason::DuplicatePosition,
            format!(
                "{} already has an exposed {} trade (#{})",
                existing.instrument,
                existing.direction.as_str(),
                existing.id
            ),
        );
    }

    // 8. Whitelist
    if !params.whitelist.iter().any(|i| i == &decision.instrument) {
        return GateVerdict::reject(
            RejectReason::NotWhitelisted,
            format!("{} is not whitelisted", decision.instrument),
        );
    }

    // 9. Confidence floor (floor value itself passes)
    if decision.confidence < params.min_confidence {
        return GateVerdict::reject(
            RejectReason::LowConfidence,
            format!(
                "confidence {:.3} below floor {:.2}",
                decision.confidence, params.min_confidence
            ),
        );
    }

    // 10. Fee-adjusted risk/reward floor
    let rr = fee_adjusted_risk_reward(decision, fees);
    if rr < params.min_risk_reward {
        return GateVerdict::reject(
            RejectReason::PoorRiskReward,
            format!(
                "fee-adjusted RR {:.2} below floor {:.2} ({} {})",
                rr,
                params.min_risk_reward,
                decision.instrument,
                direction.as_str()
            ),
        );
    }

    // 11. Absolute position-size ceiling (hard, checked last so the
    //     rejection reason reflects the more specific failures first)
    if decision.size_pct > MAX_POSITION_SIZE_PCT {
        return GateVerdict::reject(
            RejectReason::OversizedPosition,
            format!(
                "size {:.1}% exceeds hard cap {:.0}%",
                decision.size_pct, MAX_POSITION_SIZE_PCT
            ),
        );
    }

    GateVerdict::Approved
}
