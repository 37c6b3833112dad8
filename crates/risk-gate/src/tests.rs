use chrono::Utc;
use signal_core::{
    Decision, DecisionAction, Direction, EntryStrategy, RiskCounters, Trade, TradeState,
};

use crate::fees::FeeSchedule;
use crate::gate::{evaluate, fee_adjusted_risk_reward, GateVerdict, RejectReason};
use crate::params::{RetuneProposal, RiskParameters, MIN_CONFIDENCE_RANGE, MIN_RISK_REWARD_RANGE};

fn decision() -> Decision {
    Decision {
        instrument: "BTCUSDT".to_string(),
        action: DecisionAction::Long,
        confidence: 0.75,
        entry_price: 100.0,
        entry_strategy: EntryStrategy::Market,
        stop_loss: 95.0,
        take_profit_1: 110.0,
        take_profit_2: Some(120.0),
        size_pct: 2.0,
        risk_reward: 2.0,
        rationale: "test setup".to_string(),
        sources: vec![],
        adjust: None,
    }
}

fn counters() -> RiskCounters {
    RiskCounters {
        trades_today: 0,
        daily_pnl_pct: 0.0,
        consecutive_losses: 0,
        cumulative_pnl_pct: 0.0,
        seconds_since_last_trade: None,
    }
}

fn open_trade(instrument: &str, direction: Direction, state: TradeState) -> Trade {
    Trade {
        id: 1,
        instrument: instrument.to_string(),
        direction,
        entry_price: 100.0,
        stop_loss: 95.0,
        take_profit_1: 110.0,
        take_profit_2: None,
        size_pct: 2.0,
        leverage: 10.0,
        initial_quantity: 0.5,
        state,
        confidence: 0.7,
        rationale: String::new(),
        tech_bucket: None,
        entry_order_id: None,
        opened_at: Some(Utc::now()),
        closed_at: None,
        partial_exit_price: None,
        exit_price: None,
        realized_pnl_pct: None,
        outcome: None,
        review_text: None,
        created_at: Utc::now(),
    }
}

fn reason(verdict: &GateVerdict) -> RejectReason {
    match verdict {
        GateVerdict::Rejected { reason, .. } => *reason,
        GateVerdict::Approved => panic!("expected rejection, got approval"),
    }
}

#[test]
fn clean_decision_approved() {
    let v = evaluate(
        &decision(),
        &counters(),
        &[],
        &RiskParameters::default(),
        &FeeSchedule::default(),
    );
    assert!(v.approved());
}

#[test]
fn evaluation_is_idempotent() {
    let d = decision();
    let c = counters();
    let p = RiskParameters::default();
    let f = FeeSchedule::default();
    let first = evaluate(&d, &c, &[], &p, &f);
    let second = evaluate(&d, &c, &[], &p, &f);
    assert_eq!(first, second);
}

#[test]
fn confidence_floor_is_inclusive() {
    let params = RiskParameters::default();
    let fees = FeeSchedule::default();

    let mut d = decision();
    d.confidence = 0.60;
    assert!(evaluate(&d, &counters(), &[], &params, &fees).approved());

    d.confidence = 0.599;
    let v = evaluate(&d, &counters(), &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::LowConfidence);
}

#[test]
fn daily_loss_hard_vs_soft() {
    let params = RiskParameters::default();
    let fees = FeeSchedule::default();

    let mut c = counters();
    c.daily_pnl_pct = -20.0;
    let v = evaluate(&decision(), &c, &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::DailyLossHard);

    // Just inside the hard limit still trips the soft ceiling
    c.daily_pnl_pct = -19.99;
    let v = evaluate(&decision(), &c, &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::DailyLossSoft);

    c.daily_pnl_pct = -14.99;
    assert!(evaluate(&decision(), &c, &[], &params, &fees).approved());
}

#[test]
fn kill_switch_takes_priority() {
    let params = RiskParameters::default();
    let fees = FeeSchedule::default();

    let mut c = counters();
    c.cumulative_pnl_pct = -41.0;
    c.daily_pnl_pct = -25.0;
    let mut d = decision();
    d.confidence = 0.1; // would also fail confidence, but kill switch wins
    let v = evaluate(&d, &c, &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::KillSwitch);
    assert!(reason(&v).is_fatal());
}

#[test]
fn oversized_position_rejected_regardless_of_quality() {
    let params = RiskParameters::default();
    let fees = FeeSchedule::default();

    let mut d = decision();
    d.size_pct = 6.0;
    d.confidence = 0.99;
    d.take_profit_1 = 150.0; // excellent RR
    let v = evaluate(&d, &counters(), &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::OversizedPosition);

    // The cap itself is allowed
    d.size_pct = 5.0;
    assert!(evaluate(&d, &counters(), &[], &params, &fees).approved());
}

#[test]
fn duplicate_exposure_rejected() {
    let params = RiskParameters::default();
    let fees = FeeSchedule::default();

    let open = [open_trade("BTCUSDT", Direction::Long, TradeState::Open)];
    let v = evaluate(&decision(), &counters(), &open, &params, &fees);
    assert_eq!(reason(&v), RejectReason::DuplicatePosition);

    // Partial closes still count as exposure
    let partial = [open_trade(
        "BTCUSDT",
        Direction::Long,
        TradeState::PartialClose,
    )];
    let v = evaluate(&decision(), &counters(), &partial, &params, &fees);
    assert_eq!(reason(&v), RejectReason::DuplicatePosition);

    // A closed trade on the instrument is not exposure
    let closed = [open_trade("BTCUSDT", Direction::Long, TradeState::Closed)];
    assert!(evaluate(&decision(), &counters(), &closed, &params, &fees).approved());

    // Different instrument is fine
    let other = [open_trade("ETHUSDT", Direction::Long, TradeState::Open)];
    assert!(evaluate(&decision(), &counters(), &other, &params, &fees).approved());

    // The opposite side is rejected too: one exposed trade per
    // instrument, never a netting hedge
    let short = [open_trade("BTCUSDT", Direction::Short, TradeState::Open)];
    let v = evaluate(&decision(), &counters(), &short, &params, &fees);
    assert_eq!(reason(&v), RejectReason::DuplicatePosition);
}

#[test]
fn cooldown_blocks_rapid_reentry() {
    let params = RiskParameters::default();
    let fees = FeeSchedule::default();

    let mut c = counters();
    c.seconds_since_last_trade = Some(120);
    let v = evaluate(&decision(), &c, &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::Cooldown);

    c.seconds_since_last_trade = Some(300);
    assert!(evaluate(&decision(), &c, &[], &params, &fees).approved());
}

#[test]
fn whitelist_enforced() {
    let params = RiskParameters::default();
    let fees = FeeSchedule::default();

    let mut d = decision();
    d.instrument = "PEPEUSDT".to_string();
    let v = evaluate(&d, &counters(), &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::NotWhitelisted);
}

#[test]
fn consecutive_losses_and_trade_cap() {
    let params = RiskParameters::default();
    let fees = FeeSchedule::default();

    let mut c = counters();
    c.consecutive_losses = 3;
    let v = evaluate(&decision(), &c, &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::ConsecutiveLosses);

    let mut c = counters();
    c.trades_today = 20;
    let v = evaluate(&decision(), &c, &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::DailyTradeCap);
}

#[test]
fn fee_adjustment_rejects_thin_targets() {
    let params = RiskParameters::default();
    let fees = FeeSchedule {
        taker_fee_rate: 0.001,
        slippage_rate: 0.0005,
    };

    // Nominal RR = 10/5 = 2.0, but fees pull the adjusted RR down
    let mut d = decision();
    d.stop_loss = 99.0;
    d.take_profit_1 = 101.5; // nominal 1.5, adjusted well below
    let adjusted = fee_adjusted_risk_reward(&d, &fees);
    assert!(adjusted < 1.5, "adjusted RR {} should be < 1.5", adjusted);
    let v = evaluate(&d, &counters(), &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::PoorRiskReward);
}

#[test]
fn skip_and_adjust_do_not_open_positions() {
    let params = RiskParameters::default();
    let fees = FeeSchedule::default();

    let mut d = decision();
    d.action = DecisionAction::Skip;
    let v = evaluate(&d, &counters(), &[], &params, &fees);
    assert_eq!(reason(&v), RejectReason::NotActionable);
}

#[test]
fn retune_clamps_into_safe_ranges() {
    let params = RiskParameters::default();
    let proposal = RetuneProposal {
        min_confidence: Some(0.95),
        min_risk_reward: Some(0.5),
        ..Default::default()
    };
    let next = params.apply_retune(&proposal);
    assert_eq!(next.version, params.version + 1);
    assert_eq!(next.min_confidence, MIN_CONFIDENCE_RANGE.1);
    assert_eq!(next.min_risk_reward, MIN_RISK_REWARD_RANGE.0);
    // Untouched soft fields carry over
    assert_eq!(next.cooldown_secs, params.cooldown_secs);
}
