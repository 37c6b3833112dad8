use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use exchange_broker::{ExchangeClient, ExchangePosition};
use market_data::MarketDataClient;
use risk_gate::{FeeSchedule, RiskParameters};
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use signal_core::{LearningEventKind, Trade, TradeOutcome, TradeState};
use telegram_notifier::TelegramNotifier;
use trade_store::TradeStore;

use crate::learning::LearningLoop;

/// An exit further beyond the stop than this fraction of the stop level
/// reads as a liquidation, not a stop fill.
pub const LIQUIDATION_BAND: f64 = 0.01;

/// Remaining quantity below this fraction of the initial fill means the
/// TP1 half has been taken.
pub const PARTIAL_REMAINING_FRACTION: f64 = 0.7;

/// Periodic truth sync between the store's idea of exposure and the
/// exchange's. One batched position query per cycle; every divergence is
/// classified and folded back into the trade record.
pub struct Reconciler {
    store: Arc<TradeStore>,
    exchange: Arc<dyn ExchangeClient>,
    market: MarketDataClient,
    notifier: Arc<TelegramNotifier>,
    learning: Arc<LearningLoop>,
    fees: FeeSchedule,
    /// Consecutive stop-breach observations per trade.
    stop_breaches: DashMap<i64, u32>,
    stop_breach_limit: u32,
    /// Last price seen per instrument, for classifying exits observed
    /// only as a flat position.
    last_prices: DashMap<String, f64>,
}

impl Reconciler {
    pub fn new(
        store: Arc<TradeStore>,
        exchange: Arc<dyn ExchangeClient>,
        market: MarketDataClient,
        notifier: Arc<TelegramNotifier>,
        learning: Arc<LearningLoop>,
        stop_breach_limit: u32,
    ) -> Self {
        Self {
            store,
            exchange,
            market,
            notifier,
            learning,
            fees: FeeSchedule::default(),
            stop_breaches: DashMap::new(),
            stop_breach_limit,
            last_prices: DashMap::new(),
        }
    }

    pub async fn run_cycle(&self) -> Result<()> {
        let trades = self.store.exposed_trades().await?;
        if trades.is_empty() {
            return Ok(());
        }
        let params = self.store.latest_risk_parameters().await?;

        match self.exchange.get_positions().await {
            Ok(positions) => {
                let by_symbol: HashMap<String, ExchangePosition> = positions
                    .into_iter()
                    .map(|p| (p.symbol.clone(), p))
                    .collect();
                for trade in trades {
                    let position = by_symbol.get(&trade.instrument);
                    if let Err(e) = self.reconcile_trade(&trade, position, &params).await {
                        tracing::error!("reconcile failed for trade #{}: {}", trade.id, e);
                    }
                }
            }
            Err(e) => {
                // Exchange state unknown: approximate the classification
                // from cached market prices until the transport recovers.
                tracing::warn!("position query failed, degraded cycle: {}", e);
                for trade in trades {
                    let Some(price) = self.last_price_for(&trade.instrument).await else {
                        continue;
                    };
                    if let Err(err) = self.reconcile_from_price(&trade, price, &params).await {
                        tracing::error!(
                            "degraded reconcile failed for trade #{}: {}",
                            trade.id,
                            err
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn reconcile_trade(
        &self,
        trade: &Trade,
        position: Option<&ExchangePosition>,
        params: &RiskParameters,
    ) -> Result<()> {
        let quantity = position
            .map(|p| p.position_amt_decimal().to_f64().unwrap_or(0.0).abs())
            .unwrap_or(0.0);
        let mark_price = position
            .and_then(|p| p.mark_price_decimal().to_f64())
            .filter(|p| *p > 0.0);
        if let Some(price) = mark_price {
            self.last_prices.insert(trade.instrument.clone(), price);
        }

        if quantity <= f64::EPSILON {
            return self.handle_flat(trade, params).await;
        }

        if trade.state == TradeState::Open
            && quantity < PARTIAL_REMAINING_FRACTION * trade.initial_quantity
        {
            return self.handle_partial(trade).await;
        }

        if let Some(price) = mark_price {
            self.watch_stop(trade, price).await;
        }
        Ok(())
    }

    /// The exchange shows no position but the store says exposed: the
    /// position ended outside our control (stop, TP ladder, liquidation,
    /// manual close on the venue). Classify from the last seen price.
    async fn handle_flat(&self, trade: &Trade, params: &RiskParameters) -> Result<()> {
        let last_price = match self.last_price_for(&trade.instrument).await {
            Some(price) => price,
            None => {
                tracing::warn!(
                    "trade #{} is flat on exchange but no price is available yet",
                    trade.id
                );
                return Ok(());
            }
        };

        let outcome = classify_exit(trade, last_price, params.tolerance_pct);
        let exit_price = estimate_exit_price(trade, outcome, last_price, params.tolerance_pct);
        let pnl = realized_pnl_pct(trade, exit_price, &self.fees);

        // Clear any leftover TP order before recording the close.
        if let Err(e) = self.exchange.cancel_all_orders(&trade.instrument).await {
            tracing::warn!("orphan order cleanup failed for {}: {}", trade.instrument, e);
        }

        if !self
            .store
            .close_trade(trade.id, exit_price, pnl, outcome)
            .await?
        {
            // Another path already closed it.
            return Ok(());
        }
        self.stop_breaches.remove(&trade.id);
        tracing::info!(
            "trade #{} {} closed: {} at {:.2} ({:+.2}%)",
            trade.id,
            trade.instrument,
            outcome.as_str(),
            exit_price,
            pnl
        );

        let headline = match outcome {
            TradeOutcome::Liquidated => "LIQUIDATED",
            TradeOutcome::Anomalous => "Closed (unexplained exit)",
            TradeOutcome::TargetHit => "Target hit",
            TradeOutcome::Stopped => "Stopped out",
            TradeOutcome::Manual => "Closed manually",
        };
        self.notifier
            .send_message(&format!(
                "*{}* — {} #{}\nExit: {:.2} | PnL: {:+.2}%",
                headline, trade.instrument, trade.id, exit_price, pnl
            ))
            .await
            .ok();

        if let Err(e) = self.learning.on_trade_closed(trade.id).await {
            tracing::error!("learning failed for trade #{}: {}", trade.id, e);
        }
        Ok(())
    }

    /// TP1 took roughly half: record the partial and move the stop to a
    /// fee-adjusted breakeven so the rest of the position cannot turn the
    /// trade into a loss.
    async fn handle_partial(&self, trade: &Trade) -> Result<()> {
        if !self
            .store
            .mark_trade_partial(trade.id, trade.take_profit_1)
            .await?
        {
            return Ok(());
        }
        let breakeven = breakeven_stop(trade, &self.fees);
        self.store.update_trade_stop(trade.id, breakeven).await?;
        tracing::info!(
            "trade #{} {} partial close at TP1, stop moved to {:.2}",
            trade.id,
            trade.instrument,
            breakeven
        );
        self.notifier
            .send_message(&format!(
                "*Partial close* — {} #{}\nTP1 {:.2} filled, stop now breakeven {:.2}",
                trade.instrument, trade.id, trade.take_profit_1, breakeven
            ))
            .await
            .ok();
        Ok(())
    }

    /// The exchange should close a breached stop itself. When the price
    /// sits past the stop for several consecutive cycles the protective
    /// order has evidently failed, so close at market.
    async fn watch_stop(&self, trade: &Trade, price: f64) {
        let sign = trade.direction.sign();
        let breached = sign * (trade.stop_loss - price) > 0.0;
        if !breached {
            self.stop_breaches.remove(&trade.id);
            return;
        }

        let breaches = {
            let mut entry = self.stop_breaches.entry(trade.id).or_insert(0);
            *entry += 1;
            *entry
        };
        tracing::warn!(
            "trade #{} price {:.2} past stop {:.2} ({}/{})",
            trade.id,
            price,
            trade.stop_loss,
            breaches,
            self.stop_breach_limit
        );
        if breaches < self.stop_breach_limit {
            return;
        }

        tracing::error!(
            "trade #{} stop not honored after {} checks, forcing market close",
            trade.id,
            breaches
        );
        let quantity = remaining_quantity(trade);
        match self
            .exchange
            .close_position_market(&trade.instrument, trade.direction, quantity)
            .await
        {
            Ok(_) => {
                self.stop_breaches.remove(&trade.id);
                self.notifier
                    .send_message(&format!(
                        "*Forced close* — {} #{}\nStop {:.2} was not honored by the exchange; \
                         position closed at market.",
                        trade.instrument, trade.id, trade.stop_loss
                    ))
                    .await
                    .ok();
                // The flat position is picked up and classified next cycle.
            }
            Err(e) => {
                tracing::error!("forced close failed for trade #{}: {}", trade.id, e);
            }
        }
    }

    /// Degraded-mode reconcile: the exchange cannot be asked, so the
    /// price alone decides. A low-confidence close is recorded when the
    /// price sits past a terminal level; in-between prices change
    /// nothing, and the stop watchdog keeps counting.
    async fn reconcile_from_price(
        &self,
        trade: &Trade,
        price: f64,
        params: &RiskParameters,
    ) -> Result<()> {
        match fallback_action(trade, price, params.tolerance_pct) {
            None => {
                self.watch_stop(trade, price).await;
                Ok(())
            }
            Some(FallbackAction::PartialFill) => self.handle_partial(trade).await,
            Some(FallbackAction::Exit(outcome)) => {
                let exit_price = estimate_exit_price(trade, outcome, price, params.tolerance_pct);
                let pnl = realized_pnl_pct(trade, exit_price, &self.fees);
                if !self
                    .store
                    .close_trade(trade.id, exit_price, pnl, outcome)
                    .await?
                {
                    return Ok(());
                }
                self.stop_breaches.remove(&trade.id);
                tracing::warn!(
                    "trade #{} {} closed from cached price (exchange unreachable): {} at {:.2} ({:+.2}%)",
                    trade.id,
                    trade.instrument,
                    outcome.as_str(),
                    exit_price,
                    pnl
                );
                self.store
                    .record_learning_event(
                        LearningEventKind::DataAnomaly,
                        &format!(
                            "trade #{} classified {} from cached price while the exchange was unreachable",
                            trade.id,
                            outcome.as_str()
                        ),
                        &json!({
                            "trade_id": trade.id,
                            "outcome": outcome.as_str(),
                            "reference_price": price,
                            "low_confidence": true,
                        }),
                    )
                    .await?;
                self.notifier
                    .send_message(&format!(
                        "*{} (low confidence)* — {} #{}\nExit: {:.2} | PnL: {:+.2}%\n\
                         Exchange unreachable; classified from the cached market price.",
                        outcome.as_str(),
                        trade.instrument,
                        trade.id,
                        exit_price,
                        pnl
                    ))
                    .await
                    .ok();
                if let Err(e) = self.learning.on_trade_closed(trade.id).await {
                    tracing::error!("learning failed for trade #{}: {}", trade.id, e);
                }
                Ok(())
            }
        }
    }

    async fn last_price_for(&self, instrument: &str) -> Option<f64> {
        if let Ok(price) = self.market.current_price(instrument).await {
            self.last_prices.insert(instrument.to_string(), price);
            return Some(price);
        }
        self.last_prices.get(instrument).map(|p| *p)
    }
}

/// Quantity still on the exchange according to the store's state.
pub fn remaining_quantity(trade: &Trade) -> f64 {
    match trade.state {
        TradeState::PartialClose => trade.initial_quantity / 2.0,
        _ => trade.initial_quantity,
    }
}

/// Classify a position that ended outside our control, from the last
/// price seen. Adverse exits are checked before favorable ones so a
/// liquidation can never be mistaken for a target.
pub fn classify_exit(trade: &Trade, last_price: f64, tolerance_pct: f64) -> TradeOutcome {
    let sign = trade.direction.sign();
    let stop = trade.stop_loss;

    // Fraction of the stop level the price sits past it, adverse side.
    let past_stop = if stop.abs() > 0.0 {
        sign * (stop - last_price) / stop.abs()
    } else {
        0.0
    };
    if past_stop > LIQUIDATION_BAND {
        return TradeOutcome::Liquidated;
    }
    if past_stop > 0.0 || within_band(last_price, stop, tolerance_pct) {
        return TradeOutcome::Stopped;
    }

    if let Some(tp2) = trade.take_profit_2 {
        if within_band(last_price, tp2, tolerance_pct) || sign * (last_price - tp2) >= 0.0 {
            return TradeOutcome::TargetHit;
        }
    }
    if within_band(last_price, trade.take_profit_1, tolerance_pct)
        || sign * (last_price - trade.take_profit_1) >= 0.0
    {
        return TradeOutcome::TargetHit;
    }

    TradeOutcome::Anomalous
}

/// Best estimate of the actual exit fill for PnL accounting.
pub fn estimate_exit_price(
    trade: &Trade,
    outcome: TradeOutcome,
    last_price: f64,
    tolerance_pct: f64,
) -> f64 {
    match outcome {
        TradeOutcome::Stopped => trade.stop_loss,
        TradeOutcome::TargetHit => match trade.take_profit_2 {
            Some(tp2) if tp2_reached(trade, last_price, tolerance_pct) => tp2,
            _ => trade.take_profit_1,
        },
        TradeOutcome::Liquidated | TradeOutcome::Anomalous | TradeOutcome::Manual => last_price,
    }
}

fn tp2_reached(trade: &Trade, last_price: f64, tolerance_pct: f64) -> bool {
    match trade.take_profit_2 {
        Some(tp2) => {
            within_band(last_price, tp2, tolerance_pct)
                || trade.direction.sign() * (last_price - tp2) >= 0.0
        }
        None => false,
    }
}

/// What the degraded cycle should do for one trade, from the price alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    /// Price reached TP1 on a two-target trade: assume the half fill.
    PartialFill,
    /// Price sits past a terminal level: assume the position is gone.
    Exit(TradeOutcome),
}

/// Approximate the exit classification without exchange state. None means
/// the price gives no evidence the position changed: between the levels,
/// or at a level the current lifecycle state says is not terminal.
pub fn fallback_action(trade: &Trade, price: f64, tolerance_pct: f64) -> Option<FallbackAction> {
    match classify_exit(trade, price, tolerance_pct) {
        TradeOutcome::Anomalous => None,
        TradeOutcome::TargetHit => {
            let final_target = tp2_reached(trade, price, tolerance_pct);
            match trade.state {
                // TP1 on a two-target trade takes half, not the position.
                TradeState::Open if trade.take_profit_2.is_some() && !final_target => {
                    Some(FallbackAction::PartialFill)
                }
                // After the partial only TP2 can finish the trade; a
                // price back near TP1 proves nothing.
                TradeState::PartialClose if !final_target => None,
                _ => Some(FallbackAction::Exit(TradeOutcome::TargetHit)),
            }
        }
        outcome => Some(FallbackAction::Exit(outcome)),
    }
}

/// Realized PnL as a percent of margin. A partial-closed trade realizes
/// half at the recorded partial fill and half at the final exit.
pub fn realized_pnl_pct(trade: &Trade, exit_price: f64, fees: &FeeSchedule) -> f64 {
    let sign = trade.direction.sign();
    match (trade.state, trade.partial_exit_price) {
        (TradeState::PartialClose, Some(partial)) => {
            0.5 * fees.net_pnl_pct(sign, trade.entry_price, partial, trade.leverage)
                + 0.5 * fees.net_pnl_pct(sign, trade.entry_price, exit_price, trade.leverage)
        }
        _ => fees.net_pnl_pct(sign, trade.entry_price, exit_price, trade.leverage),
    }
}

/// Breakeven stop after TP1: entry shifted by the round-trip cost in the
/// profit direction, so a stop-out there still nets zero.
pub fn breakeven_stop(trade: &Trade, fees: &FeeSchedule) -> f64 {
    trade.entry_price * (1.0 + trade.direction.sign() * fees.round_trip_rate())
}

fn within_band(price: f64, level: f64, tolerance_pct: f64) -> bool {
    (price - level).abs() <= level.abs() * tolerance_pct
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use signal_core::Direction;

    fn trade(direction: Direction, state: TradeState) -> Trade {
        let (entry, stop, tp1, tp2) = match direction {
            Direction::Long => (100.0, 95.0, 110.0, Some(120.0)),
            Direction::Short => (100.0, 105.0, 90.0, Some(80.0)),
        };
        Trade {
            id: 7,
            instrument: "BTCUSDT".to_string(),
            direction,
            entry_price: entry,
            stop_loss: stop,
            take_profit_1: tp1,
            take_profit_2: tp2,
            size_pct: 2.0,
            leverage: 10.0,
            initial_quantity: 1.0,
            state,
            confidence: 0.7,
            rationale: String::new(),
            tech_bucket: None,
            entry_order_id: None,
            opened_at: Some(Utc::now()),
            closed_at: None,
            partial_exit_price: match state {
                TradeState::PartialClose => Some(tp1),
                _ => None,
            },
            exit_price: None,
            realized_pnl_pct: None,
            outcome: None,
            review_text: None,
            created_at: Utc::now(),
        }
    }

    const TOL: f64 = 0.005;

    #[test]
    fn exit_near_tp1_is_a_target_hit() {
        let t = trade(Direction::Long, TradeState::Open);
        // 110.02 sits inside the 0.5% band around 110
        assert_eq!(classify_exit(&t, 110.02, TOL), TradeOutcome::TargetHit);
        // Classification does not depend on the prior lifecycle state
        let p = trade(Direction::Long, TradeState::PartialClose);
        assert_eq!(classify_exit(&p, 110.02, TOL), TradeOutcome::TargetHit);
    }

    #[test]
    fn exit_bands_cover_the_whole_ladder() {
        let t = trade(Direction::Long, TradeState::Open);
        assert_eq!(classify_exit(&t, 95.1, TOL), TradeOutcome::Stopped);
        // Past the stop but inside the liquidation band still reads stopped
        assert_eq!(classify_exit(&t, 94.5, TOL), TradeOutcome::Stopped);
        // Far past the stop reads liquidated
        assert_eq!(classify_exit(&t, 93.0, TOL), TradeOutcome::Liquidated);
        // Between the levels is unexplained
        assert_eq!(classify_exit(&t, 101.0, TOL), TradeOutcome::Anomalous);
        // Beyond TP2 is still a target hit
        assert_eq!(classify_exit(&t, 125.0, TOL), TradeOutcome::TargetHit);
    }

    #[test]
    fn short_side_mirrors() {
        let t = trade(Direction::Short, TradeState::Open);
        assert_eq!(classify_exit(&t, 104.9, TOL), TradeOutcome::Stopped);
        assert_eq!(classify_exit(&t, 107.0, TOL), TradeOutcome::Liquidated);
        assert_eq!(classify_exit(&t, 89.97, TOL), TradeOutcome::TargetHit);
        assert_eq!(classify_exit(&t, 97.0, TOL), TradeOutcome::Anomalous);
    }

    #[test]
    fn target_exit_price_picks_the_level_reached() {
        let t = trade(Direction::Long, TradeState::Open);
        assert_eq!(
            estimate_exit_price(&t, TradeOutcome::TargetHit, 110.02, TOL),
            110.0
        );
        assert_eq!(
            estimate_exit_price(&t, TradeOutcome::TargetHit, 121.0, TOL),
            120.0
        );
        assert_eq!(estimate_exit_price(&t, TradeOutcome::Stopped, 94.9, TOL), 95.0);
    }

    #[test]
    fn partial_trades_blend_both_fills() {
        let fees = FeeSchedule::default();
        let open = trade(Direction::Long, TradeState::Open);
        let partial = trade(Direction::Long, TradeState::PartialClose);

        let full = realized_pnl_pct(&open, 110.0, &fees);
        // Fully closed at TP1: both halves at the same price, same result
        let blended_same = realized_pnl_pct(&partial, 110.0, &fees);
        assert!((full - blended_same).abs() < 1e-9);

        // Partial at TP1 (110), rest stopped at breakeven-ish 100:
        // average of the two legs
        let blended = realized_pnl_pct(&partial, 100.0, &fees);
        let leg_a = fees.net_pnl_pct(1.0, 100.0, 110.0, 10.0);
        let leg_b = fees.net_pnl_pct(1.0, 100.0, 100.0, 10.0);
        assert!((blended - 0.5 * (leg_a + leg_b)).abs() < 1e-9);
    }

    #[test]
    fn breakeven_stop_covers_the_fees() {
        let fees = FeeSchedule::default();
        let long = trade(Direction::Long, TradeState::Open);
        let be = breakeven_stop(&long, &fees);
        assert!(be > long.entry_price);
        // Stopping out exactly at breakeven nets ~zero
        assert!(realized_pnl_pct(&long, be, &fees).abs() < 1e-9);

        let short = trade(Direction::Short, TradeState::Open);
        assert!(breakeven_stop(&short, &fees) < short.entry_price);
    }

    #[test]
    fn fallback_reads_terminal_levels_only() {
        let t = trade(Direction::Long, TradeState::Open);
        // Between the levels: no evidence, nothing happens
        assert_eq!(fallback_action(&t, 101.0, TOL), None);
        // At or past the stop: assume the protective order fired
        assert_eq!(
            fallback_action(&t, 94.9, TOL),
            Some(FallbackAction::Exit(TradeOutcome::Stopped))
        );
        assert_eq!(
            fallback_action(&t, 93.0, TOL),
            Some(FallbackAction::Exit(TradeOutcome::Liquidated))
        );
        // TP1 on a two-target trade reads as the partial fill
        assert_eq!(
            fallback_action(&t, 110.02, TOL),
            Some(FallbackAction::PartialFill)
        );
        // Past TP2 the whole position is gone
        assert_eq!(
            fallback_action(&t, 121.0, TOL),
            Some(FallbackAction::Exit(TradeOutcome::TargetHit))
        );
    }

    #[test]
    fn fallback_respects_the_partial_state() {
        let p = trade(Direction::Long, TradeState::PartialClose);
        // Price back near TP1 proves nothing once the half is taken
        assert_eq!(fallback_action(&p, 110.02, TOL), None);
        assert_eq!(
            fallback_action(&p, 120.5, TOL),
            Some(FallbackAction::Exit(TradeOutcome::TargetHit))
        );

        // A single-target trade exits fully at TP1
        let mut single = trade(Direction::Long, TradeState::Open);
        single.take_profit_2 = None;
        assert_eq!(
            fallback_action(&single, 110.02, TOL),
            Some(FallbackAction::Exit(TradeOutcome::TargetHit))
        );
    }

    #[test]
    fn remaining_quantity_halves_after_partial() {
        assert_eq!(remaining_quantity(&trade(Direction::Long, TradeState::Open)), 1.0);
        assert_eq!(
            remaining_quantity(&trade(Direction::Long, TradeState::PartialClose)),
            0.5
        );
    }
}
