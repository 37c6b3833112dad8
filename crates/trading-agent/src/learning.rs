use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use inference_client::InferenceClient;
use market_data::MarketDataClient;
use risk_gate::{RetuneProposal, RiskParameters};
use serde_json::json;
use signal_core::{clamp_trust_weight, pattern_key, LearningEventKind, Trade, TradeState};
use telegram_notifier::TelegramNotifier;
use trade_store::TradeStore;

/// Patterns qualify for a discovery report once they have this much
/// history at this win rate.
const PATTERN_MIN_OCCURRENCES: i64 = 3;
const PATTERN_MIN_WIN_RATE: f64 = 0.65;

/// Candidate floors the retune sweeps over.
const CONFIDENCE_FLOOR_GRID: &[f64] = &[0.55, 0.60, 0.65, 0.70, 0.75];
const RISK_REWARD_FLOOR_GRID: &[f64] = &[1.2, 1.5, 2.0, 2.5];

/// A floor candidate needs at least this many trades above it to count.
const RETUNE_MIN_SAMPLES: usize = 10;

/// How far back the retune looks, in closed trades.
const RETUNE_LOOKBACK_TRADES: i64 = 100;

/// Post-close learning: reviews the trade, grades the sources that called
/// it, folds the result into pattern stats, and periodically retunes the
/// soft gate parameters. Everything here is advisory by construction; the
/// hard limits are out of reach.
pub struct LearningLoop {
    store: Arc<TradeStore>,
    inference: InferenceClient,
    market: MarketDataClient,
    notifier: Arc<TelegramNotifier>,
    weight_scale: f64,
    exit_deviation_guard: f64,
    pattern_scan_every: i64,
    retune_every: i64,
}

impl LearningLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TradeStore>,
        inference: InferenceClient,
        market: MarketDataClient,
        notifier: Arc<TelegramNotifier>,
        weight_scale: f64,
        exit_deviation_guard: f64,
        pattern_scan_every: i64,
        retune_every: i64,
    ) -> Self {
        Self {
            store,
            inference,
            market,
            notifier,
            weight_scale,
            exit_deviation_guard,
            pattern_scan_every,
            retune_every,
        }
    }

    pub async fn on_trade_closed(&self, trade_id: i64) -> Result<()> {
        let Some(trade) = self.store.get_trade(trade_id).await? else {
            tracing::warn!("learning skipped: trade #{} not found", trade_id);
            return Ok(());
        };
        if trade.state != TradeState::Closed {
            tracing::warn!(
                "learning skipped: trade #{} is {} not CLOSED",
                trade_id,
                trade.state.as_str()
            );
            return Ok(());
        }

        let reference_price = self
            .market
            .current_price(&trade.instrument)
            .await
            .ok()
            .filter(|p| *p > 0.0);
        self.learn_from_close(&trade, reference_price).await
    }

    /// The learning pass proper, with the market reference price already
    /// resolved. An absent reference disables the deviation guard rather
    /// than blocking the pass.
    pub(crate) async fn learn_from_close(
        &self,
        trade: &Trade,
        reference_price: Option<f64>,
    ) -> Result<()> {
        let trade_id = trade.id;
        let exit_price = trade.exit_price.unwrap_or(trade.entry_price);
        if self.exit_looks_anomalous(trade, exit_price, reference_price).await? {
            return Ok(());
        }

        let pnl = trade.realized_pnl_pct.unwrap_or(0.0);
        let won = pnl > 0.0;
        let calls = self.store.calls_for_trade(trade_id).await?;

        // Review is best effort: a dead reviewer must not block grading.
        let review = match self.inference.review(&trade_report(trade, exit_price)).await {
            Ok(review) => {
                self.store.set_trade_review(trade_id, &review.rationale).await?;
                self.store
                    .record_learning_event(
                        LearningEventKind::Review,
                        &format!("trade #{} reviewed", trade_id),
                        &json!({
                            "trade_id": trade_id,
                            "overall_score": review.overall_score,
                        }),
                    )
                    .await?;
                Some(review)
            }
            Err(e) => {
                tracing::warn!("review unavailable for trade #{}: {}", trade_id, e);
                None
            }
        };

        for call in &calls {
            let reviewed = review
                .as_ref()
                .and_then(|r| r.source_reviews.iter().find(|s| s.source_id == call.source_id));
            // Fallback grading when the reviewer is silent: a call is
            // correct when it sided with how the trade actually went.
            let correct = reviewed
                .map(|r| r.was_correct)
                .unwrap_or_else(|| (call.direction == trade.direction) == won);
            let nudge = reviewed.map(|r| r.bounded_nudge()).unwrap_or(0.0);

            self.store.grade_source_call(call.id, correct).await?;
            self.update_source_weight(&call.source_id, correct, nudge).await?;
        }

        if let Some(bucket) = trade.tech_bucket {
            let source_ids: Vec<String> = calls.iter().map(|c| c.source_id.clone()).collect();
            if !source_ids.is_empty() {
                let key = pattern_key(&source_ids, bucket);
                self.store.upsert_pattern(&key, won, pnl).await?;
            }
        }

        let closed = self.store.closed_trade_count().await?;
        if self.pattern_scan_every > 0 && closed % self.pattern_scan_every == 0 {
            self.scan_patterns().await?;
        }
        if self.retune_every > 0 && closed % self.retune_every == 0 {
            self.retune_parameters().await?;
        }

        Ok(())
    }

    /// Exit prices far from the live market are treated as bad data, not
    /// as signal. The trade stays closed; only the learning is skipped.
    async fn exit_looks_anomalous(
        &self,
        trade: &Trade,
        exit_price: f64,
        reference: Option<f64>,
    ) -> Result<bool> {
        let Some(reference) = reference else {
            return Ok(false);
        };
        let deviation = ((exit_price - reference) / reference).abs();
        if deviation <= self.exit_deviation_guard {
            return Ok(false);
        }
        tracing::warn!(
            "trade #{} exit {:.2} deviates {:.1}% from market {:.2}, skipping learning",
            trade.id,
            exit_price,
            deviation * 100.0,
            reference
        );
        self.store
            .record_learning_event(
                LearningEventKind::DataAnomaly,
                &format!("trade #{} exit deviates from market", trade.id),
                &json!({
                    "trade_id": trade.id,
                    "exit_price": exit_price,
                    "reference_price": reference,
                    "deviation": deviation,
                }),
            )
            .await?;
        Ok(true)
    }

    async fn update_source_weight(&self, source_id: &str, correct: bool, nudge: f64) -> Result<()> {
        let mut profile = self.store.get_or_create_profile(source_id).await?;
        profile.total_calls += 1;
        if correct {
            profile.correct_calls += 1;
        }
        profile.lifetime_accuracy = profile.correct_calls as f64 / profile.total_calls as f64;

        let now = Utc::now();
        profile.recent_7d_accuracy = self
            .store
            .source_accuracy_since(source_id, now - Duration::days(7))
            .await?
            .unwrap_or(profile.lifetime_accuracy);
        profile.recent_30d_accuracy = self
            .store
            .source_accuracy_since(source_id, now - Duration::days(30))
            .await?
            .unwrap_or(profile.lifetime_accuracy);

        let previous = profile.trust_weight;
        profile.trust_weight = trust_weight_from(
            profile.lifetime_accuracy,
            profile.recent_7d_accuracy,
            self.weight_scale,
            nudge,
        );
        self.store.update_profile(&profile).await?;
        self.store
            .record_learning_event(
                LearningEventKind::WeightUpdate,
                &format!(
                    "{}: weight {:.2} -> {:.2}",
                    source_id, previous, profile.trust_weight
                ),
                &json!({
                    "source_id": source_id,
                    "correct": correct,
                    "nudge": nudge,
                    "lifetime_accuracy": profile.lifetime_accuracy,
                    "recent_7d_accuracy": profile.recent_7d_accuracy,
                }),
            )
            .await?;
        Ok(())
    }

    async fn scan_patterns(&self) -> Result<()> {
        let winners = self
            .store
            .patterns_meeting(PATTERN_MIN_OCCURRENCES, PATTERN_MIN_WIN_RATE)
            .await?;
        if winners.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::new();
        for pattern in &winners {
            lines.push(format!(
                "{} — {:.0}% over {} trades, avg {:+.2}%",
                pattern.pattern_key,
                pattern.win_rate * 100.0,
                pattern.occurrences,
                pattern.avg_profit_pct
            ));
            self.store
                .record_learning_event(
                    LearningEventKind::PatternFound,
                    &format!("pattern {} keeps winning", pattern.pattern_key),
                    &json!({
                        "pattern": pattern.pattern_key,
                        "occurrences": pattern.occurrences,
                        "win_rate": pattern.win_rate,
                        "avg_profit_pct": pattern.avg_profit_pct,
                    }),
                )
                .await?;
        }
        self.notifier
            .send_message(&format!("*Winning patterns*\n{}", lines.join("\n")))
            .await
            .ok();
        Ok(())
    }

    async fn retune_parameters(&self) -> Result<()> {
        let recent = self.store.recent_closed_trades(RETUNE_LOOKBACK_TRADES).await?;
        let Some(proposal) = propose_retune(&recent) else {
            tracing::info!("retune skipped: not enough evidence in recent trades");
            return Ok(());
        };

        let current = self.store.latest_risk_parameters().await?;
        let next = current.apply_retune(&proposal);
        if parameters_unchanged(&current, &next) {
            return Ok(());
        }
        let version = self.store.insert_risk_parameters(&next).await?;
        self.store
            .record_learning_event(
                LearningEventKind::ParamsRetuned,
                &format!("risk parameters retuned to v{}", version),
                &json!({
                    "version": version,
                    "min_confidence": next.min_confidence,
                    "min_risk_reward": next.min_risk_reward,
                }),
            )
            .await?;
        self.notifier
            .send_message(&format!(
                "*Parameters retuned* (v{})\nConfidence floor: {:.2}\nRR floor: {:.2}",
                version, next.min_confidence, next.min_risk_reward
            ))
            .await
            .ok();
        Ok(())
    }
}

/// Blend lifetime and recent accuracy, scale onto the trust-weight range,
/// then apply the reviewer's bounded nudge. Clamped at both steps so a
/// nudge can never push past the scale ends.
pub fn trust_weight_from(lifetime: f64, recent_7d: f64, scale: f64, nudge: f64) -> f64 {
    let blended = 0.7 * lifetime + 0.3 * recent_7d;
    clamp_trust_weight(clamp_trust_weight(blended * scale) + nudge)
}

fn parameters_unchanged(a: &RiskParameters, b: &RiskParameters) -> bool {
    (a.min_confidence - b.min_confidence).abs() < 1e-9
        && (a.min_risk_reward - b.min_risk_reward).abs() < 1e-9
}

/// Sweep floor candidates over recent closed trades and keep the ones with
/// the best average PnL, provided enough trades clear the floor. Returns
/// None when no candidate has enough samples.
pub fn propose_retune(recent: &[Trade]) -> Option<RetuneProposal> {
    let confidence = best_floor(recent, CONFIDENCE_FLOOR_GRID, |t| t.confidence);
    let risk_reward = best_floor(recent, RISK_REWARD_FLOOR_GRID, |t| {
        let risk = (t.entry_price - t.stop_loss).abs();
        if risk <= 0.0 {
            0.0
        } else {
            (t.take_profit_1 - t.entry_price).abs() / risk
        }
    });

    if confidence.is_none() && risk_reward.is_none() {
        return None;
    }
    Some(RetuneProposal {
        min_confidence: confidence,
        min_risk_reward: risk_reward,
        ..RetuneProposal::default()
    })
}

fn best_floor(recent: &[Trade], grid: &[f64], metric: impl Fn(&Trade) -> f64) -> Option<f64> {
    let mut best: Option<(f64, f64)> = None;
    for &floor in grid {
        let pnls: Vec<f64> = recent
            .iter()
            .filter(|t| metric(t) >= floor)
            .map(|t| t.realized_pnl_pct.unwrap_or(0.0))
            .collect();
        if pnls.len() < RETUNE_MIN_SAMPLES {
            continue;
        }
        let avg = pnls.iter().sum::<f64>() / pnls.len() as f64;
        if best.map(|(_, b)| avg > b).unwrap_or(true) {
            best = Some((floor, avg));
        }
    }
    best.map(|(floor, _)| floor)
}

fn trade_report(trade: &Trade, exit_price: f64) -> serde_json::Value {
    json!({
        "trade_id": trade.id,
        "instrument": trade.instrument,
        "direction": trade.direction.as_str(),
        "entry_price": trade.entry_price,
        "exit_price": exit_price,
        "stop_loss": trade.stop_loss,
        "take_profit_1": trade.take_profit_1,
        "take_profit_2": trade.take_profit_2,
        "realized_pnl_pct": trade.realized_pnl_pct,
        "outcome": trade.outcome.map(|o| o.as_str()),
        "rationale": trade.rationale,
        "confidence": trade.confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chrono_tz::Tz;
    use signal_core::{Decision, DecisionAction, Direction, EntryStrategy, TradeOutcome};

    fn closed_trade(confidence: f64, rr: f64, pnl: f64) -> Trade {
        // entry 100, stop 95 fixes risk at 5; tp1 positions the RR
        Trade {
            id: 1,
            instrument: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            stop_loss: 95.0,
            take_profit_1: 100.0 + 5.0 * rr,
            take_profit_2: None,
            size_pct: 2.0,
            leverage: 10.0,
            initial_quantity: 0.5,
            state: TradeState::Closed,
            confidence,
            rationale: String::new(),
            tech_bucket: None,
            entry_order_id: None,
            opened_at: Some(Utc::now()),
            closed_at: Some(Utc::now()),
            partial_exit_price: None,
            exit_price: Some(100.0),
            realized_pnl_pct: Some(pnl),
            outcome: Some(TradeOutcome::Stopped),
            review_text: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn weight_blends_and_clamps() {
        // 70% lifetime, 90% recent, x2: (0.7*0.7 + 0.3*0.9)*2 = 1.52
        assert!((trust_weight_from(0.7, 0.9, 2.0, 0.0) - 1.52).abs() < 1e-9);
        // Perfect record clamps at the ceiling even before the nudge
        assert_eq!(trust_weight_from(1.0, 1.0, 2.0, 0.1), 2.0);
        // Terrible record clamps at the floor; a positive nudge lifts it
        assert_eq!(trust_weight_from(0.0, 0.0, 2.0, 0.0), 0.5);
        assert!((trust_weight_from(0.0, 0.0, 2.0, 0.1) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn retune_prefers_floors_that_filter_losers() {
        let mut trades = Vec::new();
        // Low-confidence trades lose, high-confidence trades win
        for _ in 0..15 {
            trades.push(closed_trade(0.58, 2.0, -4.0));
        }
        for _ in 0..15 {
            trades.push(closed_trade(0.75, 2.0, 6.0));
        }
        let proposal = propose_retune(&trades).unwrap();
        // Every floor above 0.58 keeps only winners; the sweep keeps the
        // lowest floor that reaches the best average
        assert!((proposal.min_confidence.unwrap() - 0.60).abs() < 1e-9);
    }

    #[test]
    fn retune_needs_samples() {
        let trades = vec![closed_trade(0.7, 2.0, 5.0); 3];
        assert!(propose_retune(&trades).is_none());
    }

    async fn memory_store() -> Arc<TradeStore> {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = TradeStore::new(pool, Tz::UTC);
        store.init_tables().await.unwrap();
        Arc::new(store)
    }

    fn offline_learning(store: Arc<TradeStore>) -> LearningLoop {
        let timeout = std::time::Duration::from_millis(100);
        LearningLoop::new(
            store,
            InferenceClient::new("http://127.0.0.1:9".to_string(), timeout).unwrap(),
            MarketDataClient::new("http://127.0.0.1:9".to_string(), timeout).unwrap(),
            Arc::new(TelegramNotifier::new(String::new(), 0).unwrap()),
            2.0,
            0.05,
            0,
            0,
        )
    }

    async fn closed_btc_trade(store: &TradeStore, exit: f64, pnl: f64) -> Trade {
        let decision = Decision {
            instrument: "BTCUSDT".to_string(),
            action: DecisionAction::Long,
            confidence: 0.7,
            entry_price: 100.0,
            entry_strategy: EntryStrategy::Market,
            stop_loss: 95.0,
            take_profit_1: 110.0,
            take_profit_2: None,
            size_pct: 2.0,
            risk_reward: 2.0,
            rationale: "test".to_string(),
            sources: Vec::new(),
            adjust: None,
        };
        let id = store.insert_pending_trade(&decision, 10.0, None).await.unwrap();
        store.mark_trade_open(id, 100.0, 1.0, "o1").await.unwrap();
        store
            .insert_source_call(id, "trader_a", Direction::Long, "btc long")
            .await
            .unwrap();
        store
            .close_trade(id, exit, pnl, TradeOutcome::TargetHit)
            .await
            .unwrap();
        store.get_trade(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn deviant_exit_is_flagged_and_not_learned_from() {
        let store = memory_store().await;
        let learning = offline_learning(Arc::clone(&store));
        let trade = closed_btc_trade(&store, 110.0, 8.0).await;

        // Exit 110 against a market at 200: 45% off, far past the guard
        learning.learn_from_close(&trade, Some(200.0)).await.unwrap();

        assert_eq!(
            store
                .learning_event_count(LearningEventKind::DataAnomaly)
                .await
                .unwrap(),
            1
        );
        // No grading, no weight update
        assert!(store.get_profile("trader_a").await.unwrap().is_none());
        let calls = store.calls_for_trade(trade.id).await.unwrap();
        assert!(calls[0].correct.is_none());
    }

    #[tokio::test]
    async fn sane_exit_grades_the_sources() {
        let store = memory_store().await;
        let learning = offline_learning(Arc::clone(&store));
        let trade = closed_btc_trade(&store, 110.0, 8.0).await;

        // Reference in line with the exit: the guard passes and the
        // long call that won grades correct (reviewer unreachable, so
        // the direction-vs-outcome fallback applies)
        learning.learn_from_close(&trade, Some(110.5)).await.unwrap();

        let calls = store.calls_for_trade(trade.id).await.unwrap();
        assert_eq!(calls[0].correct, Some(true));
        let profile = store.get_profile("trader_a").await.unwrap().unwrap();
        assert_eq!(profile.total_calls, 1);
        assert!(profile.trust_weight > 1.0);
        assert_eq!(
            store
                .learning_event_count(LearningEventKind::DataAnomaly)
                .await
                .unwrap(),
            0
        );
    }
}
