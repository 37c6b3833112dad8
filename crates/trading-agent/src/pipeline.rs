use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use exchange_broker::ExchangeClient;
use inference_client::InferenceClient;
use market_data::{EconCalendar, InstrumentSnapshot, MarketDataClient};
use risk_gate::{evaluate, FeeSchedule, GateVerdict, RiskParameters};
use signal_core::{Decision, DecisionAction, DecisionOutcome, SignalMessage, TradeState};
use telegram_notifier::{ConfirmationOutcome, TelegramNotifier};
use trade_store::TradeStore;

use crate::context;
use crate::executor::TradeExecutor;
use crate::reconciler;

/// How far ahead the context looks for scheduled macro events.
const CALENDAR_LOOKAHEAD_HOURS: i64 = 12;

/// One signal batch in, a decision run per instrument the batch names.
/// Every terminal path lands exactly one row in the decision log.
pub struct DecisionPipeline {
    store: Arc<TradeStore>,
    market: MarketDataClient,
    calendar: EconCalendar,
    inference: InferenceClient,
    exchange: Arc<dyn ExchangeClient>,
    executor: TradeExecutor,
    notifier: Arc<TelegramNotifier>,
    /// Instruments with a decision currently in flight. A second batch
    /// for the same instrument is dropped, not queued.
    in_flight: DashMap<String, ()>,
    confirm_timeout: Duration,
    leverage: u32,
    fees: FeeSchedule,
}

impl DecisionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TradeStore>,
        market: MarketDataClient,
        calendar: EconCalendar,
        inference: InferenceClient,
        exchange: Arc<dyn ExchangeClient>,
        executor: TradeExecutor,
        notifier: Arc<TelegramNotifier>,
        confirm_timeout: Duration,
        leverage: u32,
    ) -> Self {
        Self {
            store,
            market,
            calendar,
            inference,
            exchange,
            executor,
            notifier,
            in_flight: DashMap::new(),
            confirm_timeout,
            leverage,
            fees: FeeSchedule::default(),
        }
    }

    pub async fn process_batch(&self, batch: Vec<SignalMessage>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let params = self.store.latest_risk_parameters().await?;
        let instruments = detected_instruments(&batch, &params.whitelist);
        if instruments.is_empty() {
            tracing::debug!("batch of {} messages names no instrument", batch.len());
            return Ok(());
        }

        for instrument in instruments {
            // Single flight per instrument: overlapping runs are dropped.
            if self.in_flight.insert(instrument.clone(), ()).is_some() {
                tracing::info!("{} decision already in flight, dropping batch", instrument);
                continue;
            }
            let result = self.run_decision(&instrument, &batch, &params).await;
            self.in_flight.remove(&instrument);
            if let Err(e) = result {
                tracing::error!("decision run failed for {}: {}", instrument, e);
            }
        }
        Ok(())
    }

    async fn run_decision(
        &self,
        instrument: &str,
        batch: &[SignalMessage],
        params: &RiskParameters,
    ) -> Result<()> {
        if let Some(reason) = self.store.is_halted().await? {
            tracing::warn!("trading halted ({}), batch for {} ignored", reason, instrument);
            self.store
                .record_decision(
                    instrument,
                    "NONE",
                    0.0,
                    &format!("halted: {}", reason),
                    DecisionOutcome::Rejected,
                    Some("kill_switch"),
                    None,
                )
                .await?;
            return Ok(());
        }

        let snapshot = match self.market.snapshot(instrument).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("no market snapshot for {}, skipping batch: {}", instrument, e);
                return Ok(());
            }
        };
        let events = self
            .calendar
            .relevant_events(chrono::Duration::hours(CALENDAR_LOOKAHEAD_HOURS))
            .await;
        let open_trade = self.store.exposed_trade_for(instrument).await?;
        let patterns = self.store.top_patterns(5).await?;
        let profiles = self.store.ranked_profiles().await?;

        // Posture specialization: sources with a track record under the
        // current technical bucket get their weight tilted accordingly.
        let bucket = context::tech_bucket_for(&snapshot);
        let mut specialization: HashMap<String, f64> = HashMap::new();
        for profile in &profiles {
            if profile.total_calls < context::SPECIALIZATION_MIN_CALLS {
                continue;
            }
            if let Some(accuracy) = self
                .store
                .source_bucket_accuracy(&profile.source_id, bucket)
                .await?
            {
                let factor = context::specialization_factor(profile.lifetime_accuracy, accuracy);
                if (factor - 1.0).abs() > f64::EPSILON {
                    specialization.insert(profile.source_id.clone(), factor);
                }
            }
        }

        let bundle = context::build_bundle(
            instrument,
            batch,
            &snapshot,
            &events,
            open_trade.as_ref(),
            &patterns,
            &profiles,
            &specialization,
            &params.whitelist,
            Utc::now(),
        );

        let decision = match self.inference.analyze(&bundle).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!("inference failed for {}: {}", instrument, e);
                return Ok(());
            }
        };

        match decision.action {
            DecisionAction::Skip => {
                tracing::info!("{}: SKIP ({})", instrument, decision.rationale);
                self.store
                    .record_decision(
                        &decision.instrument,
                        decision.action.as_str(),
                        decision.confidence,
                        &decision.rationale,
                        DecisionOutcome::Skip,
                        None,
                        None,
                    )
                    .await
            }
            DecisionAction::Adjust => self.apply_adjust(&decision).await,
            DecisionAction::Long | DecisionAction::Short => {
                self.execute_trade_decision(decision, &snapshot, params).await
            }
        }
    }

    async fn execute_trade_decision(
        &self,
        decision: Decision,
        snapshot: &InstrumentSnapshot,
        params: &RiskParameters,
    ) -> Result<()> {
        let counters = self.store.risk_counters(&decision.instrument).await?;
        let exposed = self.store.exposed_trades().await?;
        let verdict = evaluate(&decision, &counters, &exposed, params, &self.fees);

        if let GateVerdict::Rejected { reason, detail } = verdict {
            tracing::warn!("{} rejected: {}", decision.instrument, detail);
            self.store
                .record_decision(
                    &decision.instrument,
                    decision.action.as_str(),
                    decision.confidence,
                    &decision.rationale,
                    DecisionOutcome::Rejected,
                    Some(reason.as_str()),
                    None,
                )
                .await?;
            if reason.is_fatal() {
                self.store.set_halted(&detail).await?;
                self.notifier
                    .send_message(&format!(
                        "*KILL SWITCH* — trading halted\n{}\n/reset_killswitch to resume after review.",
                        detail
                    ))
                    .await
                    .ok();
            } else {
                self.notifier
                    .send_message(&format!(
                        "Rejected {} {}: {}",
                        decision.action.as_str(),
                        decision.instrument,
                        detail
                    ))
                    .await
                    .ok();
            }
            return Ok(());
        }

        // Operator confirmation. No answer is a rejection, and nothing has
        // been written yet, so a timeout leaves no residue.
        let prompt = decision_prompt(&decision);
        let confirmation = match self
            .notifier
            .request_confirmation(&prompt, self.confirm_timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("confirmation channel failed: {}", e);
                ConfirmationOutcome::TimedOut
            }
        };
        match confirmation {
            ConfirmationOutcome::Confirmed => {}
            ConfirmationOutcome::Cancelled => {
                tracing::info!("{} cancelled by operator", decision.instrument);
                return self
                    .store
                    .record_decision(
                        &decision.instrument,
                        decision.action.as_str(),
                        decision.confidence,
                        &decision.rationale,
                        DecisionOutcome::Cancelled,
                        None,
                        None,
                    )
                    .await;
            }
            ConfirmationOutcome::TimedOut => {
                tracing::info!("{} confirmation timed out", decision.instrument);
                return self
                    .store
                    .record_decision(
                        &decision.instrument,
                        decision.action.as_str(),
                        decision.confidence,
                        &decision.rationale,
                        DecisionOutcome::TimedOut,
                        None,
                        None,
                    )
                    .await;
            }
        }

        let bucket = context::tech_bucket_for(snapshot);
        let trade_id = self
            .store
            .insert_pending_trade(&decision, self.leverage as f64, Some(bucket))
            .await?;
        if let Some(direction) = decision.action.direction() {
            for source in &decision.sources {
                let call_direction = if source.agrees {
                    direction
                } else {
                    match direction {
                        signal_core::Direction::Long => signal_core::Direction::Short,
                        signal_core::Direction::Short => signal_core::Direction::Long,
                    }
                };
                self.store
                    .insert_source_call(trade_id, &source.source_id, call_direction, &source.excerpt)
                    .await?;
            }
        }

        match self.executor.execute(&decision).await {
            Ok(outcome) => {
                self.store
                    .mark_trade_open(trade_id, outcome.fill_price, outcome.quantity, &outcome.order_id)
                    .await?;
                self.store
                    .record_decision(
                        &decision.instrument,
                        decision.action.as_str(),
                        decision.confidence,
                        &decision.rationale,
                        DecisionOutcome::Executed,
                        None,
                        Some(trade_id),
                    )
                    .await?;
                tracing::info!(
                    "trade #{} open: {} {} {:.6} @ {:.2}",
                    trade_id,
                    decision.action.as_str(),
                    decision.instrument,
                    outcome.quantity,
                    outcome.fill_price
                );
                self.notifier
                    .send_message(&format!(
                        "*Opened* — {} {} #{}\nFill: {:.2} | Qty: {:.6}\nStop: {:.2} | TP1: {:.2}{}",
                        decision.action.as_str(),
                        decision.instrument,
                        trade_id,
                        outcome.fill_price,
                        outcome.quantity,
                        decision.stop_loss,
                        decision.take_profit_1,
                        decision
                            .take_profit_2
                            .map(|tp| format!(" | TP2: {:.2}", tp))
                            .unwrap_or_default()
                    ))
                    .await
                    .ok();
            }
            Err(e) => {
                tracing::error!("execution failed for trade #{}: {}", trade_id, e);
                self.store.mark_trade_discarded(trade_id).await?;
                self.store
                    .record_decision(
                        &decision.instrument,
                        decision.action.as_str(),
                        decision.confidence,
                        &decision.rationale,
                        DecisionOutcome::Failed,
                        None,
                        Some(trade_id),
                    )
                    .await?;
                self.notifier
                    .send_message(&format!(
                        "Execution failed for {} {}: {}",
                        decision.action.as_str(),
                        decision.instrument,
                        e
                    ))
                    .await
                    .ok();
            }
        }
        Ok(())
    }

    /// Amend the working stop/targets of an existing exposed trade. The
    /// risk gate is not consulted: an ADJUST opens no new exposure.
    async fn apply_adjust(&self, decision: &Decision) -> Result<()> {
        let Some(request) = decision.adjust.as_ref() else {
            tracing::warn!("ADJUST decision without a request, ignoring");
            return Ok(());
        };
        let Some(trade) = self.store.get_trade(request.trade_id).await? else {
            tracing::warn!("ADJUST targets unknown trade #{}", request.trade_id);
            return Ok(());
        };
        if !matches!(trade.state, TradeState::Open | TradeState::PartialClose) {
            tracing::warn!(
                "ADJUST targets trade #{} in state {}, ignoring",
                trade.id,
                trade.state.as_str()
            );
            return Ok(());
        }

        if let Some(new_stop) = request.new_stop_loss {
            self.store.update_trade_stop(trade.id, new_stop).await?;
            tracing::info!("trade #{} stop moved to {:.2}", trade.id, new_stop);
        }
        if let Some(targets) = request.new_take_profits.as_ref() {
            if let Some(&tp1) = targets.first() {
                let tp2 = targets.get(1).copied();
                self.store.update_trade_targets(trade.id, tp1, tp2).await?;
                // Re-place the bracket for the quantity still working.
                self.exchange.cancel_all_orders(&trade.instrument).await?;
                self.exchange
                    .place_take_profits(
                        &trade.instrument,
                        trade.direction,
                        reconciler::remaining_quantity(&trade),
                        tp1,
                        tp2,
                    )
                    .await?;
                tracing::info!("trade #{} targets replaced: {:?}", trade.id, targets);
            }
        }

        self.store
            .record_decision(
                &decision.instrument,
                decision.action.as_str(),
                decision.confidence,
                &decision.rationale,
                DecisionOutcome::Executed,
                None,
                Some(trade.id),
            )
            .await?;
        self.notifier
            .send_message(&format!(
                "*Adjusted* — {} #{}\n{}",
                trade.instrument, trade.id, decision.rationale
            ))
            .await
            .ok();
        Ok(())
    }
}

/// Every whitelisted instrument the batch mentions, most-mentioned first,
/// whitelist order breaking ties. Each one gets its own decision run.
pub fn detected_instruments(batch: &[SignalMessage], whitelist: &[String]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for message in batch {
        for instrument in &message.detected_instruments {
            *counts.entry(instrument.as_str()).or_insert(0) += 1;
        }
    }
    let mut mentioned: Vec<(String, usize)> = whitelist
        .iter()
        .filter_map(|instrument| {
            counts
                .get(instrument.as_str())
                .map(|&count| (instrument.clone(), count))
        })
        .collect();
    // Stable sort keeps whitelist order inside equal counts.
    mentioned.sort_by(|a, b| b.1.cmp(&a.1));
    mentioned.into_iter().map(|(instrument, _)| instrument).collect()
}

fn decision_prompt(decision: &Decision) -> String {
    format!(
        "*Proposed: {} {}*\nEntry: {:.2} ({:?})\nStop: {:.2} | TP1: {:.2}{}\nSize: {:.1}% | Confidence: {:.0}%\n\n{}",
        decision.action.as_str(),
        decision.instrument,
        decision.entry_price,
        decision.entry_strategy,
        decision.stop_loss,
        decision.take_profit_1,
        decision
            .take_profit_2
            .map(|tp| format!(" | TP2: {:.2}", tp))
            .unwrap_or_default(),
        decision.size_pct,
        decision.confidence * 100.0,
        decision.rationale
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chrono_tz::Tz;
    use exchange_broker::BinanceFuturesClient;
    use signal_core::EntryStrategy;

    fn message(instruments: &[&str]) -> SignalMessage {
        SignalMessage {
            id: 0,
            source_id: "trader_a".to_string(),
            channel: "chat".to_string(),
            raw_text: String::new(),
            detected_instruments: instruments.iter().map(|s| s.to_string()).collect(),
            attachment_urls: Vec::new(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn every_mentioned_instrument_gets_a_run() {
        let whitelist = vec![
            "BTCUSDT".to_string(),
            "ETHUSDT".to_string(),
            "SOLUSDT".to_string(),
        ];
        let batch = vec![
            message(&["ETHUSDT"]),
            message(&["ETHUSDT", "BTCUSDT"]),
            message(&["ETHUSDT", "SOLUSDT"]),
        ];
        // Most mentioned first; nothing named in the batch is dropped
        assert_eq!(
            detected_instruments(&batch, &whitelist),
            vec!["ETHUSDT", "BTCUSDT", "SOLUSDT"]
        );
    }

    #[test]
    fn ties_break_in_whitelist_order() {
        let whitelist = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let batch = vec![message(&["ETHUSDT", "BTCUSDT"])];
        assert_eq!(
            detected_instruments(&batch, &whitelist),
            vec!["BTCUSDT", "ETHUSDT"]
        );
    }

    #[test]
    fn unlisted_instruments_are_filtered() {
        let whitelist = vec!["BTCUSDT".to_string()];
        assert!(detected_instruments(&[], &whitelist).is_empty());
        assert!(detected_instruments(&[message(&[])], &whitelist).is_empty());
        assert!(detected_instruments(&[message(&["DOGEUSDT"])], &whitelist).is_empty());
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

    fn offline_pipeline(store: Arc<TradeStore>) -> DecisionPipeline {
        // Collaborators point at nothing; the paths under test never
        // reach them.
        let exchange: Arc<dyn ExchangeClient> = Arc::new(
            BinanceFuturesClient::new(
                String::new(),
                String::new(),
                "https://testnet.binancefuture.com".to_string(),
            )
            .unwrap(),
        );
        DecisionPipeline::new(
            store,
            MarketDataClient::new(
                "http://127.0.0.1:9".to_string(),
                Duration::from_millis(100),
            )
            .unwrap(),
            EconCalendar::new(String::new()).unwrap(),
            InferenceClient::new("http://127.0.0.1:9".to_string(), Duration::from_millis(100))
                .unwrap(),
            Arc::clone(&exchange),
            TradeExecutor::new(exchange, 10),
            Arc::new(TelegramNotifier::new(String::new(), 0).unwrap()),
            Duration::from_secs(1),
            10,
        )
    }

    fn long_decision() -> Decision {
        Decision {
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
        }
    }

    fn empty_snapshot() -> InstrumentSnapshot {
        InstrumentSnapshot {
            instrument: "BTCUSDT".to_string(),
            price: 100.0,
            change_24h_pct: 0.0,
            quote_volume_24h: 0.0,
            funding_rate: None,
            long_short_ratio: None,
            timeframes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn unanswered_confirmation_leaves_no_residue() {
        let store = memory_store().await;
        let pipeline = offline_pipeline(Arc::clone(&store));
        let params = RiskParameters::default();

        // The disabled operator channel cannot confirm, so the prompt
        // resolves as timed out.
        pipeline
            .execute_trade_decision(long_decision(), &empty_snapshot(), &params)
            .await
            .unwrap();

        // No Trade row, no counter movement
        assert!(store.get_trade(1).await.unwrap().is_none());
        assert!(store.exposed_trades().await.unwrap().is_empty());
        let counters = store.risk_counters("BTCUSDT").await.unwrap();
        assert_eq!(counters.trades_today, 0);
        assert!(counters.seconds_since_last_trade.is_none());

        // Exactly one decision-log row, recording the timeout
        let day_start = store.day_start_utc().to_rfc3339();
        let outcomes = store.decision_outcome_counts_since(&day_start).await.unwrap();
        assert_eq!(outcomes, vec![("TIMED_OUT".to_string(), 1)]);
    }
}
