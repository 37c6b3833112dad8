use anyhow::Result;
use chrono::Utc;
use telegram_notifier::DailyReport;
use trade_store::TradeStore;

/// Assemble the operator's daily summary from storage.
pub async fn build_daily_report(store: &TradeStore) -> Result<DailyReport> {
    let day_start = store.day_start_utc().to_rfc3339();
    let closed = store.trades_closed_since(&day_start).await?;

    let trade_count = closed.len();
    let wins = closed
        .iter()
        .filter(|t| t.realized_pnl_pct.unwrap_or(0.0) > 0.0)
        .count();
    let win_rate = if trade_count > 0 {
        wins as f64 / trade_count as f64
    } else {
        0.0
    };

    let mut best_trade: Option<(String, f64)> = None;
    let mut worst_trade: Option<(String, f64)> = None;
    for trade in &closed {
        let pnl = trade.realized_pnl_pct.unwrap_or(0.0);
        if best_trade.as_ref().map(|(_, p)| pnl > *p).unwrap_or(true) {
            best_trade = Some((trade.instrument.clone(), pnl));
        }
        if worst_trade.as_ref().map(|(_, p)| pnl < *p).unwrap_or(true) {
            worst_trade = Some((trade.instrument.clone(), pnl));
        }
    }

    // Counters are instrument-agnostic apart from the cooldown clock.
    let counters = store.risk_counters("").await?;
    let open_positions = store.exposed_trades().await?.len();

    let outcome_counts = store.decision_outcome_counts_since(&day_start).await?;
    let count_of = |outcome: &str| {
        outcome_counts
            .iter()
            .find(|(o, _)| o == outcome)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    };

    Ok(DailyReport {
        date: Utc::now()
            .with_timezone(&store.timezone())
            .format("%Y-%m-%d")
            .to_string(),
        trade_count,
        win_rate,
        daily_pnl_pct: counters.daily_pnl_pct,
        cumulative_pnl_pct: counters.cumulative_pnl_pct,
        open_positions,
        best_trade,
        worst_trade,
        decisions_executed: count_of("EXECUTED"),
        decisions_rejected: count_of("REJECTED"),
        decisions_skipped: count_of("SKIP"),
        halted: store.is_halted().await?.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;
    use signal_core::{
        Decision, DecisionAction, EntryStrategy, TradeOutcome,
    };

    async fn memory_store() -> TradeStore {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = TradeStore::new(pool, Tz::UTC);
        store.init_tables().await.unwrap();
        store
    }

    fn decision(instrument: &str) -> Decision {
        Decision {
            instrument: instrument.to_string(),
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

    #[tokio::test]
    async fn report_reflects_the_day() {
        let store = memory_store().await;

        let win = store
            .insert_pending_trade(&decision("BTCUSDT"), 10.0, None)
            .await
            .unwrap();
        store.mark_trade_open(win, 100.0, 1.0, "o1").await.unwrap();
        store
            .close_trade(win, 110.0, 8.6, TradeOutcome::TargetHit)
            .await
            .unwrap();

        let loss = store
            .insert_pending_trade(&decision("ETHUSDT"), 10.0, None)
            .await
            .unwrap();
        store.mark_trade_open(loss, 100.0, 1.0, "o2").await.unwrap();
        store
            .close_trade(loss, 95.0, -6.4, TradeOutcome::Stopped)
            .await
            .unwrap();

        let report = build_daily_report(&store).await.unwrap();
        assert_eq!(report.trade_count, 2);
        assert!((report.win_rate - 0.5).abs() < 1e-9);
        assert!((report.daily_pnl_pct - 2.2).abs() < 1e-9);
        assert_eq!(report.best_trade, Some(("BTCUSDT".to_string(), 8.6)));
        assert_eq!(report.worst_trade, Some(("ETHUSDT".to_string(), -6.4)));
        assert_eq!(report.open_positions, 0);
        assert!(!report.halted);
    }

    #[tokio::test]
    async fn empty_day_is_a_zero_report() {
        let store = memory_store().await;
        let report = build_daily_report(&store).await.unwrap();
        assert_eq!(report.trade_count, 0);
        assert_eq!(report.win_rate, 0.0);
        assert!(report.best_trade.is_none());
    }
}
