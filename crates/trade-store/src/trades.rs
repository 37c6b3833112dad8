use anyhow::{anyhow, Result};
use chrono::Utc;
use signal_core::{Decision, Direction, RiskCounters, TechBucket, Trade, TradeOutcome, TradeState};

use crate::store::{parse_ts, TradeStore};

#[derive(Debug, sqlx::FromRow)]
struct TradeRow {
    id: i64,
    instrument: String,
    direction: String,
    entry_price: f64,
    stop_loss: f64,
    take_profit_1: f64,
    take_profit_2: Option<f64>,
    size_pct: f64,
    leverage: f64,
    initial_quantity: f64,
    state: String,
    confidence: f64,
    rationale: String,
    tech_bucket: Option<String>,
    entry_order_id: Option<String>,
    opened_at: Option<String>,
    closed_at: Option<String>,
    partial_exit_price: Option<f64>,
    exit_price: Option<f64>,
    realized_pnl_pct: Option<f64>,
    outcome: Option<String>,
    review_text: Option<String>,
    created_at: String,
}

impl From<TradeRow> for Trade {
    fn from(r: TradeRow) -> Self {
        Trade {
            id: r.id,
            instrument: r.instrument,
            direction: Direction::parse(&r.direction).unwrap_or(Direction::Long),
            entry_price: r.entry_price,
            stop_loss: r.stop_loss,
            take_profit_1: r.take_profit_1,
            take_profit_2: r.take_profit_2,
            size_pct: r.size_pct,
            leverage: r.leverage,
            initial_quantity: r.initial_quantity,
            state: TradeState::parse(&r.state).unwrap_or(TradeState::Pending),
            confidence: r.confidence,
            rationale: r.rationale,
            tech_bucket: r.tech_bucket.as_deref().and_then(TechBucket::parse),
            entry_order_id: r.entry_order_id,
            opened_at: r.opened_at.as_deref().map(parse_ts),
            closed_at: r.closed_at.as_deref().map(parse_ts),
            partial_exit_price: r.partial_exit_price,
            exit_price: r.exit_price,
            realized_pnl_pct: r.realized_pnl_pct,
            outcome: r.outcome.as_deref().and_then(TradeOutcome::parse),
            review_text: r.review_text,
            created_at: parse_ts(&r.created_at),
        }
    }
}

const TRADE_COLUMNS: &str = "id, instrument, direction, entry_price, stop_loss, take_profit_1,
     take_profit_2, size_pct, leverage, initial_quantity, state, confidence,
     rationale, tech_bucket, entry_order_id, opened_at, closed_at, partial_exit_price,
     exit_price, realized_pnl_pct, outcome, review_text, created_at";

impl TradeStore {
    /// Record a confirmed decision as a PENDING trade awaiting fill.
    pub async fn insert_pending_trade(
        &self,
        decision: &Decision,
        leverage: f64,
        tech_bucket: Option<TechBucket>,
    ) -> Result<i64> {
        let direction = decision
            .action
            .direction()
            .ok_or_else(|| anyhow!("decision action {} opens no trade", decision.action.as_str()))?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO trades (
                instrument, direction, entry_price, stop_loss, take_profit_1,
                take_profit_2, size_pct, leverage, state, confidence, rationale,
                tech_bucket, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, ?, ?, ?)
            RETURNING id",
        )
        .bind(&decision.instrument)
        .bind(direction.as_str())
        .bind(decision.entry_price)
        .bind(decision.stop_loss)
        .bind(decision.take_profit_1)
        .bind(decision.take_profit_2)
        .bind(decision.size_pct)
        .bind(leverage)
        .bind(decision.confidence)
        .bind(&decision.rationale)
        .bind(tech_bucket.map(|b| b.as_str()))
        .bind(Utc::now().to_rfc3339())
        .fetch_one(self.pool())
        .await?;

        Ok(id)
    }

    /// Entry order filled: PENDING -> OPEN with the actual fill.
    pub async fn mark_trade_open(
        &self,
        trade_id: i64,
        fill_price: f64,
        quantity: f64,
        order_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE trades
             SET state = 'OPEN', entry_price = ?, initial_quantity = ?,
                 entry_order_id = ?, opened_at = ?
             WHERE id = ? AND state = 'PENDING'",
        )
        .bind(fill_price)
        .bind(quantity)
        .bind(order_id)
        .bind(Utc::now().to_rfc3339())
        .bind(trade_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Execution failed before a fill: PENDING -> DISCARDED. Discarded
    /// trades never touch the risk counters.
    pub async fn mark_trade_discarded(&self, trade_id: i64) -> Result<()> {
        sqlx::query("UPDATE trades SET state = 'DISCARDED' WHERE id = ? AND state = 'PENDING'")
            .bind(trade_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// TP1 filled on roughly half the position: OPEN -> PARTIAL_CLOSE.
    pub async fn mark_trade_partial(&self, trade_id: i64, partial_exit_price: f64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE trades SET state = 'PARTIAL_CLOSE', partial_exit_price = ?
             WHERE id = ? AND state = 'OPEN'",
        )
        .bind(partial_exit_price)
        .bind(trade_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move the working stop (breakeven bump after TP1, or an ADJUST).
    pub async fn update_trade_stop(&self, trade_id: i64, new_stop: f64) -> Result<()> {
        sqlx::query(
            "UPDATE trades SET stop_loss = ? WHERE id = ? AND state IN ('OPEN', 'PARTIAL_CLOSE')",
        )
        .bind(new_stop)
        .bind(trade_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_trade_targets(
        &self,
        trade_id: i64,
        take_profit_1: f64,
        take_profit_2: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE trades SET take_profit_1 = ?, take_profit_2 = ?
             WHERE id = ? AND state IN ('OPEN', 'PARTIAL_CLOSE')",
        )
        .bind(take_profit_1)
        .bind(take_profit_2)
        .bind(trade_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Terminal close: exit fields, PnL and outcome land in one update.
    /// Guarded on the live states, so re-closing a CLOSED trade is a
    /// no-op and returns false.
    pub async fn close_trade(
        &self,
        trade_id: i64,
        exit_price: f64,
        realized_pnl_pct: f64,
        outcome: TradeOutcome,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE trades
             SET state = 'CLOSED', exit_price = ?, realized_pnl_pct = ?,
                 outcome = ?, closed_at = ?
             WHERE id = ? AND state IN ('OPEN', 'PARTIAL_CLOSE')",
        )
        .bind(exit_price)
        .bind(realized_pnl_pct)
        .bind(outcome.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(trade_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_trade_review(&self, trade_id: i64, review: &str) -> Result<()> {
        sqlx::query("UPDATE trades SET review_text = ? WHERE id = ?")
            .bind(review)
            .bind(trade_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_trade(&self, trade_id: i64) -> Result<Option<Trade>> {
        let row: Option<TradeRow> =
            sqlx::query_as(&format!("SELECT {TRADE_COLUMNS} FROM trades WHERE id = ?"))
                .bind(trade_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(Into::into))
    }

    /// Trades the reconciler polls: OPEN or PARTIAL_CLOSE.
    pub async fn exposed_trades(&self) -> Result<Vec<Trade>> {
        let rows: Vec<TradeRow> = sqlx::query_as(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades
             WHERE state IN ('OPEN', 'PARTIAL_CLOSE') ORDER BY id"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn exposed_trade_for(&self, instrument: &str) -> Result<Option<Trade>> {
        let row: Option<TradeRow> = sqlx::query_as(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades
             WHERE instrument = ? AND state IN ('OPEN', 'PARTIAL_CLOSE') LIMIT 1"
        ))
        .bind(instrument)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn closed_trade_count(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM trades WHERE state = 'CLOSED'")
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    pub async fn recent_closed_trades(&self, limit: i64) -> Result<Vec<Trade>> {
        let rows: Vec<TradeRow> = sqlx::query_as(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades
             WHERE state = 'CLOSED' ORDER BY closed_at DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn trades_closed_since(&self, since_rfc3339: &str) -> Result<Vec<Trade>> {
        let rows: Vec<TradeRow> = sqlx::query_as(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades
             WHERE state = 'CLOSED' AND closed_at >= ? ORDER BY closed_at"
        ))
        .bind(since_rfc3339)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Derive the gate's counters from storage. Nothing here is cached;
    /// every evaluation re-reads so restarts cannot desync the gate.
    pub async fn risk_counters(&self, instrument: &str) -> Result<RiskCounters> {
        let day_start = self.day_start_utc().to_rfc3339();

        let (trades_today,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM trades WHERE opened_at IS NOT NULL AND opened_at >= ?",
        )
        .bind(&day_start)
        .fetch_one(self.pool())
        .await?;

        let (daily_pnl,): (Option<f64>,) = sqlx::query_as(
            "SELECT SUM(realized_pnl_pct) FROM trades
             WHERE state = 'CLOSED' AND closed_at >= ?",
        )
        .bind(&day_start)
        .fetch_one(self.pool())
        .await?;

        let (cumulative_pnl,): (Option<f64>,) =
            sqlx::query_as("SELECT SUM(realized_pnl_pct) FROM trades WHERE state = 'CLOSED'")
                .fetch_one(self.pool())
                .await?;

        let recent: Vec<(Option<f64>,)> = sqlx::query_as(
            "SELECT realized_pnl_pct FROM trades
             WHERE state = 'CLOSED' ORDER BY closed_at DESC LIMIT 20",
        )
        .fetch_all(self.pool())
        .await?;
        let mut consecutive_losses = 0i64;
        for (pnl,) in recent {
            if pnl.unwrap_or(0.0) < 0.0 {
                consecutive_losses += 1;
            } else {
                break;
            }
        }

        let last_opened: Option<(String,)> = sqlx::query_as(
            "SELECT opened_at FROM trades
             WHERE instrument = ? AND opened_at IS NOT NULL
             ORDER BY opened_at DESC LIMIT 1",
        )
        .bind(instrument)
        .fetch_optional(self.pool())
        .await?;
        let seconds_since_last_trade = last_opened
            .map(|(ts,)| (Utc::now() - parse_ts(&ts)).num_seconds());

        Ok(RiskCounters {
            trades_today,
            daily_pnl_pct: daily_pnl.unwrap_or(0.0),
            consecutive_losses,
            cumulative_pnl_pct: cumulative_pnl.unwrap_or(0.0),
            seconds_since_last_trade,
        })
    }
}
