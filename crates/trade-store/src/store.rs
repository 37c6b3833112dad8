use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// All persistent state behind one handle. Timestamps are stored as
/// RFC3339 text so the same schema works on any sqlx backend.
pub struct TradeStore {
    pool: sqlx::AnyPool,
    /// Timezone that defines the rolling trading-day boundary.
    tz: Tz,
}

impl TradeStore {
    pub fn new(pool: sqlx::AnyPool, tz: Tz) -> Self {
        Self { pool, tz }
    }

    pub fn pool(&self) -> &sqlx::AnyPool {
        &self.pool
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Start of the current local trading day, in UTC.
    pub fn day_start_utc(&self) -> DateTime<Utc> {
        let local_now = Utc::now().with_timezone(&self.tz);
        let midnight = local_now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_else(|| local_now.naive_local());
        match self.tz.from_local_datetime(&midnight) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            // DST gap/fold: fall back to the instant 24h ago
            _ => Utc::now() - chrono::Duration::hours(24),
        }
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS signal_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                raw_text TEXT NOT NULL,
                detected_instruments TEXT NOT NULL DEFAULT '',
                attachment_urls TEXT NOT NULL DEFAULT '',
                received_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit_1 REAL NOT NULL,
                take_profit_2 REAL,
                size_pct REAL NOT NULL,
                leverage REAL NOT NULL,
                initial_quantity REAL NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'PENDING',
                confidence REAL NOT NULL DEFAULT 0,
                rationale TEXT NOT NULL DEFAULT '',
                tech_bucket TEXT,
                entry_order_id TEXT,
                opened_at TEXT,
                closed_at TEXT,
                partial_exit_price REAL,
                exit_price REAL,
                realized_pnl_pct REAL,
                outcome TEXT,
                review_text TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS source_profiles (
                source_id TEXT PRIMARY KEY,
                trust_weight REAL NOT NULL DEFAULT 1.0,
                total_calls INTEGER NOT NULL DEFAULT 0,
                correct_calls INTEGER NOT NULL DEFAULT 0,
                lifetime_accuracy REAL NOT NULL DEFAULT 0,
                recent_7d_accuracy REAL NOT NULL DEFAULT 0,
                recent_30d_accuracy REAL NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS source_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id INTEGER NOT NULL,
                source_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                message_excerpt TEXT NOT NULL DEFAULT '',
                recorded_at TEXT NOT NULL,
                correct INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS signal_patterns (
                pattern_key TEXT PRIMARY KEY,
                occurrences INTEGER NOT NULL DEFAULT 0,
                wins INTEGER NOT NULL DEFAULT 0,
                win_rate REAL NOT NULL DEFAULT 0,
                avg_profit_pct REAL NOT NULL DEFAULT 0,
                last_seen TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS decision_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                action TEXT NOT NULL,
                confidence REAL NOT NULL,
                rationale TEXT NOT NULL DEFAULT '',
                outcome TEXT NOT NULL,
                reject_reason TEXT,
                trade_id INTEGER,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS learning_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                description TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS risk_parameters (
                version INTEGER PRIMARY KEY AUTOINCREMENT,
                soft_daily_loss_pct REAL NOT NULL,
                max_consecutive_losses INTEGER NOT NULL,
                max_trades_per_day INTEGER NOT NULL,
                cooldown_secs INTEGER NOT NULL,
                min_confidence REAL NOT NULL,
                min_risk_reward REAL NOT NULL,
                tolerance_pct REAL NOT NULL,
                whitelist TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -- key/value agent state ------------------------------------------------

    pub async fn save_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM agent_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    // -- kill-switch halt flag ------------------------------------------------

    pub async fn is_halted(&self) -> Result<Option<String>> {
        Ok(self.load_state("halted_reason").await?.filter(|r| !r.is_empty()))
    }

    pub async fn set_halted(&self, reason: &str) -> Result<()> {
        self.save_state("halted_reason", reason).await
    }

    pub async fn clear_halt(&self) -> Result<()> {
        self.save_state("halted_reason", "").await
    }
}

/// Parse an RFC3339 text column back into a UTC timestamp.
pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
