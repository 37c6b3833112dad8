use anyhow::Result;
use chrono::Utc;
use signal_core::SignalPattern;

use crate::store::{parse_ts, TradeStore};

impl TradeStore {
    /// Fold one closed trade into a pattern's running stats. Incremental
    /// upsert; nothing is ever recomputed from history.
    pub async fn upsert_pattern(&self, pattern_key: &str, won: bool, profit_pct: f64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let win = if won { 1i64 } else { 0i64 };
        sqlx::query(
            "INSERT INTO signal_patterns (
                pattern_key, occurrences, wins, win_rate, avg_profit_pct, last_seen
            ) VALUES (?, 1, ?, ?, ?, ?)
            ON CONFLICT(pattern_key) DO UPDATE SET
                occurrences = occurrences + 1,
                wins = wins + excluded.wins,
                win_rate = CAST(wins + excluded.wins AS REAL) / (occurrences + 1),
                avg_profit_pct = (avg_profit_pct * occurrences + excluded.avg_profit_pct)
                                 / (occurrences + 1),
                last_seen = excluded.last_seen",
        )
        .bind(pattern_key)
        .bind(win)
        .bind(win as f64)
        .bind(profit_pct)
        .bind(&now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn top_patterns(&self, limit: i64) -> Result<Vec<SignalPattern>> {
        let rows: Vec<(String, i64, i64, f64, f64, String)> = sqlx::query_as(
            "SELECT pattern_key, occurrences, wins, win_rate, avg_profit_pct, last_seen
             FROM signal_patterns ORDER BY win_rate DESC, occurrences DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(pattern_from_row).collect())
    }

    /// Patterns with enough history and a win rate at or above the floor.
    pub async fn patterns_meeting(
        &self,
        min_occurrences: i64,
        min_win_rate: f64,
    ) -> Result<Vec<SignalPattern>> {
        let rows: Vec<(String, i64, i64, f64, f64, String)> = sqlx::query_as(
            "SELECT pattern_key, occurrences, wins, win_rate, avg_profit_pct, last_seen
             FROM signal_patterns
             WHERE occurrences >= ? AND win_rate >= ?
             ORDER BY win_rate DESC",
        )
        .bind(min_occurrences)
        .bind(min_win_rate)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(pattern_from_row).collect())
    }
}

fn pattern_from_row(
    (pattern_key, occurrences, wins, win_rate, avg_profit_pct, last_seen): (
        String,
        i64,
        i64,
        f64,
        f64,
        String,
    ),
) -> SignalPattern {
    SignalPattern {
        pattern_key,
        occurrences,
        wins,
        win_rate,
        avg_profit_pct,
        last_seen: parse_ts(&last_seen),
    }
}
