use anyhow::Result;
use chrono::{DateTime, Utc};
use signal_core::{
    Direction, SignalMessage, SourceCall, SourceProfile, TechBucket, TRUST_WEIGHT_DEFAULT,
};

use crate::store::{parse_ts, TradeStore};

impl TradeStore {
    // -- signal messages ------------------------------------------------------

    pub async fn insert_signal_message(
        &self,
        source_id: &str,
        channel: &str,
        raw_text: &str,
        detected_instruments: &[String],
        attachment_urls: &[String],
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO signal_messages (
                source_id, channel, raw_text, detected_instruments,
                attachment_urls, received_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id",
        )
        .bind(source_id)
        .bind(channel)
        .bind(raw_text)
        .bind(detected_instruments.join(","))
        .bind(attachment_urls.join(","))
        .bind(Utc::now().to_rfc3339())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn messages_since(&self, since: DateTime<Utc>) -> Result<Vec<SignalMessage>> {
        let rows: Vec<(i64, String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, source_id, channel, raw_text, detected_instruments, received_at
             FROM signal_messages WHERE received_at >= ? ORDER BY received_at",
        )
        .bind(since.to_rfc3339())
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, source_id, channel, raw_text, instruments, received_at)| SignalMessage {
                id,
                source_id,
                channel,
                raw_text,
                detected_instruments: split_csv(&instruments),
                attachment_urls: Vec::new(),
                received_at: parse_ts(&received_at),
            })
            .collect())
    }

    // -- source profiles ------------------------------------------------------

    pub async fn get_or_create_profile(&self, source_id: &str) -> Result<SourceProfile> {
        if let Some(profile) = self.get_profile(source_id).await? {
            return Ok(profile);
        }
        sqlx::query(
            "INSERT INTO source_profiles (source_id, trust_weight, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(source_id) DO NOTHING",
        )
        .bind(source_id)
        .bind(TRUST_WEIGHT_DEFAULT)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(self
            .get_profile(source_id)
            .await?
            .unwrap_or_else(|| SourceProfile::new(source_id)))
    }

    pub async fn get_profile(&self, source_id: &str) -> Result<Option<SourceProfile>> {
        let row: Option<(String, f64, i64, i64, f64, f64, f64, String)> = sqlx::query_as(
            "SELECT source_id, trust_weight, total_calls, correct_calls,
                    lifetime_accuracy, recent_7d_accuracy, recent_30d_accuracy, updated_at
             FROM source_profiles WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(profile_from_row))
    }

    /// All known profiles, most trusted first. Feeds context assembly.
    pub async fn ranked_profiles(&self) -> Result<Vec<SourceProfile>> {
        let rows: Vec<(String, f64, i64, i64, f64, f64, f64, String)> = sqlx::query_as(
            "SELECT source_id, trust_weight, total_calls, correct_calls,
                    lifetime_accuracy, recent_7d_accuracy, recent_30d_accuracy, updated_at
             FROM source_profiles ORDER BY trust_weight DESC, total_calls DESC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(profile_from_row).collect())
    }

    pub async fn update_profile(&self, profile: &SourceProfile) -> Result<()> {
        sqlx::query(
            "UPDATE source_profiles
             SET trust_weight = ?, total_calls = ?, correct_calls = ?,
                 lifetime_accuracy = ?, recent_7d_accuracy = ?,
                 recent_30d_accuracy = ?, updated_at = ?
             WHERE source_id = ?",
        )
        .bind(profile.trust_weight)
        .bind(profile.total_calls)
        .bind(profile.correct_calls)
        .bind(profile.lifetime_accuracy)
        .bind(profile.recent_7d_accuracy)
        .bind(profile.recent_30d_accuracy)
        .bind(Utc::now().to_rfc3339())
        .bind(&profile.source_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // -- per-trade source calls -----------------------------------------------

    pub async fn insert_source_call(
        &self,
        trade_id: i64,
        source_id: &str,
        direction: Direction,
        message_excerpt: &str,
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO source_calls (trade_id, source_id, direction, message_excerpt, recorded_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(trade_id)
        .bind(source_id)
        .bind(direction.as_str())
        .bind(message_excerpt)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn calls_for_trade(&self, trade_id: i64) -> Result<Vec<SourceCall>> {
        let rows: Vec<(i64, i64, String, String, String, String, Option<i64>)> = sqlx::query_as(
            "SELECT id, trade_id, source_id, direction, message_excerpt, recorded_at, correct
             FROM source_calls WHERE trade_id = ? ORDER BY id",
        )
        .bind(trade_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, trade_id, source_id, direction, excerpt, recorded_at, correct)| SourceCall {
                    id,
                    trade_id,
                    source_id,
                    direction: Direction::parse(&direction).unwrap_or(Direction::Long),
                    message_excerpt: excerpt,
                    recorded_at: parse_ts(&recorded_at),
                    correct: correct.map(|c| c != 0),
                },
            )
            .collect())
    }

    pub async fn grade_source_call(&self, call_id: i64, correct: bool) -> Result<()> {
        sqlx::query("UPDATE source_calls SET correct = ? WHERE id = ?")
            .bind(if correct { 1i64 } else { 0i64 })
            .bind(call_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Accuracy over graded calls recorded after `since`. None when the
    /// source has no graded calls in the window.
    pub async fn source_accuracy_since(
        &self,
        source_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let (total, correct): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), SUM(correct) FROM source_calls
             WHERE source_id = ? AND correct IS NOT NULL AND recorded_at >= ?",
        )
        .bind(source_id)
        .bind(since.to_rfc3339())
        .fetch_one(self.pool())
        .await?;

        if total == 0 {
            return Ok(None);
        }
        Ok(Some(correct.unwrap_or(0) as f64 / total as f64))
    }

    /// Accuracy over graded calls made under one technical posture. None
    /// when the source has no graded calls there.
    pub async fn source_bucket_accuracy(
        &self,
        source_id: &str,
        bucket: TechBucket,
    ) -> Result<Option<f64>> {
        let (total, correct): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), SUM(sc.correct) FROM source_calls sc
             JOIN trades t ON t.id = sc.trade_id
             WHERE sc.source_id = ? AND sc.correct IS NOT NULL AND t.tech_bucket = ?",
        )
        .bind(source_id)
        .bind(bucket.as_str())
        .fetch_one(self.pool())
        .await?;

        if total == 0 {
            return Ok(None);
        }
        Ok(Some(correct.unwrap_or(0) as f64 / total as f64))
    }

    pub async fn graded_call_count(&self, source_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM source_calls WHERE source_id = ? AND correct IS NOT NULL",
        )
        .bind(source_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn profile_from_row(
    (source_id, trust_weight, total_calls, correct_calls, lifetime, recent7, recent30, updated_at): (
        String,
        f64,
        i64,
        i64,
        f64,
        f64,
        f64,
        String,
    ),
) -> SourceProfile {
    SourceProfile {
        source_id,
        trust_weight,
        total_calls,
        correct_calls,
        lifetime_accuracy: lifetime,
        recent_7d_accuracy: recent7,
        recent_30d_accuracy: recent30,
        updated_at: parse_ts(&updated_at),
    }
}
