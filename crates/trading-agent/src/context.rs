//! Context assembly: everything the reasoning service sees for one
//! decision, plus the source-weighting math that shapes it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use market_data::{EconEvent, InstrumentSnapshot};
use serde_json::{json, Value};
use signal_core::{
    clamp_trust_weight, Direction, SignalMessage, SignalPattern, SourceProfile, TechBucket, Trade,
    TRUST_WEIGHT_DEFAULT,
};

/// Sources with fewer graded calls than this are still on trial: their
/// weight is pulled toward neutral so one lucky call cannot dominate.
pub const TRIAL_CALL_COUNT: i64 = 5;

/// A source that has not been graded in this many days starts decaying
/// back toward neutral; after another 60 idle days it is fully neutral.
pub const IDLE_DECAY_DAYS: i64 = 30;

/// Trust weight as the decision context should see it, after trial-period
/// damping and idle decay. The stored weight is untouched.
pub fn effective_weight(profile: &SourceProfile, now: DateTime<Utc>) -> f64 {
    let mut weight = profile.trust_weight;

    if profile.total_calls < TRIAL_CALL_COUNT {
        let fraction = profile.total_calls as f64 / TRIAL_CALL_COUNT as f64;
        weight = TRUST_WEIGHT_DEFAULT + (weight - TRUST_WEIGHT_DEFAULT) * fraction;
    }

    let idle_days = (now - profile.updated_at).num_days();
    if idle_days > IDLE_DECAY_DAYS {
        let factor = (1.0 - (idle_days - IDLE_DECAY_DAYS) as f64 / 60.0).clamp(0.0, 1.0);
        weight = TRUST_WEIGHT_DEFAULT + (weight - TRUST_WEIGHT_DEFAULT) * factor;
    }

    clamp_trust_weight(weight)
}

/// Messages scoring below this are left out of the context bundle. They
/// stay in the signal record either way.
pub const MIN_MESSAGE_QUALITY: u8 = 4;

/// Sources need this many graded calls before posture specialization
/// tilts their weight.
pub const SPECIALIZATION_MIN_CALLS: i64 = 10;

/// Heuristic 0-10 quality score for one raw message: does it read like a
/// trade call, or like chatter? Direction plus concrete levels scores
/// high; pure technical commentary lands mid-band; everything else sinks.
pub fn message_quality(text: &str) -> u8 {
    let lower = text.to_lowercase();
    let mut score = 0u8;
    if message_direction(text).is_some() {
        score += 6;
    }
    if lower.chars().any(|c| c.is_ascii_digit()) {
        score += 2;
    }
    if ["stop", "target", "take profit", "tp1", "tp2"]
        .iter()
        .any(|k| lower.contains(k))
    {
        score += 2;
    }
    if score == 0
        && ["support", "resistance", "chart", "trend", "rsi", "macd", "volume"]
            .iter()
            .any(|k| lower.contains(k))
    {
        score = 4;
    }
    score.min(10)
}

/// Weight multiplier for a source under the current technical posture:
/// up to +-30% depending on how their accuracy there compares to their
/// overall record. A thin overall record is read as coin-flip.
pub fn specialization_factor(overall_accuracy: f64, bucket_accuracy: f64) -> f64 {
    let overall = if overall_accuracy > 0.0 {
        overall_accuracy
    } else {
        0.5
    };
    1.0 + (0.3 * (bucket_accuracy - overall) / overall).clamp(-0.3, 0.3)
}

/// Crude directional read of one message. The reasoning service does the
/// real interpretation; this only feeds the consensus summary.
pub fn message_direction(text: &str) -> Option<Direction> {
    let lower = text.to_lowercase();
    let bullish = ["long", "buy", "bullish", "accumulate", "breakout up"];
    let bearish = ["short", "sell", "bearish", "dump", "breakdown"];
    let bull = bullish.iter().any(|k| lower.contains(k));
    let bear = bearish.iter().any(|k| lower.contains(k));
    match (bull, bear) {
        (true, false) => Some(Direction::Long),
        (false, true) => Some(Direction::Short),
        _ => None,
    }
}

/// Trust weight a source carries in this bundle: effective weight times
/// its posture-specialization factor, kept inside the trust range.
pub fn bundle_weight(
    source_id: &str,
    profiles: &[SourceProfile],
    specialization: &HashMap<String, f64>,
    now: DateTime<Utc>,
) -> f64 {
    let base = profiles
        .iter()
        .find(|p| p.source_id == source_id)
        .map(|p| effective_weight(p, now))
        .unwrap_or(TRUST_WEIGHT_DEFAULT);
    let factor = specialization.get(source_id).copied().unwrap_or(1.0);
    clamp_trust_weight(base * factor)
}

/// Weighted consensus across the batch in [-1, 1]: +1 when every weighted
/// voice is long, -1 when every weighted voice is short, 0 when silent or
/// perfectly split.
pub fn consensus<'a, I>(
    messages: I,
    profiles: &[SourceProfile],
    specialization: &HashMap<String, f64>,
    now: DateTime<Utc>,
) -> f64
where
    I: IntoIterator<Item = &'a SignalMessage>,
{
    let mut long_weight = 0.0;
    let mut short_weight = 0.0;
    for message in messages {
        let weight = bundle_weight(&message.source_id, profiles, specialization, now);
        match message_direction(&message.raw_text) {
            Some(Direction::Long) => long_weight += weight,
            Some(Direction::Short) => short_weight += weight,
            None => {}
        }
    }

    let total = long_weight + short_weight;
    if total <= 0.0 {
        return 0.0;
    }
    (long_weight - short_weight) / total
}

/// Bucket the snapshot's technical posture. Each timeframe votes with its
/// MACD state and EMA stacking; a clear majority is required to leave
/// "mixed".
pub fn tech_bucket_for(snapshot: &InstrumentSnapshot) -> TechBucket {
    let mut score = 0i32;
    for tf in &snapshot.timeframes {
        match tf.macd_state.as_deref() {
            Some("bullish") => score += 1,
            Some("bearish") => score -= 1,
            _ => {}
        }
        match tf.ema_trend.as_deref() {
            Some("uptrend") => score += 1,
            Some("downtrend") => score -= 1,
            _ => {}
        }
    }
    if score >= 3 {
        TechBucket::BullishTech
    } else if score <= -3 {
        TechBucket::BearishTech
    } else {
        TechBucket::MixedTech
    }
}

/// The full bundle POSTed to the reasoning service. Low-quality chatter
/// is scored out of the bundle here; the persisted signal record keeps
/// every message.
#[allow(clippy::too_many_arguments)]
pub fn build_bundle(
    instrument: &str,
    batch: &[SignalMessage],
    snapshot: &InstrumentSnapshot,
    events: &[EconEvent],
    open_trade: Option<&Trade>,
    patterns: &[SignalPattern],
    profiles: &[SourceProfile],
    specialization: &HashMap<String, f64>,
    whitelist: &[String],
    now: DateTime<Utc>,
) -> Value {
    let kept: Vec<(&SignalMessage, u8)> = batch
        .iter()
        .map(|m| (m, message_quality(&m.raw_text)))
        .filter(|(_, quality)| *quality >= MIN_MESSAGE_QUALITY)
        .collect();
    if kept.len() < batch.len() {
        tracing::debug!(
            "{} of {} messages scored below quality floor",
            batch.len() - kept.len(),
            batch.len()
        );
    }

    let messages: Vec<Value> = kept
        .iter()
        .map(|(m, quality)| {
            json!({
                "source_id": m.source_id,
                "channel": m.channel,
                "text": m.raw_text,
                "instruments": m.detected_instruments,
                "quality_score": quality,
                "received_at": m.received_at.to_rfc3339(),
            })
        })
        .collect();

    let sources: Vec<Value> = profiles
        .iter()
        .map(|p| {
            json!({
                "source_id": p.source_id,
                "trust_weight": bundle_weight(&p.source_id, profiles, specialization, now),
                "lifetime_accuracy": p.lifetime_accuracy,
                "recent_7d_accuracy": p.recent_7d_accuracy,
                "graded_calls": p.total_calls,
            })
        })
        .collect();

    let calendar: Vec<Value> = events
        .iter()
        .map(|e| {
            json!({
                "title": e.title,
                "country": e.country,
                "scheduled_at": e.scheduled_at.to_rfc3339(),
            })
        })
        .collect();

    let open_position = open_trade.map(|t| {
        json!({
            "trade_id": t.id,
            "direction": t.direction.as_str(),
            "entry_price": t.entry_price,
            "stop_loss": t.stop_loss,
            "take_profit_1": t.take_profit_1,
            "take_profit_2": t.take_profit_2,
            "state": t.state.as_str(),
        })
    });

    let top_patterns: Vec<Value> = patterns
        .iter()
        .map(|p| {
            json!({
                "pattern": p.pattern_key,
                "occurrences": p.occurrences,
                "win_rate": p.win_rate,
                "avg_profit_pct": p.avg_profit_pct,
            })
        })
        .collect();

    json!({
        "instrument": instrument,
        "whitelist": whitelist,
        "messages": messages,
        "consensus": consensus(kept.iter().map(|(m, _)| *m), profiles, specialization, now),
        "sources": sources,
        "market": snapshot,
        "tech_bucket": tech_bucket_for(snapshot).as_str(),
        "calendar": calendar,
        "open_position": open_position,
        "winning_patterns": top_patterns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_data::TimeframeStats;

    fn profile(source_id: &str, weight: f64, calls: i64, updated_at: DateTime<Utc>) -> SourceProfile {
        SourceProfile {
            source_id: source_id.to_string(),
            trust_weight: weight,
            total_calls: calls,
            correct_calls: 0,
            lifetime_accuracy: 0.0,
            recent_7d_accuracy: 0.0,
            recent_30d_accuracy: 0.0,
            updated_at,
        }
    }

    fn message(source_id: &str, text: &str) -> SignalMessage {
        SignalMessage {
            id: 0,
            source_id: source_id.to_string(),
            channel: "chat".to_string(),
            raw_text: text.to_string(),
            detected_instruments: vec!["BTCUSDT".to_string()],
            attachment_urls: Vec::new(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn trial_sources_are_damped_toward_neutral() {
        let now = Utc::now();
        let p = profile("new_guy", 2.0, 2, now);
        // 1.0 + (2.0 - 1.0) * 2/5
        assert!((effective_weight(&p, now) - 1.4).abs() < 1e-9);

        let seasoned = profile("veteran", 2.0, 50, now);
        assert_eq!(effective_weight(&seasoned, now), 2.0);
    }

    #[test]
    fn idle_sources_decay_toward_neutral() {
        let now = Utc::now();
        let recently_active = profile("a", 1.8, 50, now - chrono::Duration::days(10));
        assert!((effective_weight(&recently_active, now) - 1.8).abs() < 1e-9);

        // 60 idle days: 30 past the threshold, half decayed
        let idle = profile("b", 1.8, 50, now - chrono::Duration::days(60));
        assert!((effective_weight(&idle, now) - 1.4).abs() < 1e-9);

        // 90+ idle days: fully neutral
        let gone = profile("c", 1.8, 50, now - chrono::Duration::days(120));
        assert!((effective_weight(&gone, now) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn consensus_weighs_trusted_voices_heavier() {
        let now = Utc::now();
        let none = HashMap::new();
        let profiles = vec![
            profile("strong", 2.0, 50, now),
            profile("weak", 0.5, 50, now),
        ];
        let batch = vec![
            message("strong", "going long BTC"),
            message("weak", "short it"),
        ];
        // (2.0 - 0.5) / 2.5
        assert!((consensus(&batch, &profiles, &none, now) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn consensus_is_zero_without_directional_messages() {
        let now = Utc::now();
        let batch = vec![message("a", "interesting chart")];
        assert_eq!(consensus(&batch, &[], &HashMap::new(), now), 0.0);
    }

    #[test]
    fn specialization_tilts_the_bundle_weight() {
        let now = Utc::now();
        let profiles = vec![profile("spec", 1.0, 50, now)];
        let mut specialization = HashMap::new();
        specialization.insert("spec".to_string(), 1.2);
        assert!(
            (bundle_weight("spec", &profiles, &specialization, now) - 1.2).abs() < 1e-9
        );
        // Unknown sources are unaffected
        assert_eq!(
            bundle_weight("other", &profiles, &specialization, now),
            TRUST_WEIGHT_DEFAULT
        );
    }

    #[test]
    fn specialization_factor_is_bounded() {
        // Better in this posture than overall: boosted proportionally
        assert!((specialization_factor(0.5, 0.6) - 1.06).abs() < 1e-9);
        // Worse: cut
        assert!((specialization_factor(0.5, 0.2) - 0.82).abs() < 1e-9);
        // Never more than +-30%
        assert!((specialization_factor(0.2, 0.8) - 1.3).abs() < 1e-9);
        assert!((specialization_factor(0.8, 0.0) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn quality_score_separates_calls_from_chatter() {
        // Direction + levels + stop vocabulary reads as a real call
        assert!(message_quality("Long BTC at 62000, stop 60000, target 66000") >= 8);
        // Direction without levels lands mid-band
        let d = message_quality("feeling bearish here");
        assert!((4..=7).contains(&d));
        // Technical commentary without a side still passes the floor
        assert_eq!(message_quality("watching the resistance on the chart"), 4);
        // Chatter sinks below it
        assert!(message_quality("gm everyone") < MIN_MESSAGE_QUALITY);
    }

    #[test]
    fn bundle_keeps_calls_and_drops_chatter() {
        let now = Utc::now();
        let snapshot = InstrumentSnapshot {
            instrument: "BTCUSDT".to_string(),
            price: 62_000.0,
            change_24h_pct: 0.0,
            quote_volume_24h: 0.0,
            funding_rate: None,
            long_short_ratio: None,
            timeframes: Vec::new(),
        };
        let batch = vec![
            message("a", "Long BTC at 62000, stop 60000"),
            message("b", "gm everyone"),
        ];
        let bundle = build_bundle(
            "BTCUSDT",
            &batch,
            &snapshot,
            &[],
            None,
            &[],
            &[],
            &HashMap::new(),
            &["BTCUSDT".to_string()],
            now,
        );
        let kept = bundle["messages"].as_array().unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["source_id"], "a");
        assert!(kept[0]["quality_score"].as_u64().unwrap() >= MIN_MESSAGE_QUALITY as u64);
        // Chatter does not vote in the consensus either
        assert_eq!(bundle["consensus"], 1.0);
    }

    #[test]
    fn tech_bucket_needs_a_clear_majority() {
        fn tf(macd: &str, ema: &str) -> TimeframeStats {
            TimeframeStats {
                interval: "1h".to_string(),
                rsi_14: None,
                macd_histogram: None,
                macd_state: Some(macd.to_string()),
                bollinger_position: None,
                ema_trend: Some(ema.to_string()),
                volume_surge: None,
                close_trend_pct: None,
            }
        }
        let snapshot = |timeframes| InstrumentSnapshot {
            instrument: "BTCUSDT".to_string(),
            price: 50_000.0,
            change_24h_pct: 0.0,
            quote_volume_24h: 0.0,
            funding_rate: None,
            long_short_ratio: None,
            timeframes,
        };

        let bullish = snapshot(vec![
            tf("bullish", "uptrend"),
            tf("bullish", "uptrend"),
            tf("bearish", "mixed"),
        ]);
        assert_eq!(tech_bucket_for(&bullish), TechBucket::BullishTech);

        let split = snapshot(vec![tf("bullish", "mixed"), tf("bearish", "mixed")]);
        assert_eq!(tech_bucket_for(&split), TechBucket::MixedTech);
    }
}
