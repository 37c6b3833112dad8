use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::MarketDataResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconEvent {
    pub title: String,
    pub country: String,
    pub impact: String,
    pub scheduled_at: DateTime<Utc>,
}

impl EconEvent {
    pub fn is_high_impact(&self) -> bool {
        self.impact.eq_ignore_ascii_case("high")
    }
}

const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Retry window after a failed fetch. Much shorter than the normal TTL
/// so a transient feed error cannot mask events for a whole hour.
const ERROR_RETRY_TTL: Duration = Duration::from_secs(120);

/// Best-effort macro calendar. Feed errors degrade to an empty event
/// list; a missing calendar must never block a decision.
pub struct EconCalendar {
    client: reqwest::Client,
    feed_url: String,
    cache: RwLock<Option<(Instant, Vec<EconEvent>)>>,
}

impl EconCalendar {
    pub fn new(feed_url: String) -> MarketDataResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            feed_url,
            cache: RwLock::new(None),
        })
    }

    /// High-impact events inside the lookahead window plus anything that
    /// released in the past two hours.
    pub async fn relevant_events(&self, lookahead: chrono::Duration) -> Vec<EconEvent> {
        let events = self.cached_events().await;
        let now = Utc::now();
        let recent_floor = now - chrono::Duration::hours(2);
        events
            .into_iter()
            .filter(|e| {
                e.is_high_impact()
                    && e.scheduled_at >= recent_floor
                    && e.scheduled_at <= now + lookahead
            })
            .collect()
    }

    async fn cached_events(&self) -> Vec<EconEvent> {
        {
            let guard = self.cache.read().await;
            if let Some((refresh_after, events)) = guard.as_ref() {
                if Instant::now() < *refresh_after {
                    return events.clone();
                }
            }
        }

        let fetched = self.fetch().await;
        let mut guard = self.cache.write().await;
        let stale = guard.as_ref().map(|(_, events)| events.clone());
        let (refresh_after, events) = next_cache_entry(stale, fetched);
        *guard = Some((refresh_after, events.clone()));
        events
    }

    async fn fetch(&self) -> MarketDataResult<Vec<EconEvent>> {
        #[derive(Deserialize)]
        struct FeedEvent {
            title: String,
            #[serde(default)]
            country: String,
            #[serde(default)]
            impact: String,
            date: DateTime<Utc>,
        }

        let response = self.client.get(&self.feed_url).send().await?;
        let raw: Vec<FeedEvent> = response.json().await?;
        Ok(raw
            .into_iter()
            .map(|e| EconEvent {
                title: e.title,
                country: e.country,
                impact: e.impact,
                scheduled_at: e.date,
            })
            .collect())
    }
}

/// Next cache state after a refresh attempt. A failed fetch keeps the
/// stale list and schedules a quick retry instead of caching emptiness.
fn next_cache_entry(
    stale: Option<Vec<EconEvent>>,
    fetched: MarketDataResult<Vec<EconEvent>>,
) -> (Instant, Vec<EconEvent>) {
    match fetched {
        Ok(events) => (Instant::now() + CACHE_TTL, events),
        Err(e) => {
            tracing::warn!("economic calendar fetch failed, continuing without: {}", e);
            (Instant::now() + ERROR_RETRY_TTL, stale.unwrap_or_default())
        }
    }
}
