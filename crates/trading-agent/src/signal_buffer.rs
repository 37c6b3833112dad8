use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use signal_core::{detect::detect_instruments, SignalMessage};
use trade_store::TradeStore;

/// Short-window ingestion buffer. Every inbound message is persisted
/// immediately (the raw log is append-only), then held in memory until the
/// flush tick hands the batch to the pipeline. Batching lets the decision
/// see a multi-message signal (entry + stop posted seconds apart) as one
/// unit instead of racing each line.
pub struct SignalBuffer {
    store: Arc<TradeStore>,
    pending: Mutex<Vec<SignalMessage>>,
}

impl SignalBuffer {
    pub fn new(store: Arc<TradeStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub async fn push(
        &self,
        source_id: &str,
        channel: &str,
        text: &str,
        attachment_urls: &[String],
        whitelist: &[String],
    ) -> Result<()> {
        let detected = detect_instruments(text, whitelist);
        let id = self
            .store
            .insert_signal_message(source_id, channel, text, &detected, attachment_urls)
            .await?;
        tracing::debug!(
            "buffered message #{} from {} ({} instruments)",
            id,
            source_id,
            detected.len()
        );

        let message = SignalMessage {
            id,
            source_id: source_id.to_string(),
            channel: channel.to_string(),
            raw_text: text.to_string(),
            detected_instruments: detected,
            attachment_urls: attachment_urls.to_vec(),
            received_at: Utc::now(),
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(message);
        }
        Ok(())
    }

    /// Take the current batch, leaving the buffer empty.
    pub fn drain(&self) -> Vec<SignalMessage> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;

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

    #[tokio::test]
    async fn push_persists_and_buffers() {
        let store = memory_store().await;
        let buffer = SignalBuffer::new(Arc::clone(&store));
        let whitelist = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];

        buffer
            .push("trader_a", "alpha-chat", "BTC long here", &[], &whitelist)
            .await
            .unwrap();
        buffer
            .push("trader_b", "alpha-chat", "agree on btc", &[], &whitelist)
            .await
            .unwrap();

        assert_eq!(buffer.len(), 2);
        let batch = buffer.drain();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].detected_instruments, vec!["BTCUSDT".to_string()]);
        assert!(buffer.is_empty());

        // Raw log survives the drain
        let since = Utc::now() - chrono::Duration::minutes(5);
        let persisted = store.messages_since(since).await.unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn drain_on_empty_buffer_is_empty() {
        let store = memory_store().await;
        let buffer = SignalBuffer::new(store);
        assert!(buffer.drain().is_empty());
    }
}
