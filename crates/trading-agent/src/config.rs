use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Cadences
    pub buffer_flush_seconds: u64,     // 60: signal batching window
    pub scan_interval_seconds: u64,    // 180: proactive market scan
    pub reconcile_interval_seconds: u64, // 30: position reconciliation
    pub command_poll_seconds: u64,     // 5: operator chat polling

    // Execution
    pub leverage: u32,
    pub confirm_timeout_seconds: u64,  // unanswered prompts reject after this
    pub stop_breach_confirmations: u32, // consecutive breaches before forced close
    pub scan_lookback_seconds: i64,    // message window a scan re-reads

    // Learning
    pub weight_scale: f64,             // accuracy -> trust weight multiplier
    pub exit_deviation_guard: f64,     // skip learning when exit strays this far
    pub pattern_scan_every: i64,       // pattern discovery cadence, in closed trades
    pub retune_every: i64,             // parameter retune cadence, in closed trades

    // Reporting
    pub timezone: String,
    pub report_hour_local: u32,

    // Collaborators
    pub inference_url: String,
    pub binance_api_key: String,
    pub binance_secret_key: String,
    pub binance_base_url: String,
    pub market_data_url: String,
    pub calendar_feed_url: String,
    pub telegram_bot_token: String,
    pub telegram_chat_id: i64,

    // Database
    pub database_url: String,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            buffer_flush_seconds: env::var("BUFFER_FLUSH_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
            scan_interval_seconds: env::var("SCAN_INTERVAL")
                .unwrap_or_else(|_| "180".to_string())
                .parse()?,
            reconcile_interval_seconds: env::var("RECONCILE_INTERVAL")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            command_poll_seconds: env::var("COMMAND_POLL_SECONDS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,

            leverage: env::var("LEVERAGE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            confirm_timeout_seconds: env::var("CONFIRM_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            stop_breach_confirmations: env::var("STOP_BREACH_CONFIRMATIONS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()?,
            scan_lookback_seconds: env::var("SCAN_LOOKBACK_SECONDS")
                .unwrap_or_else(|_| "900".to_string())
                .parse()?,

            weight_scale: env::var("WEIGHT_SCALE")
                .unwrap_or_else(|_| "2.0".to_string())
                .parse()?,
            exit_deviation_guard: env::var("EXIT_DEVIATION_GUARD")
                .unwrap_or_else(|_| "0.05".to_string())
                .parse()?,
            pattern_scan_every: env::var("PATTERN_SCAN_EVERY")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
            retune_every: env::var("RETUNE_EVERY")
                .unwrap_or_else(|_| "50".to_string())
                .parse()?,

            timezone: env::var("TIMEZONE").unwrap_or_else(|_| "UTC".to_string()),
            report_hour_local: env::var("REPORT_HOUR")
                .unwrap_or_else(|_| "8".to_string())
                .parse()?,

            inference_url: env::var("INFERENCE_URL")
                .unwrap_or_else(|_| "http://localhost:8100".to_string()),
            binance_api_key: env::var("BINANCE_API_KEY")
                .context("BINANCE_API_KEY not set")?,
            binance_secret_key: env::var("BINANCE_SECRET_KEY")
                .context("BINANCE_SECRET_KEY not set")?,
            binance_base_url: env::var("BINANCE_BASE_URL")
                .unwrap_or_else(|_| "https://testnet.binancefuture.com".to_string()),
            market_data_url: env::var("MARKET_DATA_URL")
                .unwrap_or_else(|_| "https://fapi.binance.com".to_string()),
            calendar_feed_url: env::var("CALENDAR_FEED_URL").unwrap_or_default(),
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            telegram_chat_id: env::var("TELEGRAM_CHAT_ID")
                .unwrap_or_else(|_| "0".to_string())
                .parse()?,

            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:signaldesk.db".to_string()),
        };

        Ok(config)
    }
}
