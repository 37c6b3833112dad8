use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use signal_core::Direction;
use std::str::FromStr;

pub mod binance;
mod sign;

pub use binance::BinanceFuturesClient;

// ---------------------------------------------------------------------------
// Unified exchange types (venue-agnostic)
// ---------------------------------------------------------------------------

// Numeric fields stay as the exchange's strings; accessors parse on demand
// so a malformed field never poisons the whole payload.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeAccount {
    pub total_wallet_balance: String,
    pub available_balance: String,
    pub total_unrealized_pnl: String,
}

impl ExchangeAccount {
    pub fn total_wallet_balance_decimal(&self) -> Decimal {
        Decimal::from_str(&self.total_wallet_balance).unwrap_or_default()
    }
    pub fn available_balance_decimal(&self) -> Decimal {
        Decimal::from_str(&self.available_balance).unwrap_or_default()
    }
    pub fn total_unrealized_pnl_decimal(&self) -> Decimal {
        Decimal::from_str(&self.total_unrealized_pnl).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed quantity: positive long, negative short, zero flat.
    pub position_amt: String,
    pub entry_price: String,
    pub mark_price: String,
    pub unrealized_pnl: String,
    pub leverage: String,
}

impl ExchangePosition {
    pub fn position_amt_decimal(&self) -> Decimal {
        Decimal::from_str(&self.position_amt).unwrap_or_default()
    }
    pub fn entry_price_decimal(&self) -> Decimal {
        Decimal::from_str(&self.entry_price).unwrap_or_default()
    }
    pub fn mark_price_decimal(&self) -> Decimal {
        Decimal::from_str(&self.mark_price).unwrap_or_default()
    }
    pub fn unrealized_pnl_decimal(&self) -> Decimal {
        Decimal::from_str(&self.unrealized_pnl).unwrap_or_default()
    }

    pub fn is_flat(&self) -> bool {
        self.position_amt_decimal().is_zero()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub status: String,
    pub side: String,
    pub order_type: String,
    pub orig_qty: Option<String>,
    pub executed_qty: Option<String>,
    pub avg_price: Option<String>,
}

impl ExchangeOrder {
    pub fn executed_qty_decimal(&self) -> Option<Decimal> {
        self.executed_qty
            .as_ref()
            .and_then(|s| Decimal::from_str(s).ok())
    }
    pub fn avg_price_decimal(&self) -> Option<Decimal> {
        self.avg_price
            .as_ref()
            .and_then(|s| Decimal::from_str(s).ok())
    }
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }
    pub fn is_live(&self) -> bool {
        matches!(self.status.as_str(), "NEW" | "PARTIALLY_FILLED")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryKind {
    Market,
    Limit(f64),
}

#[derive(Debug, Clone)]
pub struct EntryOrderRequest {
    pub instrument: String,
    pub direction: Direction,
    pub quantity: f64,
    pub kind: EntryKind,
}

// ---------------------------------------------------------------------------
// Exchange trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Futures account balances.
    async fn get_account(&self) -> Result<ExchangeAccount>;

    /// All position records in one call; the reconciler issues exactly
    /// one of these per cycle.
    async fn get_positions(&self) -> Result<Vec<ExchangePosition>>;

    /// Set leverage before opening a position on the instrument.
    async fn set_leverage(&self, instrument: &str, leverage: u32) -> Result<()>;

    /// Submit the entry order (market or limit).
    async fn submit_entry_order(&self, request: &EntryOrderRequest) -> Result<ExchangeOrder>;

    /// Place the take-profit bracket: TP1 closes half the quantity, TP2
    /// (when present) closes whatever remains.
    async fn place_take_profits(
        &self,
        instrument: &str,
        direction: Direction,
        quantity: f64,
        tp1: f64,
        tp2: Option<f64>,
    ) -> Result<Vec<ExchangeOrder>>;

    /// Query one order.
    async fn get_order(&self, instrument: &str, order_id: &str) -> Result<ExchangeOrder>;

    /// Resting orders on the instrument.
    async fn get_open_orders(&self, instrument: &str) -> Result<Vec<ExchangeOrder>>;

    /// Cancel every resting order on the instrument (orphan cleanup).
    async fn cancel_all_orders(&self, instrument: &str) -> Result<()>;

    /// Reduce-only market close of the given quantity.
    async fn close_position_market(
        &self,
        instrument: &str,
        direction: Direction,
        quantity: f64,
    ) -> Result<ExchangeOrder>;

    /// Whether the client points at a test venue.
    fn is_testnet(&self) -> bool;

    /// Venue name for logging.
    fn exchange_name(&self) -> &str;
}
