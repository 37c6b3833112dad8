use serde::{Deserialize, Serialize};

/// Per-instrument trading costs. Both legs are assumed to fill as taker,
/// and slippage is charged on each leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub taker_fee_rate: f64,
    pub slippage_rate: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        // Binance USDT-perp taker 0.05%, slippage budget 0.02% per leg
        Self {
            taker_fee_rate: 0.0005,
            slippage_rate: 0.0002,
        }
    }
}

impl FeeSchedule {
    /// Total cost of a round trip as a fraction of notional.
    pub fn round_trip_rate(&self) -> f64 {
        self.taker_fee_rate + self.taker_fee_rate + 2.0 * self.slippage_rate
    }

    /// Round-trip cost in price units at the given entry.
    pub fn round_trip_cost(&self, entry_price: f64) -> f64 {
        entry_price * self.round_trip_rate()
    }

    /// Round-trip cost as a percentage of margin at the given leverage.
    /// Fees are charged on notional, so they scale with leverage.
    pub fn round_trip_cost_pct(&self, leverage: f64) -> f64 {
        self.round_trip_rate() * leverage * 100.0
    }

    /// Realized PnL as a percentage of margin: leverage-scaled,
    /// direction-signed price move minus round-trip costs.
    pub fn net_pnl_pct(
        &self,
        direction_sign: f64,
        entry_price: f64,
        exit_price: f64,
        leverage: f64,
    ) -> f64 {
        if entry_price <= 0.0 {
            return 0.0;
        }
        let gross = direction_sign * (exit_price - entry_price) / entry_price * leverage * 100.0;
        gross - self.round_trip_cost_pct(leverage)
    }
}
