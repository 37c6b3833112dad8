use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use exchange_broker::{EntryKind, EntryOrderRequest, ExchangeClient, ExchangeOrder};
use rust_decimal::prelude::ToPrimitive;
use signal_core::{Decision, EntryStrategy};

/// Backoff schedule while waiting for the entry order to fill. A limit
/// order still unfilled after the last poll is cancelled and the trade
/// discarded.
const FILL_POLL_DELAYS_SECS: &[u64] = &[1, 2, 4, 8, 15];

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub fill_price: f64,
    pub quantity: f64,
    pub order_id: String,
}

/// Turns a confirmed decision into an open exchange position: leverage,
/// entry order, fill wait, take-profit bracket.
pub struct TradeExecutor {
    exchange: Arc<dyn ExchangeClient>,
    leverage: u32,
}

impl TradeExecutor {
    pub fn new(exchange: Arc<dyn ExchangeClient>, leverage: u32) -> Self {
        Self { exchange, leverage }
    }

    pub async fn execute(&self, decision: &Decision) -> Result<ExecutionOutcome> {
        let direction = decision
            .action
            .direction()
            .ok_or_else(|| anyhow!("action {} opens no position", decision.action.as_str()))?;

        let account = self.exchange.get_account().await?;
        let balance = account
            .total_wallet_balance_decimal()
            .to_f64()
            .unwrap_or(0.0);
        let quantity =
            position_quantity(balance, decision.size_pct, self.leverage as f64, decision.entry_price)?;

        self.exchange
            .set_leverage(&decision.instrument, self.leverage)
            .await?;

        let kind = match decision.entry_strategy {
            EntryStrategy::Market => EntryKind::Market,
            EntryStrategy::Limit => EntryKind::Limit(decision.entry_price),
        };
        let request = EntryOrderRequest {
            instrument: decision.instrument.clone(),
            direction,
            quantity,
            kind,
        };
        let order = self.exchange.submit_entry_order(&request).await?;
        tracing::info!(
            "entry order {} submitted: {} {} qty {:.6}",
            order.order_id,
            direction.as_str(),
            decision.instrument,
            quantity
        );

        let filled = self.wait_for_fill(&decision.instrument, order).await?;
        let fill_price = filled
            .avg_price_decimal()
            .and_then(|d| d.to_f64())
            .filter(|p| *p > 0.0)
            .unwrap_or(decision.entry_price);
        let filled_quantity = filled
            .executed_qty_decimal()
            .and_then(|d| d.to_f64())
            .filter(|q| *q > 0.0)
            .unwrap_or(quantity);

        self.exchange
            .place_take_profits(
                &decision.instrument,
                direction,
                filled_quantity,
                decision.take_profit_1,
                decision.take_profit_2,
            )
            .await?;

        Ok(ExecutionOutcome {
            fill_price,
            quantity: filled_quantity,
            order_id: filled.order_id,
        })
    }

    async fn wait_for_fill(&self, instrument: &str, order: ExchangeOrder) -> Result<ExchangeOrder> {
        if order.is_filled() {
            return Ok(order);
        }
        let order_id = order.order_id.clone();
        for delay in FILL_POLL_DELAYS_SECS {
            tokio::time::sleep(Duration::from_secs(*delay)).await;
            let current = self.exchange.get_order(instrument, &order_id).await?;
            if current.is_filled() {
                return Ok(current);
            }
            if !current.is_live() {
                bail!(
                    "entry order {} on {} ended {} without filling",
                    order_id,
                    instrument,
                    current.status
                );
            }
        }
        // Unfilled after the full backoff: clear the resting order so no
        // orphan can fill later against a discarded trade.
        self.exchange.cancel_all_orders(instrument).await?;
        bail!("entry order {} on {} timed out unfilled", order_id, instrument)
    }
}

/// Base-asset quantity for a position: account fraction times leverage at
/// the entry price.
pub fn position_quantity(
    balance: f64,
    size_pct: f64,
    leverage: f64,
    entry_price: f64,
) -> Result<f64> {
    if balance <= 0.0 {
        bail!("account balance {:.2} is not positive", balance);
    }
    if entry_price <= 0.0 {
        bail!("entry price {:.2} is not positive", entry_price);
    }
    let quantity = balance * (size_pct / 100.0) * leverage / entry_price;
    if quantity <= 0.0 {
        bail!("computed quantity {:.8} is not positive", quantity);
    }
    Ok(quantity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_scales_with_size_and_leverage() {
        // 2% of 10k at 10x on a 50k instrument
        let qty = position_quantity(10_000.0, 2.0, 10.0, 50_000.0).unwrap();
        assert!((qty - 0.04).abs() < 1e-12);
    }

    #[test]
    fn empty_account_cannot_size_a_position() {
        assert!(position_quantity(0.0, 2.0, 10.0, 50_000.0).is_err());
        assert!(position_quantity(10_000.0, 2.0, 10.0, 0.0).is_err());
    }
}
