use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde_json::Value;
use signal_core::Direction;
use std::time::Duration;

use crate::sign::sign_query;
use crate::{
    EntryKind, EntryOrderRequest, ExchangeAccount, ExchangeClient, ExchangeOrder, ExchangePosition,
};

const RECV_WINDOW_MS: u64 = 5000;

/// Binance USDT-margined futures client. Intended for the testnet; live
/// use requires an explicit override at startup.
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
}

impl BinanceFuturesClient {
    pub fn new(api_key: String, secret_key: String, base_url: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            secret_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn side_for(direction: Direction, closing: bool) -> &'static str {
        match (direction, closing) {
            (Direction::Long, false) | (Direction::Short, true) => "BUY",
            (Direction::Short, false) | (Direction::Long, true) => "SELL",
        }
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<Value> {
        params.push((
            "timestamp".to_string(),
            chrono::Utc::now().timestamp_millis().to_string(),
        ));
        params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));

        let query: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = sign_query(&self.secret_key, &query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let mut headers = header::HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            header::HeaderValue::from_str(&self.api_key)
                .map_err(|_| anyhow!("API key contains invalid header characters"))?,
        );

        let response = self
            .client
            .request(method, &url)
            .headers(headers)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Binance API error ({status}): {error_text}"));
        }

        Ok(response.json::<Value>().await?)
    }

    async fn submit_order(&self, params: Vec<(String, String)>) -> Result<ExchangeOrder> {
        let value = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        parse_order(&value)
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    async fn get_account(&self) -> Result<ExchangeAccount> {
        let value = self
            .signed_request(Method::GET, "/fapi/v2/account", Vec::new())
            .await?;
        Ok(ExchangeAccount {
            total_wallet_balance: str_field(&value, "totalWalletBalance"),
            available_balance: str_field(&value, "availableBalance"),
            total_unrealized_pnl: str_field(&value, "totalUnrealizedProfit"),
        })
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        let value = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;
        let rows = value
            .as_array()
            .ok_or_else(|| anyhow!("positionRisk: expected array"))?;
        Ok(rows
            .iter()
            .map(|row| ExchangePosition {
                symbol: str_field(row, "symbol"),
                position_amt: str_field(row, "positionAmt"),
                entry_price: str_field(row, "entryPrice"),
                mark_price: str_field(row, "markPrice"),
                unrealized_pnl: str_field(row, "unRealizedProfit"),
                leverage: str_field(row, "leverage"),
            })
            .collect())
    }

    async fn set_leverage(&self, instrument: &str, leverage: u32) -> Result<()> {
        self.signed_request(
            Method::POST,
            "/fapi/v1/leverage",
            vec![
                ("symbol".to_string(), instrument.to_string()),
                ("leverage".to_string(), leverage.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn submit_entry_order(&self, request: &EntryOrderRequest) -> Result<ExchangeOrder> {
        let mut params = vec![
            ("symbol".to_string(), request.instrument.clone()),
            (
                "side".to_string(),
                Self::side_for(request.direction, false).to_string(),
            ),
            ("quantity".to_string(), fmt_qty(request.quantity)),
            (
                "newClientOrderId".to_string(),
                format!("entry-{}", uuid::Uuid::new_v4()),
            ),
        ];
        match request.kind {
            EntryKind::Market => {
                params.push(("type".to_string(), "MARKET".to_string()));
            }
            EntryKind::Limit(price) => {
                params.push(("type".to_string(), "LIMIT".to_string()));
                params.push(("timeInForce".to_string(), "GTC".to_string()));
                params.push(("price".to_string(), fmt_price(price)));
            }
        }

        tracing::info!(
            "Submitting {} {} entry for {} qty {}",
            request.direction.as_str(),
            request.instrument,
            self.exchange_name(),
            fmt_qty(request.quantity)
        );
        self.submit_order(params).await
    }

    async fn place_take_profits(
        &self,
        instrument: &str,
        direction: Direction,
        quantity: f64,
        tp1: f64,
        tp2: Option<f64>,
    ) -> Result<Vec<ExchangeOrder>> {
        let close_side = Self::side_for(direction, true).to_string();
        let mut orders = Vec::new();

        // TP1 takes half off
        let tp1_order = self
            .submit_order(vec![
                ("symbol".to_string(), instrument.to_string()),
                ("side".to_string(), close_side.clone()),
                ("type".to_string(), "TAKE_PROFIT_MARKET".to_string()),
                ("stopPrice".to_string(), fmt_price(tp1)),
                ("quantity".to_string(), fmt_qty(quantity / 2.0)),
                ("reduceOnly".to_string(), "true".to_string()),
                (
                    "newClientOrderId".to_string(),
                    format!("tp1-{}", uuid::Uuid::new_v4()),
                ),
            ])
            .await?;
        orders.push(tp1_order);

        // TP2 closes whatever is left, so rounding on the half split
        // cannot strand a remainder
        if let Some(tp2) = tp2 {
            let tp2_order = self
                .submit_order(vec![
                    ("symbol".to_string(), instrument.to_string()),
                    ("side".to_string(), close_side),
                    ("type".to_string(), "TAKE_PROFIT_MARKET".to_string()),
                    ("stopPrice".to_string(), fmt_price(tp2)),
                    ("closePosition".to_string(), "true".to_string()),
                    (
                        "newClientOrderId".to_string(),
                        format!("tp2-{}", uuid::Uuid::new_v4()),
                    ),
                ])
                .await?;
            orders.push(tp2_order);
        }

        Ok(orders)
    }

    async fn get_order(&self, instrument: &str, order_id: &str) -> Result<ExchangeOrder> {
        let value = self
            .signed_request(
                Method::GET,
                "/fapi/v1/order",
                vec![
                    ("symbol".to_string(), instrument.to_string()),
                    ("orderId".to_string(), order_id.to_string()),
                ],
            )
            .await?;
        parse_order(&value)
    }

    async fn get_open_orders(&self, instrument: &str) -> Result<Vec<ExchangeOrder>> {
        let value = self
            .signed_request(
                Method::GET,
                "/fapi/v1/openOrders",
                vec![("symbol".to_string(), instrument.to_string())],
            )
            .await?;
        let rows = value
            .as_array()
            .ok_or_else(|| anyhow!("openOrders: expected array"))?;
        rows.iter().map(parse_order).collect()
    }

    async fn cancel_all_orders(&self, instrument: &str) -> Result<()> {
        self.signed_request(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            vec![("symbol".to_string(), instrument.to_string())],
        )
        .await?;
        tracing::info!("Cancelled all resting orders on {}", instrument);
        Ok(())
    }

    async fn close_position_market(
        &self,
        instrument: &str,
        direction: Direction,
        quantity: f64,
    ) -> Result<ExchangeOrder> {
        self.submit_order(vec![
            ("symbol".to_string(), instrument.to_string()),
            (
                "side".to_string(),
                Self::side_for(direction, true).to_string(),
            ),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), fmt_qty(quantity)),
            ("reduceOnly".to_string(), "true".to_string()),
            (
                "newClientOrderId".to_string(),
                format!("close-{}", uuid::Uuid::new_v4()),
            ),
        ])
        .await
    }

    fn is_testnet(&self) -> bool {
        self.base_url.contains("testnet")
    }

    fn exchange_name(&self) -> &str {
        "binance-futures"
    }
}

fn str_field(value: &Value, field: &str) -> String {
    match value.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn opt_str_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_order(value: &Value) -> Result<ExchangeOrder> {
    let order_id = value
        .get("orderId")
        .map(|v| v.to_string())
        .ok_or_else(|| anyhow!("order payload missing orderId: {value}"))?;
    Ok(ExchangeOrder {
        order_id,
        client_order_id: str_field(value, "clientOrderId"),
        symbol: str_field(value, "symbol"),
        status: str_field(value, "status"),
        side: str_field(value, "side"),
        order_type: str_field(value, "type"),
        orig_qty: opt_str_field(value, "origQty"),
        executed_qty: opt_str_field(value, "executedQty"),
        avg_price: opt_str_field(value, "avgPrice"),
    })
}

/// Quantities go out with at most 3 decimals, trailing zeros trimmed.
fn fmt_qty(qty: f64) -> String {
    let s = format!("{qty:.3}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn fmt_price(price: f64) -> String {
    let s = format!("{price:.2}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn order_payload_parses() {
        let payload = json!({
            "orderId": 123456,
            "clientOrderId": "entry-abc",
            "symbol": "BTCUSDT",
            "status": "FILLED",
            "side": "BUY",
            "type": "MARKET",
            "origQty": "0.200",
            "executedQty": "0.200",
            "avgPrice": "42001.50"
        });
        let order = parse_order(&payload).unwrap();
        assert_eq!(order.order_id, "123456");
        assert!(order.is_filled());
        assert_eq!(
            order.avg_price_decimal().unwrap().to_string(),
            "42001.50"
        );
    }

    #[test]
    fn closing_side_is_opposite() {
        assert_eq!(BinanceFuturesClient::side_for(Direction::Long, false), "BUY");
        assert_eq!(BinanceFuturesClient::side_for(Direction::Long, true), "SELL");
        assert_eq!(BinanceFuturesClient::side_for(Direction::Short, false), "SELL");
        assert_eq!(BinanceFuturesClient::side_for(Direction::Short, true), "BUY");
    }

    #[test]
    fn quantity_formatting_trims_zeros() {
        assert_eq!(fmt_qty(0.200), "0.2");
        assert_eq!(fmt_qty(1.0), "1");
        assert_eq!(fmt_qty(0.1234), "0.123");
    }
}
