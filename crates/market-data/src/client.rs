use std::time::Duration;

use serde_json::Value;

use crate::error::{MarketDataError, MarketDataResult};

#[derive(Debug, Clone)]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone)]
pub struct Ticker24h {
    pub last_price: f64,
    pub price_change_pct: f64,
    pub quote_volume: f64,
    pub high: f64,
    pub low: f64,
}

/// Public futures market data. No authentication; everything here is
/// read-only reference data for context assembly and reconciliation
/// fallback.
#[derive(Clone)]
pub struct MarketDataClient {
    client: reqwest::Client,
    base_url: String,
}

impl MarketDataClient {
    pub fn new(base_url: String, timeout: Duration) -> MarketDataResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub async fn klines(
        &self,
        instrument: &str,
        interval: &str,
        limit: usize,
    ) -> MarketDataResult<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, instrument, interval, limit
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(MarketDataError::ServiceUnavailable(format!(
                "klines {}: {}",
                instrument,
                response.status()
            )));
        }
        let raw: Vec<Vec<Value>> = response.json().await?;
        raw.iter().map(|row| parse_kline(row)).collect()
    }

    pub async fn ticker_24h(&self, instrument: &str) -> MarketDataResult<Ticker24h> {
        let url = format!(
            "{}/fapi/v1/ticker/24hr?symbol={}",
            self.base_url, instrument
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(MarketDataError::ServiceUnavailable(format!(
                "ticker {}: {}",
                instrument,
                response.status()
            )));
        }
        let v: Value = response.json().await?;
        Ok(Ticker24h {
            last_price: field_f64(&v, "lastPrice")?,
            price_change_pct: field_f64(&v, "priceChangePercent")?,
            quote_volume: field_f64(&v, "quoteVolume")?,
            high: field_f64(&v, "highPrice")?,
            low: field_f64(&v, "lowPrice")?,
        })
    }

    /// Latest mark-adjacent trade price. The reconciler's fallback path
    /// and the learning loop's deviation guard both lean on this.
    pub async fn current_price(&self, instrument: &str) -> MarketDataResult<f64> {
        let url = format!(
            "{}/fapi/v1/ticker/price?symbol={}",
            self.base_url, instrument
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(MarketDataError::ServiceUnavailable(format!(
                "price {}: {}",
                instrument,
                response.status()
            )));
        }
        let v: Value = response.json().await?;
        field_f64(&v, "price")
    }

    pub async fn funding_rate(&self, instrument: &str) -> MarketDataResult<f64> {
        let url = format!(
            "{}/fapi/v1/premiumIndex?symbol={}",
            self.base_url, instrument
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(MarketDataError::ServiceUnavailable(format!(
                "funding {}: {}",
                instrument,
                response.status()
            )));
        }
        let v: Value = response.json().await?;
        field_f64(&v, "lastFundingRate")
    }

    /// Accounts long/short ratio, most recent period. Best effort: the
    /// endpoint is flaky on testnet, so callers treat None as "unknown".
    pub async fn long_short_ratio(&self, instrument: &str) -> MarketDataResult<Option<f64>> {
        let url = format!(
            "{}/futures/data/globalLongShortAccountRatio?symbol={}&period=1h&limit=1",
            self.base_url, instrument
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let rows: Vec<Value> = response.json().await.unwrap_or_default();
        Ok(rows.first().and_then(|v| field_f64(v, "longShortRatio").ok()))
    }
}

fn parse_kline(row: &[Value]) -> MarketDataResult<Candle> {
    if row.len() < 6 {
        return Err(MarketDataError::Payload(format!(
            "kline row has {} fields",
            row.len()
        )));
    }
    Ok(Candle {
        open_time_ms: row[0].as_i64().unwrap_or(0),
        open: value_f64(&row[1])?,
        high: value_f64(&row[2])?,
        low: value_f64(&row[3])?,
        close: value_f64(&row[4])?,
        volume: value_f64(&row[5])?,
    })
}

fn value_f64(v: &Value) -> MarketDataResult<f64> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| MarketDataError::Payload(format!("bad number: {n}"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| MarketDataError::Payload(format!("bad numeric string: {s}"))),
        other => Err(MarketDataError::Payload(format!("unexpected value: {other}"))),
    }
}

fn field_f64(v: &Value, field: &str) -> MarketDataResult<f64> {
    v.get(field)
        .ok_or_else(|| MarketDataError::Payload(format!("missing field {field}")))
        .and_then(value_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kline_row_parses_mixed_types() {
        let row = vec![
            json!(1700000000000i64),
            json!("42000.10"),
            json!("42500.00"),
            json!("41800.00"),
            json!("42250.50"),
            json!("1234.5"),
        ];
        let candle = parse_kline(&row).unwrap();
        assert_eq!(candle.open_time_ms, 1700000000000);
        assert!((candle.close - 42250.5).abs() < 1e-9);
        assert!((candle.volume - 1234.5).abs() < 1e-9);
    }

    #[test]
    fn short_kline_row_is_a_payload_error() {
        let row = vec![json!(1), json!("2")];
        assert!(matches!(
            parse_kline(&row),
            Err(MarketDataError::Payload(_))
        ));
    }

    #[test]
    fn field_extraction_handles_strings() {
        let v = json!({"price": "101.5"});
        assert!((field_f64(&v, "price").unwrap() - 101.5).abs() < 1e-9);
        assert!(field_f64(&v, "missing").is_err());
    }
}
