use serde::{Deserialize, Serialize};

use crate::client::{Candle, MarketDataClient};
use crate::error::{MarketDataError, MarketDataResult};
use crate::indicators;

/// Timeframes assembled into every snapshot: (interval, candle limit).
const TIMEFRAMES: &[(&str, usize)] = &[
    ("5m", 50),
    ("15m", 50),
    ("1h", 100),
    ("4h", 60),
    ("1d", 30),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeStats {
    pub interval: String,
    pub rsi_14: Option<f64>,
    pub macd_histogram: Option<f64>,
    /// "bullish" or "bearish" by histogram sign.
    pub macd_state: Option<String>,
    /// 0 at the lower Bollinger band, 1 at the upper.
    pub bollinger_position: Option<f64>,
    /// "uptrend", "downtrend" or "mixed" from EMA 7/25/99 stacking.
    pub ema_trend: Option<String>,
    pub volume_surge: Option<f64>,
    /// Net close move over the last 10 candles, percent.
    pub close_trend_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub instrument: String,
    pub price: f64,
    pub change_24h_pct: f64,
    pub quote_volume_24h: f64,
    pub funding_rate: Option<f64>,
    pub long_short_ratio: Option<f64>,
    pub timeframes: Vec<TimeframeStats>,
}

impl MarketDataClient {
    /// Assemble the full multi-timeframe snapshot for one instrument.
    /// Indicator gaps (not enough candles) surface as None rather than
    /// failing the snapshot; transport failures do fail it.
    pub async fn snapshot(&self, instrument: &str) -> MarketDataResult<InstrumentSnapshot> {
        let ticker = self.ticker_24h(instrument).await?;

        let mut timeframes = Vec::with_capacity(TIMEFRAMES.len());
        for (interval, limit) in TIMEFRAMES {
            let candles = self.klines(instrument, interval, *limit).await?;
            timeframes.push(timeframe_stats(interval, &candles));
        }

        let funding_rate = match self.funding_rate(instrument).await {
            Ok(rate) => Some(rate),
            Err(e) => {
                tracing::debug!("funding rate unavailable for {}: {}", instrument, e);
                None
            }
        };
        let long_short_ratio = self.long_short_ratio(instrument).await.unwrap_or(None);

        if ticker.last_price <= 0.0 {
            return Err(MarketDataError::Payload(format!(
                "non-positive price for {}",
                instrument
            )));
        }

        Ok(InstrumentSnapshot {
            instrument: instrument.to_string(),
            price: ticker.last_price,
            change_24h_pct: ticker.price_change_pct,
            quote_volume_24h: ticker.quote_volume,
            funding_rate,
            long_short_ratio,
            timeframes,
        })
    }
}

pub fn timeframe_stats(interval: &str, candles: &[Candle]) -> TimeframeStats {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let rsi_14 = indicators::rsi(&closes, 14).last().copied();
    let macd_histogram = indicators::macd(&closes, 12, 26, 9).histogram.last().copied();
    let macd_state = macd_histogram.map(|h| {
        if h >= 0.0 {
            "bullish".to_string()
        } else {
            "bearish".to_string()
        }
    });
    let bollinger_position = indicators::bollinger_position(&closes, 20, 2.0);
    let ema_trend = ema_trend(&closes);
    let volume_surge = indicators::volume_surge(&volumes, 20);
    let close_trend_pct = indicators::close_trend_pct(&closes, 10);

    TimeframeStats {
        interval: interval.to_string(),
        rsi_14,
        macd_histogram,
        macd_state,
        bollinger_position,
        ema_trend,
        volume_surge,
        close_trend_pct,
    }
}

fn ema_trend(closes: &[f64]) -> Option<String> {
    if closes.len() < 99 {
        return None;
    }
    let e7 = *indicators::ema(closes, 7).last()?;
    let e25 = *indicators::ema(closes, 25).last()?;
    let e99 = *indicators::ema(closes, 99).last()?;
    Some(if e7 > e25 && e25 > e99 {
        "uptrend".to_string()
    } else if e7 < e25 && e25 < e99 {
        "downtrend".to_string()
    } else {
        "mixed".to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time_ms: i as i64 * 60_000,
                open: close,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn uptrend_series_reads_bullish() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + i as f64 * 0.5).collect();
        let stats = timeframe_stats("1h", &candles_from_closes(&closes));
        assert_eq!(stats.macd_state.as_deref(), Some("bullish"));
        assert_eq!(stats.ema_trend.as_deref(), Some("uptrend"));
        assert!(stats.close_trend_pct.unwrap() > 0.0);
    }

    #[test]
    fn short_series_yields_gaps_not_errors() {
        let closes: Vec<f64> = (0..5).map(|i| 100.0 + i as f64).collect();
        let stats = timeframe_stats("5m", &candles_from_closes(&closes));
        assert!(stats.rsi_14.is_none());
        assert!(stats.ema_trend.is_none());
        assert!(stats.bollinger_position.is_none());
    }
}
