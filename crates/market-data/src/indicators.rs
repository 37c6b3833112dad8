//! Pure indicator math over close/volume series. Every function returns a
//! series aligned to the input's tail (empty when there is not enough data).

pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return Vec::new();
    }
    data.windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.is_empty() {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(data.len());
    let mut prev = data[0];
    out.push(prev);
    for &value in &data[1..] {
        prev = value * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}

/// Wilder-smoothed RSI. Output has `data.len() - period` values.
pub fn rsi(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period + 1 {
        return Vec::new();
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for w in data[..=period].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;

    let mut out = Vec::with_capacity(data.len() - period);
    out.push(rsi_value(avg_gain, avg_loss));
    for w in data[period..].windows(2) {
        let change = w[1] - w[0];
        let (gain, loss) = if change > 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out.push(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

#[derive(Debug, Clone, Default)]
pub struct MacdResult {
    pub macd_line: Vec<f64>,
    pub signal_line: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(data: &[f64], fast: usize, slow: usize, signal: usize) -> MacdResult {
    if fast == 0 || slow == 0 || signal == 0 || slow <= fast || data.len() < slow {
        return MacdResult::default();
    }
    let fast_ema = ema(data, fast);
    let slow_ema = ema(data, slow);
    let macd_line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal_line = ema(&macd_line, signal);
    let histogram = macd_line
        .iter()
        .zip(signal_line.iter())
        .map(|(m, s)| m - s)
        .collect();
    MacdResult {
        macd_line,
        signal_line,
        histogram,
    }
}

#[derive(Debug, Clone, Default)]
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger_bands(data: &[f64], period: usize, std_dev: f64) -> BollingerBands {
    if period == 0 || data.len() < period {
        return BollingerBands::default();
    }
    let middle = sma(data, period);
    let mut upper = Vec::with_capacity(middle.len());
    let mut lower = Vec::with_capacity(middle.len());
    for (i, m) in middle.iter().enumerate() {
        let window = &data[i..i + period];
        let variance = window.iter().map(|v| (v - m).powi(2)).sum::<f64>() / period as f64;
        let sd = variance.sqrt();
        upper.push(m + std_dev * sd);
        lower.push(m - std_dev * sd);
    }
    BollingerBands {
        upper,
        middle,
        lower,
    }
}

/// Position of the latest close inside the Bollinger channel, 0 at the
/// lower band and 1 at the upper band.
pub fn bollinger_position(data: &[f64], period: usize, std_dev: f64) -> Option<f64> {
    let bands = bollinger_bands(data, period, std_dev);
    let (upper, lower) = (bands.upper.last()?, bands.lower.last()?);
    let close = data.last()?;
    let width = upper - lower;
    if width <= 0.0 {
        return Some(0.5);
    }
    Some((close - lower) / width)
}

/// Latest volume relative to the average of the preceding window.
pub fn volume_surge(volumes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || volumes.len() < period + 1 {
        return None;
    }
    let recent = *volumes.last()?;
    let baseline: f64 =
        volumes[volumes.len() - 1 - period..volumes.len() - 1].iter().sum::<f64>() / period as f64;
    if baseline <= 0.0 {
        return None;
    }
    Some(recent / baseline)
}

/// Net close-to-close move over the window, as a percentage.
pub fn close_trend_pct(closes: &[f64], window: usize) -> Option<f64> {
    if window == 0 || closes.len() <= window {
        return None;
    }
    let start = closes[closes.len() - 1 - window];
    let end = *closes.last()?;
    if start <= 0.0 {
        return None;
    }
    Some((end - start) / start * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_basic() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(out, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn sma_insufficient_data() {
        assert!(sma(&[1.0, 2.0], 3).is_empty());
        assert!(sma(&[1.0, 2.0], 0).is_empty());
    }

    #[test]
    fn rsi_all_gains_saturates() {
        let data: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let out = rsi(&data, 14);
        assert!(!out.is_empty());
        assert!(out.iter().all(|v| (*v - 100.0).abs() < 1e-9));
    }

    #[test]
    fn rsi_alternating_is_midrange() {
        let mut data = Vec::new();
        for i in 0..30 {
            data.push(if i % 2 == 0 { 100.0 } else { 101.0 });
        }
        let out = rsi(&data, 14);
        let last = *out.last().unwrap();
        assert!(last > 30.0 && last < 70.0, "rsi {last} out of midrange");
    }

    #[test]
    fn macd_histogram_positive_in_uptrend() {
        let data: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let result = macd(&data, 12, 26, 9);
        assert!(*result.histogram.last().unwrap() > 0.0);
    }

    #[test]
    fn bollinger_contains_flat_series() {
        let data = vec![50.0; 30];
        let pos = bollinger_position(&data, 20, 2.0).unwrap();
        assert!((pos - 0.5).abs() < 1e-9);
    }

    #[test]
    fn volume_surge_detects_spike() {
        let mut volumes = vec![100.0; 20];
        volumes.push(300.0);
        let surge = volume_surge(&volumes, 20).unwrap();
        assert!((surge - 3.0).abs() < 1e-9);
    }

    #[test]
    fn close_trend_signs() {
        let up: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        assert!(close_trend_pct(&up, 5).unwrap() > 0.0);
        let down: Vec<f64> = (0..10).map(|i| 100.0 - i as f64).collect();
        assert!(close_trend_pct(&down, 5).unwrap() < 0.0);
    }
}
