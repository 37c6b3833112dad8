//! Instrument mention detection over raw signal text.

/// Long-form names that show up in chat instead of the ticker base.
const NAME_ALIASES: &[(&str, &str)] = &[
    ("bitcoin", "BTC"),
    ("ethereum", "ETH"),
    ("ether", "ETH"),
    ("solana", "SOL"),
    ("dogecoin", "DOGE"),
    ("ripple", "XRP"),
    ("cardano", "ADA"),
    ("avalanche", "AVAX"),
    ("chainlink", "LINK"),
    ("litecoin", "LTC"),
];

/// Scan message text for whitelisted instruments. Matching is
/// case-insensitive on word boundaries, against the full symbol, its base
/// asset ("BTC" for "BTCUSDT"), and known long-form names. Returns
/// whitelist order, deduplicated.
pub fn detect_instruments(text: &str, whitelist: &[String]) -> Vec<String> {
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let mut found = Vec::new();
    for instrument in whitelist {
        let base = instrument
            .strip_suffix("USDT")
            .unwrap_or(instrument)
            .to_lowercase();
        let full = instrument.to_lowercase();

        let mut mentioned = tokens.iter().any(|t| *t == base || *t == full);
        if !mentioned {
            mentioned = NAME_ALIASES.iter().any(|(name, alias_base)| {
                alias_base.to_lowercase() == base && tokens.contains(name)
            });
        }
        if mentioned && !found.contains(instrument) {
            found.push(instrument.clone());
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist() -> Vec<String> {
        vec![
            "BTCUSDT".to_string(),
            "ETHUSDT".to_string(),
            "SOLUSDT".to_string(),
        ]
    }

    #[test]
    fn detects_base_ticker_case_insensitive() {
        let found = detect_instruments("Looking at btc here, clean setup", &whitelist());
        assert_eq!(found, vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn detects_long_form_names() {
        let found = detect_instruments("Ethereum looks ready to run", &whitelist());
        assert_eq!(found, vec!["ETHUSDT".to_string()]);
    }

    #[test]
    fn ignores_substrings_inside_words() {
        // "bitcoiner's" tokenizes to words, none of which equal "btc"
        let found = detect_instruments("subscribe to my newsletter", &whitelist());
        assert!(found.is_empty());
    }

    #[test]
    fn multiple_mentions_dedup_in_whitelist_order() {
        let found = detect_instruments("SOL/BTC pair — sol strong vs btc", &whitelist());
        assert_eq!(found, vec!["BTCUSDT".to_string(), "SOLUSDT".to_string()]);
    }

    #[test]
    fn non_whitelisted_instruments_ignored() {
        let found = detect_instruments("PEPE to the moon", &whitelist());
        assert!(found.is_empty());
    }
}
