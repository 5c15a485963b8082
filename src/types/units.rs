//! Satoshi Amount Helpers

use crate::common::WishfundError;

/// Satoshis per Bitcoin
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Largest amount a single contract may lock (21M BTC)
pub const MAX_SATS: u64 = 21_000_000 * SATS_PER_BTC;

/// Convert satoshis to BTC string (e.g., "0.00100000")
pub fn sats_to_btc_string(sats: u64) -> String {
    format!("{}.{:08}", sats / SATS_PER_BTC, sats % SATS_PER_BTC)
}

/// e.g. 100000 -> "100,000 sats (0.00100000 BTC)"
pub fn sats_to_display(sats: u64) -> String {
    format!("{} sats ({} BTC)", format_with_commas(sats), sats_to_btc_string(sats))
}

fn format_with_commas(n: u64) -> String {
    let digits = n.to_string();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);

    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result
}

/// Parse a satoshi amount, tolerating `,` and `_` separators
pub fn parse_sats(s: &str) -> Option<u64> {
    s.trim().replace([',', '_'], "").parse().ok()
}

/// Sum amounts, rejecting overflow and anything above the money supply
pub fn checked_total<I>(amounts: I) -> Result<u64, WishfundError>
where
    I: IntoIterator<Item = u64>,
{
    let total = amounts
        .into_iter()
        .try_fold(0u64, |acc, amount| acc.checked_add(amount))
        .ok_or_else(|| WishfundError::validation("amount overflow"))?;

    if total > MAX_SATS {
        return Err(WishfundError::validation(format!(
            "amount {} exceeds money supply",
            total
        )));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sats_to_btc() {
        assert_eq!(sats_to_btc_string(0), "0.00000000");
        assert_eq!(sats_to_btc_string(1), "0.00000001");
        assert_eq!(sats_to_btc_string(123_456_789), "1.23456789");
    }

    #[test]
    fn test_display() {
        assert_eq!(sats_to_display(100_000), "100,000 sats (0.00100000 BTC)");
        assert_eq!(sats_to_display(999), "999 sats (0.00000999 BTC)");
    }

    #[test]
    fn test_parse_sats() {
        assert_eq!(parse_sats("100,000"), Some(100_000));
        assert_eq!(parse_sats(" 50_000 "), Some(50_000));
        assert_eq!(parse_sats("abc"), None);
    }

    #[test]
    fn test_checked_total() {
        assert_eq!(checked_total([60_000, 40_000]).unwrap(), 100_000);
        assert!(checked_total([u64::MAX, 1]).is_err());
        assert!(checked_total([MAX_SATS, 1]).is_err());
    }
}
