//! Ticker canonicalization. Deterministic, no I/O.

use crate::error::ServiceError;

/// Dot-suffixes that denote an exchange listing and are kept verbatim.
/// Single letters here (Tokyo, LSE, TSX-V, Frankfurt) take precedence over
/// the US class-share interpretation, which only applies to suffixes outside
/// this set.
const EXCHANGE_SUFFIXES: &[&str] = &[
    "T", "L", "V", "F", "TO", "HK", "SS", "SZ", "AX", "NZ", "SI", "KS", "KQ", "TW", "DE", "PA",
    "AS", "BR", "MI", "MC", "ST", "OL", "CO", "HE", "SW", "VI", "LS", "IR", "SA", "MX", "NS", "BO",
];

/// Canonicalize a raw ticker: uppercase, exchange suffixes kept, US
/// class-share dots mapped to hyphens (`BRK.B → BRK-B`), index prefixes
/// (`^VIX`) preserved. Empty or malformed input is a validation error.
pub fn normalize(raw: &str) -> Result<String, ServiceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::Validation("symbol must not be empty".into()));
    }

    let upper = trimmed.to_uppercase();
    if !upper
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^'))
    {
        return Err(ServiceError::Validation(format!(
            "symbol contains invalid characters: {raw:?}"
        )));
    }

    if let Some((body, suffix)) = upper.rsplit_once('.') {
        if body.is_empty() || suffix.is_empty() {
            return Err(ServiceError::Validation(format!(
                "malformed symbol: {raw:?}"
            )));
        }
        if EXCHANGE_SUFFIXES.contains(&suffix) {
            return Ok(upper);
        }
        if suffix.len() == 1 && suffix.chars().all(|c| c.is_ascii_alphabetic()) {
            return Ok(format!("{body}-{suffix}"));
        }
    }

    Ok(upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uppercases_plain_tickers() {
        assert_eq!(normalize("aapl").unwrap(), "AAPL");
        assert_eq!(normalize("  msft  ").unwrap(), "MSFT");
    }

    #[test]
    fn class_share_dot_becomes_hyphen() {
        assert_eq!(normalize("BRK.B").unwrap(), "BRK-B");
        assert_eq!(normalize("brk.a").unwrap(), "BRK-A");
        assert_eq!(normalize("RDS.A").unwrap(), "RDS-A");
    }

    #[test]
    fn exchange_suffixes_are_kept() {
        assert_eq!(normalize("7203.t").unwrap(), "7203.T");
        assert_eq!(normalize("0700.HK").unwrap(), "0700.HK");
        assert_eq!(normalize("barc.l").unwrap(), "BARC.L");
        assert_eq!(normalize("shop.to").unwrap(), "SHOP.TO");
    }

    #[test]
    fn index_prefix_preserved() {
        assert_eq!(normalize("^vix").unwrap(), "^VIX");
        assert_eq!(normalize("^GSPC").unwrap(), "^GSPC");
    }

    #[test]
    fn already_hyphenated_passes_through() {
        assert_eq!(normalize("BRK-B").unwrap(), "BRK-B");
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(normalize("").is_err());
        assert!(normalize("   ").is_err());
        assert!(normalize("AA PL").is_err());
        assert!(normalize("AAPL$").is_err());
        assert!(normalize(".B").is_err());
        assert!(normalize("BRK.").is_err());
    }
}
