use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How strictly the checkout total is held against the product ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PricePolicy {
    /// Final price must not exceed the ceiling
    Strict,
    /// Final price may exceed the ceiling by at most `buffer` (taxes, shipping)
    Buffered { buffer: Decimal },
}

impl Default for PricePolicy {
    fn default() -> Self {
        Self::Strict
    }
}

impl PricePolicy {
    /// Highest checkout total accepted for the given ceiling
    pub fn final_limit(&self, max_price: Decimal) -> Decimal {
        match self {
            PricePolicy::Strict => max_price,
            PricePolicy::Buffered { buffer } => max_price + *buffer,
        }
    }

    pub fn accepts(&self, final_price: Decimal, max_price: Decimal) -> bool {
        final_price <= self.final_limit(max_price)
    }
}

/// Parse a price as displayed on a product page ("$1,299.99", " 45.00 ").
///
/// Returns `None` for anything that does not contain a single number, including
/// ranges like "$10 - $20".
pub fn parse_price(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | ' ' | '\u{a0}'))
        .collect();

    if cleaned.is_empty() || cleaned.contains('-') {
        return None;
    }

    let numeric: String = cleaned
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .to_string();

    Decimal::from_str(&numeric).ok().filter(|p| *p >= Decimal::ZERO)
}
