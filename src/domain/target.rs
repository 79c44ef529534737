use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Normalized store name ("Amazon " and "amazon" are the same store)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(String);

impl StoreId {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page believed to sell the product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTarget {
    pub url: String,
    /// How often the page is re-read while the price is out of range
    pub refresh_interval: Duration,
}

impl PageTarget {
    pub fn new(url: impl Into<String>, refresh_interval: Duration) -> Self {
        Self {
            url: url.into(),
            refresh_interval,
        }
    }
}

impl std::fmt::Display for PageTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// A product to buy exactly once, watched through several pages.
///
/// Shared behind an `Arc` once a race starts so nothing can mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductTarget {
    pub id: String,
    pub store: StoreId,
    pub max_price: Decimal,
    pub pages: Vec<PageTarget>,
}

impl ProductTarget {
    pub fn new(id: impl Into<String>, store: StoreId, max_price: Decimal) -> Self {
        Self {
            id: id.into(),
            store,
            max_price,
            pages: Vec::new(),
        }
    }

    pub fn with_page(mut self, page: PageTarget) -> Self {
        self.pages.push(page);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Identity of a single running monitor, used in logs and as session owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorId(String);

impl MonitorId {
    pub fn new(product: &str, page_index: usize) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}#{}-{}", product, page_index, &suffix[..8]))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MonitorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn store_id_is_normalized() {
        assert_eq!(StoreId::new(" Amazon "), StoreId::new("amazon"));
        assert_eq!(StoreId::new("BestBuy").as_str(), "bestbuy");
    }

    #[test]
    fn monitor_ids_are_unique_per_page() {
        let a = MonitorId::new("ps5", 0);
        let b = MonitorId::new("ps5", 0);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("ps5#0-"));
    }

    #[test]
    fn product_builder_keeps_page_order() {
        let product = ProductTarget::new("gpu", StoreId::new("amazon"), dec!(499))
            .with_page(PageTarget::new("https://a", Duration::from_secs(10)))
            .with_page(PageTarget::new("https://b", Duration::from_secs(5)));

        let urls: Vec<_> = product.pages.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a", "https://b"]);
    }
}
