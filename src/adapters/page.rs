//! Page automation capability
//!
//! The monitor and the arbitrator only talk to pages through these traits.
//! Drivers report a missing selector as `None` so callers can branch on it.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::StoreId;
use crate::error::PageError;

/// Bytes captured from a page for diagnostics or a human prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub bytes: Vec<u8>,
    /// File extension matching the content ("png", "html")
    pub extension: &'static str,
}

impl Capture {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            extension: "png",
        }
    }

    pub fn html(markup: impl Into<String>) -> Self {
        Self {
            bytes: markup.into().into_bytes(),
            extension: "html",
        }
    }
}

/// One open page (tab) of a store's browsing context
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    fn current_url(&self) -> Option<String>;

    async fn query_selector_text(&self, selector: &str) -> Result<Option<String>, PageError>;

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, PageError>;

    async fn click(&self, selector: &str) -> Result<(), PageError>;

    async fn wait_for_navigation(&self) -> Result<(), PageError>;

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PageError>;

    async fn capture(&self) -> Result<Capture, PageError>;

    /// Fetch a resource (e.g. a challenge image) within the page's context
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, PageError>;

    async fn get_cookie(&self, name: &str) -> Result<Option<String>, PageError>;

    async fn set_cookie(&self, name: &str, value: &str) -> Result<(), PageError>;

    async fn delete_cookie(&self, name: &str) -> Result<(), PageError>;
}

/// Opens pages; pages of the same store share cookies.
///
/// Pages are shared handles: a challenge session may keep working on a page
/// after the monitor that opened it has stopped.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self, store: &StoreId, base_url: &str)
        -> Result<Arc<dyn PageDriver>, PageError>;
}
