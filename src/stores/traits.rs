use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::adapters::{ChallengeKind, ChallengePrompt, PageDriver};
use crate::config::StoreCredentials;
use crate::domain::{PricePolicy, StoreId};
use crate::error::PageError;

/// What a product page currently shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    /// An interactive verification step blocks the page
    Challenge,
    /// A price element exists; `None` when its text is not a number
    Priced(Option<Decimal>),
    /// No price, but the page reports availability (e.g. "Currently unavailable")
    Unavailable(String),
    /// Neither price nor availability could be found
    Unreadable,
}

/// Result of a login attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStatus {
    LoggedIn,
    /// The store wants extra verification a human must complete
    NeedsVerification,
}

/// Store-specific page knowledge used by the generic monitor loop
#[async_trait]
pub trait StoreAutomation: Send + Sync {
    fn store(&self) -> &StoreId;

    fn price_policy(&self) -> PricePolicy;

    async fn login(
        &self,
        page: &dyn PageDriver,
        credentials: &StoreCredentials,
    ) -> Result<LoginStatus, PageError>;

    /// Classify the page that was just loaded
    async fn inspect(&self, page: &dyn PageDriver) -> Result<PageState, PageError>;

    /// Product title for log lines, if the page shows one
    async fn product_title(&self, _page: &dyn PageDriver) -> Option<String> {
        None
    }

    async fn add_to_cart(&self, page: &dyn PageDriver) -> Result<(), PageError>;

    async fn open_checkout(&self, page: &dyn PageDriver) -> Result<(), PageError>;

    /// Total shown on the checkout page, `None` if missing or unparsable
    async fn read_final_price(&self, page: &dyn PageDriver) -> Result<Option<Decimal>, PageError>;

    /// Irreversible order placement
    async fn confirm_order(&self, page: &dyn PageDriver) -> Result<(), PageError>;

    async fn capture_challenge(&self, page: &dyn PageDriver) -> Result<ChallengePrompt, PageError>;

    async fn apply_challenge_reply(
        &self,
        page: &dyn PageDriver,
        kind: ChallengeKind,
        reply: &str,
    ) -> Result<(), PageError>;

    async fn challenge_cleared(
        &self,
        page: &dyn PageDriver,
        kind: ChallengeKind,
    ) -> Result<bool, PageError>;
}
