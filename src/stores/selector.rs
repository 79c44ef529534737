//! Selector-driven store automation
//!
//! Most retailers can be driven with a handful of CSS selectors: where the price
//! sits, which button adds to cart, where the checkout total is shown. The
//! `amazon` preset ships those selectors; the `custom` kind takes all of them
//! from the configuration file.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::traits::{LoginStatus, PageState, StoreAutomation};
use crate::adapters::{Capture, ChallengeKind, ChallengePrompt, PageDriver};
use crate::config::{StoreConfig, StoreCredentials};
use crate::domain::{parse_price, PricePolicy, StoreId};
use crate::error::{CartwatchError, PageError, Result};

/// Per-store selector overrides from the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorOverrides {
    pub title: Option<String>,
    pub price: Option<String>,
    pub availability: Option<String>,
    pub add_to_cart: Option<String>,
    pub checkout_url: Option<String>,
    pub checkout_button: Option<String>,
    pub final_price: Option<String>,
    pub place_order: Option<String>,
    pub challenge: Option<String>,
    pub challenge_image: Option<String>,
    pub challenge_input: Option<String>,
    pub challenge_submit: Option<String>,
    pub sign_in_url: Option<String>,
    pub sign_in_link: Option<String>,
    pub username_input: Option<String>,
    pub continue_button: Option<String>,
    pub password_input: Option<String>,
    pub sign_in_submit: Option<String>,
    pub login_verification: Option<String>,
}

/// Checkout step: navigate to a URL or click a button
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutEntry {
    Url(String),
    Button(String),
}

/// Fully resolved selectors for one store
#[derive(Debug, Clone)]
pub struct StoreSelectors {
    pub title: Option<String>,
    pub price: String,
    pub availability: String,
    pub add_to_cart: String,
    pub checkout: CheckoutEntry,
    pub final_price: String,
    pub place_order: String,
    pub challenge: String,
    pub challenge_image: Option<String>,
    pub challenge_input: String,
    pub challenge_submit: String,
    pub login: LoginSelectors,
}

#[derive(Debug, Clone, Default)]
pub struct LoginSelectors {
    pub sign_in_url: Option<String>,
    pub sign_in_link: Option<String>,
    pub username_input: Option<String>,
    pub continue_button: Option<String>,
    pub password_input: Option<String>,
    pub sign_in_submit: Option<String>,
    pub verification: Option<String>,
}

impl StoreSelectors {
    pub fn amazon() -> Self {
        Self {
            title: Some("#productTitle".into()),
            price: "#price_inside_buybox".into(),
            availability: "#availability".into(),
            add_to_cart: "#add-to-cart-button".into(),
            checkout: CheckoutEntry::Url(
                "/gp/buy/spc/handlers/display.html?hasWorkingJavascript=1".into(),
            ),
            final_price: ".grand-total-price".into(),
            place_order: "#submitOrderButtonId input".into(),
            challenge: "form[action*='validateCaptcha']".into(),
            challenge_image: Some("form[action*='validateCaptcha'] img".into()),
            challenge_input: "#captchacharacters".into(),
            challenge_submit: "form[action*='validateCaptcha'] button[type='submit']".into(),
            login: LoginSelectors {
                sign_in_url: None,
                sign_in_link: Some("#nav-signin-tooltip a".into()),
                username_input: Some("#ap_email".into()),
                continue_button: Some("#continue".into()),
                password_input: Some("#ap_password".into()),
                sign_in_submit: Some("#signInSubmit".into()),
                verification: Some("div.a-alert-content".into()),
            },
        }
    }

    /// Apply overrides on top of a preset
    pub fn merged(mut self, o: &SelectorOverrides) -> Self {
        fn set(slot: &mut String, value: &Option<String>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
        fn set_opt(slot: &mut Option<String>, value: &Option<String>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }

        set_opt(&mut self.title, &o.title);
        set(&mut self.price, &o.price);
        set(&mut self.availability, &o.availability);
        set(&mut self.add_to_cart, &o.add_to_cart);
        if let Some(url) = &o.checkout_url {
            self.checkout = CheckoutEntry::Url(url.clone());
        } else if let Some(button) = &o.checkout_button {
            self.checkout = CheckoutEntry::Button(button.clone());
        }
        set(&mut self.final_price, &o.final_price);
        set(&mut self.place_order, &o.place_order);
        set(&mut self.challenge, &o.challenge);
        set_opt(&mut self.challenge_image, &o.challenge_image);
        set(&mut self.challenge_input, &o.challenge_input);
        set(&mut self.challenge_submit, &o.challenge_submit);
        set_opt(&mut self.login.sign_in_url, &o.sign_in_url);
        set_opt(&mut self.login.sign_in_link, &o.sign_in_link);
        set_opt(&mut self.login.username_input, &o.username_input);
        set_opt(&mut self.login.continue_button, &o.continue_button);
        set_opt(&mut self.login.password_input, &o.password_input);
        set_opt(&mut self.login.sign_in_submit, &o.sign_in_submit);
        set_opt(&mut self.login.verification, &o.login_verification);
        self
    }

    /// Build selectors purely from overrides; every required selector must be present
    pub fn from_overrides(o: &SelectorOverrides) -> std::result::Result<Self, Vec<&'static str>> {
        let mut missing = Vec::new();
        let mut require = |value: &Option<String>, name: &'static str| -> String {
            value.clone().unwrap_or_else(|| {
                missing.push(name);
                String::new()
            })
        };

        let price = require(&o.price, "price");
        let availability = require(&o.availability, "availability");
        let add_to_cart = require(&o.add_to_cart, "add_to_cart");
        let final_price = require(&o.final_price, "final_price");
        let place_order = require(&o.place_order, "place_order");
        let challenge = require(&o.challenge, "challenge");
        let challenge_input = require(&o.challenge_input, "challenge_input");
        let challenge_submit = require(&o.challenge_submit, "challenge_submit");

        let checkout = match (&o.checkout_url, &o.checkout_button) {
            (Some(url), _) => CheckoutEntry::Url(url.clone()),
            (None, Some(button)) => CheckoutEntry::Button(button.clone()),
            (None, None) => {
                missing.push("checkout_url or checkout_button");
                CheckoutEntry::Url(String::new())
            }
        };

        if !missing.is_empty() {
            return Err(missing);
        }

        Ok(Self {
            title: o.title.clone(),
            price,
            availability,
            add_to_cart,
            checkout,
            final_price,
            place_order,
            challenge,
            challenge_image: o.challenge_image.clone(),
            challenge_input,
            challenge_submit,
            login: LoginSelectors {
                sign_in_url: o.sign_in_url.clone(),
                sign_in_link: o.sign_in_link.clone(),
                username_input: o.username_input.clone(),
                continue_button: o.continue_button.clone(),
                password_input: o.password_input.clone(),
                sign_in_submit: o.sign_in_submit.clone(),
                verification: o.login_verification.clone(),
            },
        })
    }
}

/// `StoreAutomation` driven entirely by CSS selectors
#[derive(Debug, Clone)]
pub struct SelectorStore {
    store: StoreId,
    base_url: String,
    selectors: StoreSelectors,
    policy: PricePolicy,
}

impl SelectorStore {
    pub fn new(store: StoreId, base_url: impl Into<String>, selectors: StoreSelectors, policy: PricePolicy) -> Self {
        Self {
            store,
            base_url: base_url.into(),
            selectors,
            policy,
        }
    }

    /// Registry factory for the `amazon` kind
    pub fn amazon(config: &StoreConfig) -> Result<Arc<dyn StoreAutomation>> {
        let selectors = StoreSelectors::amazon().merged(&config.selectors);
        Ok(Arc::new(Self::new(
            config.id(),
            config.base_url.clone(),
            selectors,
            config.price_policy,
        )))
    }

    /// Registry factory for the `custom` kind
    pub fn custom(config: &StoreConfig) -> Result<Arc<dyn StoreAutomation>> {
        let selectors = StoreSelectors::from_overrides(&config.selectors).map_err(|missing| {
            CartwatchError::InvalidConfig(vec![format!(
                "store '{}': missing selectors: {}",
                config.name,
                missing.join(", ")
            )])
        })?;
        Ok(Arc::new(Self::new(
            config.id(),
            config.base_url.clone(),
            selectors,
            config.price_policy,
        )))
    }

    pub fn selectors(&self) -> &StoreSelectors {
        &self.selectors
    }

    async fn verification_pending(&self, page: &dyn PageDriver) -> std::result::Result<bool, PageError> {
        match &self.selectors.login.verification {
            Some(selector) => Ok(page.query_selector_text(selector).await?.is_some()),
            None => Ok(false),
        }
    }

    fn absolute(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl StoreAutomation for SelectorStore {
    fn store(&self) -> &StoreId {
        &self.store
    }

    fn price_policy(&self) -> PricePolicy {
        self.policy
    }

    async fn login(
        &self,
        page: &dyn PageDriver,
        credentials: &StoreCredentials,
    ) -> std::result::Result<LoginStatus, PageError> {
        let login = &self.selectors.login;
        let (Some(username), Some(password)) = (&credentials.username, &credentials.password) else {
            info!("No credentials for {}, browsing as guest", self.store);
            return Ok(LoginStatus::LoggedIn);
        };

        info!("Logging into {}", self.store);
        match (&login.sign_in_url, &login.sign_in_link) {
            (Some(url), _) => page.navigate(&self.absolute(url)).await?,
            (None, Some(link)) => {
                page.navigate(&self.base_url).await?;
                page.click(link).await?;
                page.wait_for_navigation().await?;
            }
            (None, None) => page.navigate(&self.base_url).await?,
        }

        if let Some(input) = &login.username_input {
            page.type_text(input, username).await?;
            if let Some(button) = &login.continue_button {
                if page.query_selector_text(button).await?.is_some() {
                    page.click(button).await?;
                    page.wait_for_navigation().await?;
                }
            }
        }

        if let Some(input) = &login.password_input {
            page.type_text(input, password).await?;
        }

        if let Some(submit) = &login.sign_in_submit {
            page.click(submit).await?;
            page.wait_for_navigation().await?;
        }

        if page.query_selector_text(&self.selectors.challenge).await?.is_some()
            || self.verification_pending(page).await?
        {
            return Ok(LoginStatus::NeedsVerification);
        }

        info!("Successfully logged into {}", self.store);
        Ok(LoginStatus::LoggedIn)
    }

    async fn inspect(&self, page: &dyn PageDriver) -> std::result::Result<PageState, PageError> {
        if page.query_selector_text(&self.selectors.challenge).await?.is_some() {
            return Ok(PageState::Challenge);
        }

        if let Some(raw) = page.query_selector_text(&self.selectors.price).await? {
            let price = parse_price(&raw);
            if price.is_none() {
                debug!("Unparsable price text '{}' on {}", raw, self.store);
            }
            return Ok(PageState::Priced(price));
        }

        match page.query_selector_text(&self.selectors.availability).await? {
            Some(text) => Ok(PageState::Unavailable(text)),
            None => Ok(PageState::Unreadable),
        }
    }

    async fn product_title(&self, page: &dyn PageDriver) -> Option<String> {
        let selector = self.selectors.title.as_deref()?;
        let title = page.query_selector_text(selector).await.ok().flatten()?;
        Some(title.chars().take(100).collect())
    }

    async fn add_to_cart(&self, page: &dyn PageDriver) -> std::result::Result<(), PageError> {
        page.click(&self.selectors.add_to_cart).await?;
        page.wait_for_navigation().await
    }

    async fn open_checkout(&self, page: &dyn PageDriver) -> std::result::Result<(), PageError> {
        match &self.selectors.checkout {
            CheckoutEntry::Url(path) => {
                let url = self.absolute(path);
                page.navigate(&url).await?;
                // Some stores bounce the first checkout request back to a landing page.
                let landed = page.current_url().unwrap_or_default();
                if !landed.contains(path.split('?').next().unwrap_or(path.as_str())) {
                    warn!("Checkout redirected to {}, retrying once", landed);
                    page.navigate(&url).await?;
                }
                Ok(())
            }
            CheckoutEntry::Button(selector) => {
                page.click(selector).await?;
                page.wait_for_navigation().await
            }
        }
    }

    async fn read_final_price(&self, page: &dyn PageDriver) -> std::result::Result<Option<Decimal>, PageError> {
        Ok(page
            .query_selector_text(&self.selectors.final_price)
            .await?
            .as_deref()
            .and_then(parse_price))
    }

    async fn confirm_order(&self, page: &dyn PageDriver) -> std::result::Result<(), PageError> {
        page.click(&self.selectors.place_order).await?;
        page.wait_for_navigation().await
    }

    async fn capture_challenge(&self, page: &dyn PageDriver) -> std::result::Result<ChallengePrompt, PageError> {
        let kind = if page.query_selector_text(&self.selectors.challenge).await?.is_some() {
            ChallengeKind::Characters
        } else if self.verification_pending(page).await? {
            ChallengeKind::Acknowledge
        } else {
            ChallengeKind::Characters
        };

        let mut image = None;
        if kind == ChallengeKind::Characters {
            if let Some(selector) = &self.selectors.challenge_image {
                if let Some(src) = page.attribute(selector, "src").await? {
                    match page.fetch_bytes(&src).await {
                        Ok(bytes) => {
                            let extension = if src.contains(".png") {
                                "png"
                            } else if src.contains(".gif") {
                                "gif"
                            } else {
                                "jpg"
                            };
                            image = Some(Capture { bytes, extension });
                        }
                        Err(e) => warn!("Could not fetch challenge image {}: {}", src, e),
                    }
                }
            }
        }

        let image = match image {
            Some(image) => image,
            None => page.capture().await?,
        };

        let location = page.current_url().unwrap_or_else(|| self.base_url.clone());
        let text = match kind {
            ChallengeKind::Characters => format!(
                "{} is asking for verification on {}. Reply with the characters shown.",
                self.store, location
            ),
            ChallengeKind::Acknowledge => format!(
                "{} wants the sign-in confirmed on {}. Complete the verification, then press Enter.",
                self.store, location
            ),
        };

        Ok(ChallengePrompt { kind, image, text })
    }

    async fn apply_challenge_reply(
        &self,
        page: &dyn PageDriver,
        kind: ChallengeKind,
        reply: &str,
    ) -> std::result::Result<(), PageError> {
        match kind {
            ChallengeKind::Characters => {
                page.type_text(&self.selectors.challenge_input, reply).await?;
                page.click(&self.selectors.challenge_submit).await?;
                page.wait_for_navigation().await
            }
            // The verification happens out of band; reload to see whether it took.
            ChallengeKind::Acknowledge => {
                let url = page.current_url().unwrap_or_else(|| self.base_url.clone());
                page.navigate(&url).await
            }
        }
    }

    async fn challenge_cleared(
        &self,
        page: &dyn PageDriver,
        kind: ChallengeKind,
    ) -> std::result::Result<bool, PageError> {
        if page.query_selector_text(&self.selectors.challenge).await?.is_some() {
            return Ok(false);
        }
        match kind {
            ChallengeKind::Characters => Ok(true),
            ChallengeKind::Acknowledge => Ok(!self.verification_pending(page).await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_preset_selectors() {
        let overrides = SelectorOverrides {
            price: Some("#corePrice".into()),
            checkout_button: Some("#proceed".into()),
            ..Default::default()
        };
        let selectors = StoreSelectors::amazon().merged(&overrides);
        assert_eq!(selectors.price, "#corePrice");
        assert_eq!(selectors.checkout, CheckoutEntry::Button("#proceed".into()));
        assert_eq!(selectors.availability, "#availability");
    }

    #[test]
    fn custom_selectors_report_missing_fields() {
        let overrides = SelectorOverrides {
            price: Some(".price".into()),
            ..Default::default()
        };
        let missing = StoreSelectors::from_overrides(&overrides).unwrap_err();
        assert!(missing.contains(&"availability"));
        assert!(missing.contains(&"checkout_url or checkout_button"));
        assert!(!missing.contains(&"price"));
    }

    #[test]
    fn relative_paths_resolve_against_base_url() {
        let store = SelectorStore::new(
            StoreId::new("amazon"),
            "https://www.amazon.com/",
            StoreSelectors::amazon(),
            PricePolicy::Strict,
        );
        assert_eq!(store.absolute("/gp/cart"), "https://www.amazon.com/gp/cart");
        assert_eq!(store.absolute("https://x.test/a"), "https://x.test/a");
    }
}
