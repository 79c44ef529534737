//! Scripted store, page driver and operator used by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cartwatch::adapters::{
    Browser, Capture, ChallengeKind, ChallengePrompt, HumanChannel, PageDriver, SessionHandle,
};
use cartwatch::coordination::{ArbitratorConfig, ChallengeArbitrator, ChallengeResolution};
use cartwatch::domain::{MonitorId, PageTarget, PricePolicy, ProductTarget, StoreId};
use cartwatch::error::{ArbitrationError, PageError};
use cartwatch::services::{DiagnosticSink, MonitorSettings, StoreRuntime};
use cartwatch::stores::{SelectorOverrides, SelectorStore, StoreAutomation, StoreSelectors};

pub const BASE_URL: &str = "https://shop.test";
pub const ANSWER: &str = "XKCD";
pub const MARKER: &str = "cartwatch_challenge";

/// What a product page shows on one load
#[derive(Debug, Clone)]
pub enum View {
    Priced {
        price: String,
        total: Option<String>,
    },
    Unavailable,
    /// No price and no availability
    Blank,
    /// Raises the store-wide challenge; product and stock views hide it
    Challenge,
    /// Navigation fails
    Fail,
    /// Navigation never completes
    Hang,
    /// Driver panics
    Panic,
}

impl View {
    pub fn price(amount: u32) -> Self {
        View::Priced {
            price: format!("${amount}.00"),
            total: None,
        }
    }

    /// Product page shows `amount`, checkout shows `total`
    pub fn priced(amount: u32, total: u32) -> Self {
        View::Priced {
            price: format!("${amount}.00"),
            total: Some(format!("${total}.00")),
        }
    }
}

struct Script {
    views: VecDeque<View>,
    last: View,
}

/// Shared state of one fake store; every page of the store sees it.
#[derive(Default)]
pub struct Shop {
    scripts: Mutex<HashMap<String, Script>>,
    fetches: Mutex<Vec<(String, Instant)>>,
    adds: Mutex<Vec<String>>,
    orders: Mutex<Vec<String>>,
    cookies: Mutex<HashMap<String, String>>,
    challenge: AtomicBool,
    login_broken: AtomicBool,
    login_challenge: AtomicBool,
    login_alert: AtomicBool,
    verification: AtomicBool,
}

impl Shop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Views served in order for `url`; the last one repeats forever
    pub fn script(&self, url: &str, views: Vec<View>) {
        let mut views: VecDeque<View> = views.into();
        let last = views.back().cloned().unwrap_or(View::Blank);
        if views.is_empty() {
            views.push_back(View::Blank);
        }
        self.scripts
            .lock()
            .insert(url.to_string(), Script { views, last });
    }

    fn next_view(&self, url: &str) -> Option<View> {
        let mut scripts = self.scripts.lock();
        let script = scripts.get_mut(url)?;
        Some(script.views.pop_front().unwrap_or_else(|| script.last.clone()))
    }

    pub fn raise_challenge(&self) {
        self.challenge.store(true, Ordering::SeqCst);
    }

    pub fn challenge_active(&self) -> bool {
        self.challenge.load(Ordering::SeqCst)
    }

    pub fn break_login(&self) {
        self.login_broken.store(true, Ordering::SeqCst);
    }

    pub fn challenge_on_login(&self) {
        self.login_challenge.store(true, Ordering::SeqCst);
    }

    /// Signing in shows a verification alert instead of a captcha
    pub fn alert_on_login(&self) {
        self.login_alert.store(true, Ordering::SeqCst);
    }

    pub fn verification_pending(&self) -> bool {
        self.verification.load(Ordering::SeqCst)
    }

    /// The human confirmed the sign-in out of band
    pub fn clear_verification(&self) {
        self.verification.store(false, Ordering::SeqCst);
    }

    pub fn fetches_of(&self, url: &str) -> Vec<Instant> {
        self.fetches
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn adds(&self) -> Vec<String> {
        self.adds.lock().clone()
    }

    pub fn orders(&self) -> Vec<String> {
        self.orders.lock().clone()
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies.lock().get(name).cloned()
    }

    pub fn put_cookie(&self, name: &str, value: &str) {
        self.cookies.lock().insert(name.to_string(), value.to_string());
    }

    pub fn drop_cookie(&self, name: &str) {
        self.cookies.lock().remove(name);
    }
}

/// One tab on a fake store
pub struct FakePage {
    shop: Arc<Shop>,
    current: Mutex<Option<String>>,
    view: Mutex<Option<View>>,
    typed: Mutex<HashMap<String, String>>,
}

impl FakePage {
    pub fn new(shop: Arc<Shop>) -> Self {
        Self {
            shop,
            current: Mutex::new(None),
            view: Mutex::new(None),
            typed: Mutex::new(HashMap::new()),
        }
    }

    fn current_url_or_blank(&self) -> String {
        self.current.lock().clone().unwrap_or_default()
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        self.shop
            .fetches
            .lock()
            .push((url.to_string(), Instant::now()));
        *self.current.lock() = Some(url.to_string());

        let view = self.shop.next_view(url);
        match view {
            Some(View::Fail) => {
                return Err(PageError::Navigation {
                    url: url.to_string(),
                    reason: "connection reset".into(),
                })
            }
            Some(View::Hang) => std::future::pending::<()>().await,
            Some(View::Panic) => panic!("page driver crashed on {url}"),
            Some(View::Challenge) => self.shop.raise_challenge(),
            _ => {}
        }
        *self.view.lock() = view;
        Ok(())
    }

    fn current_url(&self) -> Option<String> {
        self.current.lock().clone()
    }

    async fn query_selector_text(&self, selector: &str) -> Result<Option<String>, PageError> {
        let view = self.view.lock().clone();
        let text = match (selector, view) {
            ("#captcha", Some(View::Priced { .. } | View::Unavailable)) => None,
            ("#captcha", _) if self.shop.challenge_active() => Some("Type the characters".into()),
            (".alert", _) if self.shop.verification_pending() => {
                Some("Approve the notification sent to your phone".into())
            }
            (".price", Some(View::Priced { price, .. })) => Some(price),
            (".availability", Some(View::Unavailable)) => Some("Currently unavailable.".into()),
            (".availability", Some(View::Priced { .. })) => Some("In Stock.".into()),
            ("#total", Some(View::Priced { price, total })) => Some(total.unwrap_or(price)),
            _ => None,
        };
        Ok(text)
    }

    async fn attribute(&self, _selector: &str, _name: &str) -> Result<Option<String>, PageError> {
        Ok(None)
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let url = self.current_url_or_blank();
        match selector {
            "#add" => self.shop.adds.lock().push(url),
            "#buy" => self.shop.orders.lock().push(url),
            "#captcha-submit" => {
                let answer = self.typed.lock().get("#captcha-input").cloned();
                if answer.as_deref() == Some(ANSWER) {
                    self.shop.challenge.store(false, Ordering::SeqCst);
                }
            }
            "#sign-in" => {
                if self.shop.login_challenge.load(Ordering::SeqCst) {
                    self.shop.raise_challenge();
                }
                if self.shop.login_alert.load(Ordering::SeqCst) {
                    self.shop.verification.store(true, Ordering::SeqCst);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn wait_for_navigation(&self) -> Result<(), PageError> {
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PageError> {
        if selector == "#user" && self.shop.login_broken.load(Ordering::SeqCst) {
            return Err(PageError::ElementNotFound(selector.to_string()));
        }
        self.typed
            .lock()
            .insert(selector.to_string(), text.to_string());
        Ok(())
    }

    async fn capture(&self) -> Result<Capture, PageError> {
        Ok(Capture::png(vec![0x89, b'P', b'N', b'G']))
    }

    async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, PageError> {
        Ok(Vec::new())
    }

    async fn get_cookie(&self, name: &str) -> Result<Option<String>, PageError> {
        Ok(self.shop.cookie(name))
    }

    async fn set_cookie(&self, name: &str, value: &str) -> Result<(), PageError> {
        self.shop.put_cookie(name, value);
        Ok(())
    }

    async fn delete_cookie(&self, name: &str) -> Result<(), PageError> {
        self.shop.drop_cookie(name);
        Ok(())
    }
}

/// Opens `FakePage`s on the shop registered for each store
#[derive(Default)]
pub struct FakeBrowser {
    shops: HashMap<StoreId, Arc<Shop>>,
}

impl FakeBrowser {
    pub fn with_shop(mut self, store: &str, shop: Arc<Shop>) -> Self {
        self.shops.insert(StoreId::new(store), shop);
        self
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_page(
        &self,
        store: &StoreId,
        _base_url: &str,
    ) -> Result<Arc<dyn PageDriver>, PageError> {
        let shop = self
            .shops
            .get(store)
            .cloned()
            .ok_or_else(|| PageError::Driver(format!("no shop for {store}")))?;
        Ok(Arc::new(FakePage::new(shop)))
    }
}

/// How the fake operator answers one prompt
#[derive(Debug, Clone)]
pub enum Reply {
    Answer(String),
    Unreachable,
    Never,
}

/// Operator that answers after a fixed delay
pub struct FakeHuman {
    notifies: AtomicUsize,
    kinds: Mutex<Vec<ChallengeKind>>,
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    delay: Duration,
    announcements: Mutex<Vec<String>>,
}

impl FakeHuman {
    /// Answers correctly after one second
    pub fn correct() -> Arc<Self> {
        Self::answering(Reply::Answer(ANSWER.into()), Duration::from_secs(1))
    }

    pub fn answering(fallback: Reply, delay: Duration) -> Arc<Self> {
        Self::scripted(Vec::new(), fallback, delay)
    }

    /// Uses `replies` in order, then `fallback`
    pub fn scripted(replies: Vec<Reply>, fallback: Reply, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            notifies: AtomicUsize::new(0),
            kinds: Mutex::new(Vec::new()),
            replies: Mutex::new(replies.into()),
            fallback,
            delay,
            announcements: Mutex::new(Vec::new()),
        })
    }

    pub fn notify_count(&self) -> usize {
        self.notifies.load(Ordering::SeqCst)
    }

    pub fn announcements(&self) -> Vec<String> {
        self.announcements.lock().clone()
    }

    /// Kind of every prompt received, in order
    pub fn kinds(&self) -> Vec<ChallengeKind> {
        self.kinds.lock().clone()
    }
}

#[async_trait]
impl HumanChannel for FakeHuman {
    async fn notify(
        &self,
        _store: &StoreId,
        prompt: &ChallengePrompt,
    ) -> Result<SessionHandle, ArbitrationError> {
        self.kinds.lock().push(prompt.kind);
        let n = self.notifies.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionHandle(format!("prompt-{n}")))
    }

    async fn await_reply(&self, _handle: &SessionHandle) -> Result<String, ArbitrationError> {
        tokio::time::sleep(self.delay).await;
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Answer(text) => Ok(text),
            Reply::Unreachable => Err(ArbitrationError::ChannelUnavailable(
                "operator unreachable".into(),
            )),
            Reply::Never => std::future::pending().await,
        }
    }

    async fn announce(&self, text: &str) {
        self.announcements.lock().push(text.to_string());
    }
}

pub fn selectors() -> StoreSelectors {
    let overrides = SelectorOverrides {
        price: Some(".price".into()),
        availability: Some(".availability".into()),
        add_to_cart: Some("#add".into()),
        checkout_button: Some("#checkout".into()),
        final_price: Some("#total".into()),
        place_order: Some("#buy".into()),
        challenge: Some("#captcha".into()),
        challenge_input: Some("#captcha-input".into()),
        challenge_submit: Some("#captcha-submit".into()),
        sign_in_url: Some("/login".into()),
        username_input: Some("#user".into()),
        password_input: Some("#pass".into()),
        sign_in_submit: Some("#sign-in".into()),
        login_verification: Some(".alert".into()),
        ..Default::default()
    };
    match StoreSelectors::from_overrides(&overrides) {
        Ok(selectors) => selectors,
        Err(missing) => panic!("test selectors incomplete: {missing:?}"),
    }
}

pub fn automation(store: &str, policy: PricePolicy) -> Arc<dyn StoreAutomation> {
    Arc::new(SelectorStore::new(
        StoreId::new(store),
        BASE_URL,
        selectors(),
        policy,
    ))
}

pub fn page(shop: &Arc<Shop>) -> Arc<dyn PageDriver> {
    Arc::new(FakePage::new(shop.clone()))
}

/// Resolve a challenge on a fresh page of `shop` on behalf of `name`
pub async fn solve(
    arbitrator: &Arc<ChallengeArbitrator>,
    name: &str,
    shop: &Arc<Shop>,
    cancel: &CancellationToken,
) -> Result<ChallengeResolution, ArbitrationError> {
    arbitrator
        .resolve_challenge(
            &MonitorId::named(name),
            page(shop),
            automation("shop", PricePolicy::Strict),
            cancel,
        )
        .await
}

pub fn arbitrator_config() -> ArbitratorConfig {
    ArbitratorConfig {
        marker_cookie: MARKER.into(),
        marker_stale: Duration::from_secs(600),
        marker_poll: Duration::from_millis(100),
        reply_timeout: None,
        max_attempts: None,
    }
}

pub fn arbitrator(store: &str, human: Arc<FakeHuman>, config: ArbitratorConfig) -> Arc<ChallengeArbitrator> {
    Arc::new(ChallengeArbitrator::new(StoreId::new(store), human, config))
}

pub fn settings() -> MonitorSettings {
    MonitorSettings {
        page_timeout: Duration::from_secs(5),
        jitter: Duration::ZERO,
        max_transient_failures: 3,
    }
}

pub fn runtime(
    shop: &Arc<Shop>,
    human: Arc<FakeHuman>,
    policy: PricePolicy,
    settings: MonitorSettings,
) -> Arc<StoreRuntime> {
    Arc::new(StoreRuntime {
        automation: automation("shop", policy),
        arbitrator: arbitrator("shop", human, arbitrator_config()),
        browser: Arc::new(FakeBrowser::default().with_shop("shop", shop.clone())),
        base_url: BASE_URL.into(),
        diagnostics: DiagnosticSink::disabled(),
        settings,
    })
}

/// Product on the "shop" store with one page per `(url, refresh secs)`
pub fn product(max_price: Decimal, pages: &[(&str, u64)]) -> Arc<ProductTarget> {
    product_named("widget", max_price, pages)
}

pub fn product_named(id: &str, max_price: Decimal, pages: &[(&str, u64)]) -> Arc<ProductTarget> {
    pages
        .iter()
        .fold(
            ProductTarget::new(id, StoreId::new("shop"), max_price),
            |product, (url, secs)| product.with_page(PageTarget::new(*url, Duration::from_secs(*secs))),
        )
        .into_shared()
}
