use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{PageTarget, PricePolicy, ProductTarget, StoreId};
use crate::stores::{SelectorOverrides, StoreRegistry};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Stores to watch, each with its products
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Folder for diagnostic captures and challenge artifacts
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
    /// Upper bound for a single page load or click
    #[serde(default = "default_page_timeout")]
    pub page_timeout_secs: u64,
    /// Random spread added to every polling interval (+/-)
    #[serde(default = "default_jitter")]
    pub jitter_secs: u64,
    /// Consecutive transient errors tolerated before a monitor gives up
    #[serde(default = "default_max_transient_failures")]
    pub max_transient_failures: u32,
    /// How long losing monitors may take to wind down after a purchase
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("captures")
}

fn default_page_timeout() -> u64 {
    30
}

fn default_jitter() -> u64 {
    1
}

fn default_max_transient_failures() -> u32 {
    5
}

fn default_cancel_grace() -> u64 {
    30
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            capture_dir: default_capture_dir(),
            page_timeout_secs: default_page_timeout(),
            jitter_secs: default_jitter(),
            max_transient_failures: default_max_transient_failures(),
            cancel_grace_secs: default_cancel_grace(),
            user_agent: None,
        }
    }
}

impl BotConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_secs(self.jitter_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeConfig {
    /// Give up waiting for the human after this long (unbounded when unset)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Give up after this many wrong answers (unbounded when unset)
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Cookie used as the cross-context claim marker
    #[serde(default = "default_marker_cookie")]
    pub marker_cookie: String,
    /// A foreign marker older than this is treated as abandoned
    #[serde(default = "default_marker_stale")]
    pub marker_stale_secs: u64,
    /// Poll interval while waiting on a foreign marker
    #[serde(default = "default_marker_poll")]
    pub marker_poll_ms: u64,
}

fn default_marker_cookie() -> String {
    "cartwatch_challenge".to_string()
}

fn default_marker_stale() -> u64 {
    600
}

fn default_marker_poll() -> u64 {
    1000
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            max_attempts: None,
            marker_cookie: default_marker_cookie(),
            marker_stale_secs: default_marker_stale(),
            marker_poll_ms: default_marker_poll(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotificationConfig {
    /// Incoming-webhook URL for prompts and purchase notices
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rotated log files here
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Display name, also the default registry kind
    pub name: String,
    /// Registry kind ("amazon", "custom"); defaults to `name`
    #[serde(default)]
    pub kind: Option<String>,
    /// Root URL; all pages of the store share its cookies
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Prefer `CARTWATCH_<STORE>_PASSWORD` over putting this in a file
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub price_policy: PricePolicy,
    #[serde(default)]
    pub selectors: SelectorOverrides,
    #[serde(default)]
    pub products: Vec<ProductConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductConfig {
    pub id: String,
    /// The most you are willing to pay
    pub max_price: Decimal,
    pub pages: Vec<PageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageConfig {
    pub url: String,
    /// Seconds between page refreshes while waiting for the price
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_refresh_interval() -> u64 {
    10
}

/// Login material for one store
#[derive(Clone, Default)]
pub struct StoreCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl StoreConfig {
    pub fn id(&self) -> StoreId {
        StoreId::new(&self.name)
    }

    pub fn kind(&self) -> String {
        self.kind
            .as_deref()
            .unwrap_or(&self.name)
            .trim()
            .to_ascii_lowercase()
    }

    /// Credentials with the password optionally taken from the environment
    pub fn credentials(&self) -> StoreCredentials {
        let env_key = format!(
            "CARTWATCH_{}_PASSWORD",
            self.id().as_str().to_ascii_uppercase().replace(['-', ' ', '.'], "_")
        );
        StoreCredentials {
            username: self.username.clone(),
            password: std::env::var(env_key).ok().or_else(|| self.password.clone()),
        }
    }

    pub fn product_targets(&self) -> Vec<ProductTarget> {
        self.products
            .iter()
            .map(|product| ProductTarget {
                id: product.id.clone(),
                store: self.id(),
                max_price: product.max_price,
                pages: product
                    .pages
                    .iter()
                    .map(|page| {
                        PageTarget::new(
                            page.url.clone(),
                            Duration::from_secs(page.refresh_interval_secs),
                        )
                    })
                    .collect(),
            })
            .collect()
    }
}

impl AppConfig {
    /// Load configuration from a specific file, then `CARTWATCH__*` overrides
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("bot.page_timeout_secs", 30)?
            .add_source(File::from(path.to_path_buf()).required(false))
            // Override with environment variables (CARTWATCH__BOT__JITTER_SECS, etc.)
            .add_source(
                Environment::with_prefix("CARTWATCH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Parse configuration from an inline TOML string (no environment overrides)
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Webhook from config, falling back to `CARTWATCH_WEBHOOK_URL`
    pub fn webhook_url(&self) -> Option<String> {
        self.webhook_url_or(std::env::var("CARTWATCH_WEBHOOK_URL").ok())
    }

    fn webhook_url_or(&self, fallback: Option<String>) -> Option<String> {
        let usable = |u: &String| !u.trim().is_empty();
        self.notifications
            .webhook_url
            .clone()
            .filter(usable)
            .or_else(|| fallback.filter(usable))
    }

    /// Every product of every store
    pub fn product_targets(&self) -> Vec<ProductTarget> {
        self.stores.iter().flat_map(|s| s.product_targets()).collect()
    }

    /// Validate configuration values, collecting every problem found
    pub fn validate(&self, registry: &StoreRegistry) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.stores.is_empty() {
            errors.push("no stores configured".to_string());
        }

        if self.bot.page_timeout_secs == 0 {
            errors.push("bot.page_timeout_secs must be positive".to_string());
        }

        if self.challenge.marker_cookie.trim().is_empty()
            || self.challenge.marker_cookie.contains([';', '=', ' '])
        {
            errors.push(format!(
                "challenge.marker_cookie '{}' is not a valid cookie name",
                self.challenge.marker_cookie
            ));
        }

        if self.challenge.max_attempts == Some(0) {
            errors.push("challenge.max_attempts must be at least 1 when set".to_string());
        }

        let mut store_ids = HashSet::new();
        for store in &self.stores {
            let id = store.id();
            if !store_ids.insert(id.clone()) {
                errors.push(format!("store '{}' is configured twice", id));
            }

            let kind = store.kind();
            if !registry.contains(&kind) {
                errors.push(format!(
                    "store '{}': unknown kind '{}' (registered: {})",
                    store.name,
                    kind,
                    registry.kinds().join(", ")
                ));
            }

            if url::Url::parse(&store.base_url).is_err() {
                errors.push(format!("store '{}': invalid base_url '{}'", store.name, store.base_url));
            }

            if let PricePolicy::Buffered { buffer } = store.price_policy {
                if buffer < Decimal::ZERO {
                    errors.push(format!("store '{}': price buffer must not be negative", store.name));
                }
            }

            if store.products.is_empty() {
                errors.push(format!("store '{}' has no products", store.name));
            }

            let mut product_ids = HashSet::new();
            for product in &store.products {
                if !product_ids.insert(product.id.as_str()) {
                    errors.push(format!(
                        "store '{}': duplicate product id '{}'",
                        store.name, product.id
                    ));
                }
                if product.max_price <= Decimal::ZERO {
                    errors.push(format!("product '{}': max_price must be positive", product.id));
                }
                if product.pages.is_empty() {
                    errors.push(format!("product '{}' has no pages", product.id));
                }
                for page in &product.pages {
                    if url::Url::parse(&page.url).is_err() {
                        errors.push(format!("product '{}': invalid url '{}'", product.id, page.url));
                    }
                    if page.refresh_interval_secs == 0 {
                        errors.push(format!(
                            "product '{}': refresh_interval_secs must be positive ({})",
                            product.id, page.url
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
