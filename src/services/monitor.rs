//! Page monitor
//!
//! Watches one page of one product until the price drops to the ceiling,
//! then runs the purchase transaction. Every run ends in exactly one
//! `MonitorOutcome`; only a confirmed order yields `Purchased`.

use rand::Rng;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::diagnostics::DiagnosticSink;
use crate::adapters::{Browser, PageDriver};
use crate::config::BotConfig;
use crate::coordination::ChallengeArbitrator;
use crate::domain::{FailureReason, MonitorId, MonitorOutcome, PageTarget, ProductTarget};
use crate::error::{ArbitrationError, PageError};
use crate::stores::{PageState, StoreAutomation};

/// Timing limits applied to every monitor of a run
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Bound on each page operation
    pub page_timeout: Duration,
    /// Random spread added to each polling interval (+/-)
    pub jitter: Duration,
    /// Consecutive transient errors tolerated before giving up
    pub max_transient_failures: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&BotConfig::default())
    }
}

impl From<&BotConfig> for MonitorSettings {
    fn from(config: &BotConfig) -> Self {
        Self {
            page_timeout: config.page_timeout(),
            jitter: config.jitter(),
            max_transient_failures: config.max_transient_failures,
        }
    }
}

/// Everything the monitors of one store share
pub struct StoreRuntime {
    pub automation: Arc<dyn StoreAutomation>,
    pub arbitrator: Arc<ChallengeArbitrator>,
    pub browser: Arc<dyn Browser>,
    pub base_url: String,
    pub diagnostics: DiagnosticSink,
    pub settings: MonitorSettings,
}

/// What one loop iteration decided
#[derive(Debug)]
enum Step {
    /// Sleep for the polling interval, then look again
    Wait,
    /// Look again right away (a challenge was just resolved)
    Refetch,
    Done(MonitorOutcome),
}

pub struct PageMonitor {
    id: MonitorId,
    product: Arc<ProductTarget>,
    target: PageTarget,
    runtime: Arc<StoreRuntime>,
}

impl PageMonitor {
    pub fn new(
        id: MonitorId,
        product: Arc<ProductTarget>,
        target: PageTarget,
        runtime: Arc<StoreRuntime>,
    ) -> Self {
        Self {
            id,
            product,
            target,
            runtime,
        }
    }

    pub fn id(&self) -> &MonitorId {
        &self.id
    }

    pub fn target(&self) -> &PageTarget {
        &self.target
    }

    /// Run until purchase, failure, or cancellation
    pub async fn run(self, cancel: CancellationToken) -> MonitorOutcome {
        info!(
            "[{}] Watching {} for {} (max {}) every {:?}",
            self.id, self.target.url, self.product.id, self.product.max_price, self.target.refresh_interval
        );

        let page = match self
            .bounded(
                "open page",
                self.runtime
                    .browser
                    .new_page(&self.product.store, &self.runtime.base_url),
            )
            .await
        {
            Ok(page) => page,
            Err(e) => {
                error!("[{}] Cannot open page for {}: {}", self.id, self.target.url, e);
                return MonitorOutcome::Failed(FailureReason::Driver(e.to_string()));
            }
        };

        let outcome = self.watch(&page, &cancel).await;
        match &outcome {
            MonitorOutcome::Purchased => info!(
                "[{}] Purchased {} via {}",
                self.id, self.product.id, self.target.url
            ),
            MonitorOutcome::Cancelled => info!("[{}] Cancelled ({})", self.id, self.target.url),
            MonitorOutcome::Failed(reason) => error!(
                "[{}] Gave up on {} for {} in store {}: {}",
                self.id, self.target.url, self.product.id, self.product.store, reason
            ),
        }
        outcome
    }

    async fn watch(&self, page: &Arc<dyn PageDriver>, cancel: &CancellationToken) -> MonitorOutcome {
        let mut transient_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return MonitorOutcome::Cancelled;
            }

            match self.iterate(page, cancel).await {
                Ok(Step::Done(outcome)) => return outcome,
                Ok(Step::Refetch) => {
                    transient_failures = 0;
                    continue;
                }
                Ok(Step::Wait) => transient_failures = 0,
                Err(e) if e.is_transient() => {
                    transient_failures += 1;
                    warn!(
                        "[{}] Transient error on {} ({}/{}): {}",
                        self.id,
                        self.target.url,
                        transient_failures,
                        self.runtime.settings.max_transient_failures,
                        e
                    );
                    if transient_failures > self.runtime.settings.max_transient_failures {
                        return MonitorOutcome::Failed(FailureReason::TransientExhausted(
                            e.to_string(),
                        ));
                    }
                }
                Err(e) => return MonitorOutcome::Failed(FailureReason::Driver(e.to_string())),
            }

            if !self.pause(cancel).await {
                return MonitorOutcome::Cancelled;
            }
        }
    }

    async fn iterate(
        &self,
        shared_page: &Arc<dyn PageDriver>,
        cancel: &CancellationToken,
    ) -> Result<Step, PageError> {
        let automation = self.runtime.automation.as_ref();
        let page = shared_page.as_ref();

        self.bounded("navigate", page.navigate(&self.target.url))
            .await?;
        let state = self.bounded("inspect", automation.inspect(page)).await?;

        match state {
            PageState::Challenge => {
                warn!("[{}] Challenge on {}", self.id, self.target.url);
                match self
                    .runtime
                    .arbitrator
                    .resolve_challenge(
                        &self.id,
                        shared_page.clone(),
                        self.runtime.automation.clone(),
                        cancel,
                    )
                    .await
                {
                    Ok(resolution) => {
                        debug!("[{}] Challenge resolved ({:?})", self.id, resolution.role);
                        Ok(Step::Refetch)
                    }
                    Err(ArbitrationError::Cancelled) => Ok(Step::Done(MonitorOutcome::Cancelled)),
                    Err(e) => Ok(Step::Done(MonitorOutcome::Failed(
                        FailureReason::Arbitration(e.to_string()),
                    ))),
                }
            }
            PageState::Unreadable => {
                self.runtime
                    .diagnostics
                    .capture(page, "no_known_availability")
                    .await;
                Ok(Step::Done(MonitorOutcome::Failed(FailureReason::Structural(
                    format!("no price or availability on {}", self.target.url),
                ))))
            }
            PageState::Unavailable(text) => {
                debug!("[{}] Not available: {}", self.id, text);
                Ok(Step::Wait)
            }
            PageState::Priced(None) => {
                debug!("[{}] Price unreadable, retrying", self.id);
                Ok(Step::Wait)
            }
            PageState::Priced(Some(price)) if price > self.product.max_price => {
                debug!(
                    "[{}] Price {} above max {}",
                    self.id, price, self.product.max_price
                );
                Ok(Step::Wait)
            }
            PageState::Priced(Some(price)) => self.attempt_purchase(page, price, cancel).await,
        }
    }

    /// Add to cart, check out, and confirm if the final total still fits.
    ///
    /// Cancellation is checked before the first side effect and again right
    /// before the confirmation click; the steps in between always complete.
    async fn attempt_purchase(
        &self,
        page: &dyn PageDriver,
        observed: Decimal,
        cancel: &CancellationToken,
    ) -> Result<Step, PageError> {
        if cancel.is_cancelled() {
            return Ok(Step::Done(MonitorOutcome::Cancelled));
        }

        let automation = self.runtime.automation.as_ref();
        if let Some(title) = automation.product_title(page).await {
            info!("[{}] {} is {} ({})", self.id, title, observed, self.target.url);
        }
        info!(
            "[{}] Price {} within max {}, starting checkout",
            self.id, observed, self.product.max_price
        );

        self.bounded("add to cart", automation.add_to_cart(page))
            .await?;
        self.bounded("open checkout", automation.open_checkout(page))
            .await?;
        let final_price = self
            .bounded("read final price", automation.read_final_price(page))
            .await?;

        let policy = automation.price_policy();
        match final_price {
            Some(total) if policy.accepts(total, self.product.max_price) => {
                info!("[{}] Final price {} accepted", self.id, total);
            }
            other => {
                warn!(
                    "[{}] Final price {:?} exceeds limit {}, back to polling",
                    self.id,
                    other,
                    policy.final_limit(self.product.max_price)
                );
                self.runtime
                    .diagnostics
                    .capture(page, "final_price_discrepancy")
                    .await;
                return Ok(Step::Wait);
            }
        }

        if cancel.is_cancelled() {
            info!("[{}] Race already won elsewhere, leaving checkout unconfirmed", self.id);
            return Ok(Step::Done(MonitorOutcome::Cancelled));
        }

        self.bounded("confirm order", automation.confirm_order(page))
            .await?;
        self.runtime
            .diagnostics
            .capture(page, "purchase_successful")
            .await;
        Ok(Step::Done(MonitorOutcome::Purchased))
    }

    /// Sleep for the jittered interval; `false` if cancelled first
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        let delay = jittered(self.target.refresh_interval, self.runtime.settings.jitter);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, PageError>>,
    ) -> Result<T, PageError> {
        let limit = self.runtime.settings.page_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| PageError::Timeout {
                operation: operation.to_string(),
                elapsed_ms: limit.as_millis() as u64,
            })?
    }
}

/// `interval` shifted by a uniform random amount in `[-jitter, +jitter]`,
/// never shorter than one second (or `interval` itself if that is shorter)
pub fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let spread = jitter.as_millis() as i64;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    let floor = interval.min(Duration::from_secs(1)).as_millis() as i64;
    let millis = (interval.as_millis() as i64 + offset).max(floor);
    Duration::from_millis(millis as u64)
}
