//! Monitor supervisor
//!
//! Logs into every store, then runs one race per product. Stores and products
//! are independent: a login failure or a panic only affects the products it
//! belongs to.

use chrono::Utc;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::report::SupervisorReport;
use crate::adapters::{Browser, HumanChannel};
use crate::config::{AppConfig, StoreCredentials};
use crate::coordination::{ArbitratorConfig, ChallengeArbitrator};
use crate::coordinator::race::panic_message;
use crate::coordinator::{ProductRaceCoordinator, RaceReport};
use crate::domain::{FailureReason, MonitorId, ProductTarget, StoreId};
use crate::error::{ArbitrationError, Result};
use crate::services::{DiagnosticSink, MonitorSettings, StoreRuntime};
use crate::stores::{LoginStatus, StoreAutomation, StoreRegistry};

/// One store with its automation and the products to buy there
#[derive(Clone)]
pub struct StorePlan {
    pub store: StoreId,
    pub base_url: String,
    pub credentials: StoreCredentials,
    pub automation: Arc<dyn StoreAutomation>,
    pub products: Vec<ProductTarget>,
}

/// Settings shared by every store of a run
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub monitor: MonitorSettings,
    pub arbitration: ArbitratorConfig,
    pub diagnostics: DiagnosticSink,
    pub cancel_grace: Duration,
}

impl From<&AppConfig> for SupervisorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            monitor: MonitorSettings::from(&config.bot),
            arbitration: ArbitratorConfig::from(&config.challenge),
            diagnostics: DiagnosticSink::new(config.bot.capture_dir.clone()),
            cancel_grace: config.bot.cancel_grace(),
        }
    }
}

struct Shared {
    browser: Arc<dyn Browser>,
    human: Arc<dyn HumanChannel>,
    settings: SupervisorSettings,
}

pub struct MonitorSupervisor {
    plans: Vec<StorePlan>,
    shared: Arc<Shared>,
}

impl MonitorSupervisor {
    pub fn new(
        plans: Vec<StorePlan>,
        browser: Arc<dyn Browser>,
        human: Arc<dyn HumanChannel>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            plans,
            shared: Arc::new(Shared {
                browser,
                human,
                settings,
            }),
        }
    }

    /// Build store plans from configuration; unknown store kinds are an error
    pub fn from_config(
        config: &AppConfig,
        registry: &StoreRegistry,
        browser: Arc<dyn Browser>,
        human: Arc<dyn HumanChannel>,
    ) -> Result<Self> {
        let plans = config
            .stores
            .iter()
            .map(|store| {
                Ok(StorePlan {
                    store: store.id(),
                    base_url: store.base_url.clone(),
                    credentials: store.credentials(),
                    automation: registry.build(store)?,
                    products: store.product_targets(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(plans, browser, human, SupervisorSettings::from(config)))
    }

    pub fn plans(&self) -> &[StorePlan] {
        &self.plans
    }

    /// Run every product to completion; cancelling `cancel` winds all races down
    pub async fn run_all(&self, cancel: &CancellationToken) -> SupervisorReport {
        let started_at = Utc::now();
        let mut stores = JoinSet::new();

        for (index, plan) in self.plans.iter().cloned().enumerate() {
            let shared = self.shared.clone();
            let cancel = cancel.clone();
            let span = info_span!("store", store = %plan.store);
            stores.spawn(
                async move {
                    let reports = AssertUnwindSafe(run_store(&plan, &shared, &cancel))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            let reason = FailureReason::Panicked(panic_message(&panic));
                            error!("Store {} crashed: {}", plan.store, reason);
                            not_started(&plan, reason)
                        });
                    (index, reports)
                }
                .instrument(span),
            );
        }

        let mut per_store: Vec<Option<Vec<RaceReport>>> = vec![None; self.plans.len()];
        while let Some(joined) = stores.join_next().await {
            match joined {
                Ok((index, reports)) => per_store[index] = Some(reports),
                Err(e) => error!("Store task failed: {}", e),
            }
        }

        let races = self
            .plans
            .iter()
            .zip(per_store)
            .flat_map(|(plan, reports)| {
                reports.unwrap_or_else(|| {
                    not_started(plan, FailureReason::Panicked("store task lost".to_string()))
                })
            })
            .collect();

        let report = SupervisorReport {
            started_at,
            finished_at: Utc::now(),
            races,
        };
        info!(
            "Run finished: {} purchased, {} without purchase",
            report.purchased().count(),
            report.failed().count()
        );
        report
    }
}

async fn run_store(plan: &StorePlan, shared: &Shared, cancel: &CancellationToken) -> Vec<RaceReport> {
    let arbitrator = Arc::new(ChallengeArbitrator::new(
        plan.store.clone(),
        shared.human.clone(),
        shared.settings.arbitration.clone(),
    ));

    match login(plan, shared, &arbitrator, cancel).await {
        Ok(()) => {}
        Err(LoginAbort::Failed(reason)) => {
            error!("Skipping {} product(s) of {}: {}", plan.products.len(), plan.store, reason);
            arbitrator.close().await;
            return not_started(plan, reason);
        }
        Err(LoginAbort::Cancelled) => {
            info!("Shutdown during login to {}", plan.store);
            arbitrator.close().await;
            return plan.products.iter().map(RaceReport::cancelled).collect();
        }
    }

    let runtime = Arc::new(StoreRuntime {
        automation: plan.automation.clone(),
        arbitrator,
        browser: shared.browser.clone(),
        base_url: plan.base_url.clone(),
        diagnostics: shared.settings.diagnostics.clone(),
        settings: shared.settings.monitor.clone(),
    });

    let mut races = JoinSet::new();
    for (index, product) in plan.products.iter().cloned().enumerate() {
        let coordinator = ProductRaceCoordinator::new(runtime.clone(), shared.settings.cancel_grace);
        let human = shared.human.clone();
        let cancel = cancel.clone();
        let product = product.into_shared();
        races.spawn(async move {
            let report = AssertUnwindSafe(coordinator.run(product.clone(), &cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let reason = FailureReason::Panicked(panic_message(&panic));
                    error!("Race for {} crashed: {}", product.id, reason);
                    RaceReport::not_started(&product, reason)
                });
            if let Some(winner) = report.result.winner() {
                human
                    .announce(&format!(
                        "Purchased {} at {} via {}",
                        product.id, product.store, winner.url
                    ))
                    .await;
            }
            (index, report)
        });
    }

    let mut reports: Vec<Option<RaceReport>> = vec![None; plan.products.len()];
    while let Some(joined) = races.join_next().await {
        match joined {
            Ok((index, report)) => reports[index] = Some(report),
            Err(e) => error!("Race task for {} failed: {}", plan.store, e),
        }
    }
    // A session opened by a monitor that has since stopped may still be waiting on the human.
    runtime.arbitrator.close().await;

    plan.products
        .iter()
        .zip(reports)
        .map(|(product, report)| {
            report.unwrap_or_else(|| {
                RaceReport::not_started(product, FailureReason::Panicked("race task lost".into()))
            })
        })
        .collect()
}

/// Why a store's products never got raced
enum LoginAbort {
    Failed(FailureReason),
    Cancelled,
}

impl From<FailureReason> for LoginAbort {
    fn from(reason: FailureReason) -> Self {
        LoginAbort::Failed(reason)
    }
}

async fn login(
    plan: &StorePlan,
    shared: &Shared,
    arbitrator: &Arc<ChallengeArbitrator>,
    cancel: &CancellationToken,
) -> std::result::Result<(), LoginAbort> {
    if plan.credentials.username.is_none() {
        info!("No credentials for {}, browsing anonymously", plan.store);
        return Ok(());
    }

    let page = shared
        .browser
        .new_page(&plan.store, &plan.base_url)
        .await
        .map_err(|e| FailureReason::Login(e.to_string()))?;

    match plan
        .automation
        .login(page.as_ref(), &plan.credentials)
        .await
    {
        Ok(LoginStatus::LoggedIn) => {
            info!("Logged into {}", plan.store);
            Ok(())
        }
        Ok(LoginStatus::NeedsVerification) => {
            warn!("{} wants verification during login", plan.store);
            let requester = MonitorId::named(format!("{}-login", plan.store));
            match arbitrator
                .resolve_challenge(&requester, page, plan.automation.clone(), cancel)
                .await
            {
                Ok(_) => {
                    info!("Logged into {} after verification", plan.store);
                    Ok(())
                }
                Err(ArbitrationError::Cancelled) => Err(LoginAbort::Cancelled),
                Err(e) => Err(FailureReason::Login(e.to_string()).into()),
            }
        }
        Err(e) => Err(FailureReason::Login(e.to_string()).into()),
    }
}

fn not_started(plan: &StorePlan, reason: FailureReason) -> Vec<RaceReport> {
    plan.products
        .iter()
        .map(|product| RaceReport::not_started(product, reason.clone()))
        .collect()
}
