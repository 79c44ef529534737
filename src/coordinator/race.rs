//! Product race
//!
//! Runs one monitor per page of a product and stops the others as soon as
//! one of them reports a confirmed purchase.

use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::domain::{
    FailureReason, MonitorId, MonitorOutcome, PageTarget, ProductTarget, RaceResult, StoreId,
};
use crate::services::{PageMonitor, StoreRuntime};

/// Final state of one monitor within a race
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorRecord {
    pub target: PageTarget,
    pub outcome: MonitorOutcome,
}

/// Everything a race produced
#[derive(Debug, Clone, Serialize)]
pub struct RaceReport {
    pub product: String,
    pub store: StoreId,
    pub result: RaceResult,
    pub monitors: Vec<MonitorRecord>,
    /// Monitors that confirmed an order after the winner; each is a real extra order
    pub double_purchases: Vec<PageTarget>,
    /// Why the race never started, if it didn't
    pub note: Option<String>,
}

impl RaceReport {
    /// Report for a product whose race could not start
    pub fn not_started(product: &ProductTarget, reason: FailureReason) -> Self {
        let note = reason.to_string();
        Self {
            product: product.id.clone(),
            store: product.store.clone(),
            result: RaceResult::AllFailed,
            monitors: product
                .pages
                .iter()
                .map(|page| MonitorRecord {
                    target: page.clone(),
                    outcome: MonitorOutcome::Failed(reason.clone()),
                })
                .collect(),
            double_purchases: Vec::new(),
            note: Some(note),
        }
    }

    /// Report for a product whose race was stopped before it began
    pub fn cancelled(product: &ProductTarget) -> Self {
        Self {
            product: product.id.clone(),
            store: product.store.clone(),
            result: RaceResult::AllFailed,
            monitors: product
                .pages
                .iter()
                .map(|page| MonitorRecord {
                    target: page.clone(),
                    outcome: MonitorOutcome::Cancelled,
                })
                .collect(),
            double_purchases: Vec::new(),
            note: Some("cancelled before start".to_string()),
        }
    }

    pub fn purchases(&self) -> usize {
        self.monitors
            .iter()
            .filter(|m| m.outcome.is_purchased())
            .count()
    }
}

type Joined = Result<(usize, MonitorOutcome), JoinError>;

/// Races the monitors of one product
pub struct ProductRaceCoordinator {
    runtime: Arc<StoreRuntime>,
    cancel_grace: Duration,
}

impl ProductRaceCoordinator {
    pub fn new(runtime: Arc<StoreRuntime>, cancel_grace: Duration) -> Self {
        Self {
            runtime,
            cancel_grace,
        }
    }

    /// Race every page of `product`; cancelling `parent` stops the race
    pub async fn run(&self, product: Arc<ProductTarget>, parent: &CancellationToken) -> RaceReport {
        let cancel = parent.child_token();
        let mut monitors = JoinSet::new();

        info!(
            "Starting race for {} ({} pages, max {})",
            product.id,
            product.pages.len(),
            product.max_price
        );

        for (index, page) in product.pages.iter().enumerate() {
            let monitor = PageMonitor::new(
                MonitorId::new(&product.id, index),
                product.clone(),
                page.clone(),
                self.runtime.clone(),
            );
            let token = cancel.clone();
            let span = info_span!(
                "monitor",
                store = %product.store,
                product = %product.id,
                url = %page.url
            );
            monitors.spawn(
                async move {
                    let outcome = AssertUnwindSafe(monitor.run(token))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            MonitorOutcome::Failed(FailureReason::Panicked(panic_message(&panic)))
                        });
                    (index, outcome)
                }
                .instrument(span),
            );
        }

        let mut outcomes: Vec<Option<MonitorOutcome>> = vec![None; product.pages.len()];
        let mut winner = None;

        while let Some(joined) = monitors.join_next().await {
            let Some((index, outcome)) = settle(joined) else {
                continue;
            };
            let purchased = outcome.is_purchased();
            outcomes[index] = Some(outcome);
            if purchased {
                winner = Some(index);
                cancel.cancel();
                info!(
                    "{} purchased via {}, stopping {} other monitor(s)",
                    product.id,
                    product.pages[index].url,
                    monitors.len()
                );
                break;
            }
        }

        let mut double_purchases = Vec::new();
        if winner.is_some() && !monitors.is_empty() {
            let drained = tokio::time::timeout(
                self.cancel_grace,
                drain(&mut monitors, &mut outcomes, &mut double_purchases, &product),
            )
            .await;
            if drained.is_err() {
                warn!(
                    "{} monitor(s) of {} still busy after {:?}, aborting",
                    monitors.len(),
                    product.id,
                    self.cancel_grace
                );
                monitors.abort_all();
                drain(&mut monitors, &mut outcomes, &mut double_purchases, &product).await;
            }
        }

        let result = match winner {
            Some(index) => RaceResult::Purchased {
                by: product.pages[index].clone(),
            },
            None => {
                warn!("Every monitor of {} finished without a purchase", product.id);
                RaceResult::AllFailed
            }
        };

        RaceReport {
            product: product.id.clone(),
            store: product.store.clone(),
            result,
            monitors: product
                .pages
                .iter()
                .zip(outcomes)
                .map(|(page, outcome)| MonitorRecord {
                    target: page.clone(),
                    outcome: outcome.unwrap_or(MonitorOutcome::Cancelled),
                })
                .collect(),
            double_purchases,
            note: None,
        }
    }
}

/// Collect the losers after a winner was declared
async fn drain(
    monitors: &mut JoinSet<(usize, MonitorOutcome)>,
    outcomes: &mut [Option<MonitorOutcome>],
    double_purchases: &mut Vec<PageTarget>,
    product: &ProductTarget,
) {
    while let Some(joined) = monitors.join_next().await {
        let Some((index, outcome)) = settle(joined) else {
            continue;
        };
        if outcome.is_purchased() {
            error!(
                "DOUBLE PURCHASE: {} also bought via {} after the race was won",
                product.id, product.pages[index].url
            );
            double_purchases.push(product.pages[index].clone());
        }
        outcomes[index] = Some(outcome);
    }
}

fn settle(joined: Joined) -> Option<(usize, MonitorOutcome)> {
    match joined {
        Ok(pair) => Some(pair),
        Err(e) if e.is_cancelled() => None,
        Err(e) => {
            error!("Monitor task failed outside its own guard: {}", e);
            None
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
