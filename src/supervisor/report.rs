use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::coordinator::RaceReport;

/// Outcome of a full run over every configured product
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub races: Vec<RaceReport>,
}

impl SupervisorReport {
    pub fn purchased(&self) -> impl Iterator<Item = &RaceReport> {
        self.races.iter().filter(|r| r.result.is_purchased())
    }

    pub fn failed(&self) -> impl Iterator<Item = &RaceReport> {
        self.races.iter().filter(|r| !r.result.is_purchased())
    }

    /// Extra orders placed after a race was already won
    pub fn double_purchase_count(&self) -> usize {
        self.races.iter().map(|r| r.double_purchases.len()).sum()
    }

    pub fn all_purchased(&self) -> bool {
        !self.races.is_empty() && self.failed().next().is_none()
    }

    pub fn race(&self, product: &str) -> Option<&RaceReport> {
        self.races.iter().find(|r| r.product == product)
    }
}
