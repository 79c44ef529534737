//! Output formatting for `cartwatch` commands.
//!
//! Supports two modes: human-readable tables (default) and JSON (--json).

use serde::Serialize;
use tabled::{Table, Tabled};

use crate::config::AppConfig;
use crate::coordinator::RaceReport;
use crate::supervisor::SupervisorReport;

/// Output mode for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print a vec of Tabled + Serialize items in the chosen mode.
pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                println!("{}", Table::new(items));
            }
        }
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(items)?);
        }
    }
    Ok(())
}

/// One configured product
#[derive(Debug, Tabled, Serialize)]
pub struct ProductRow {
    pub store: String,
    pub product: String,
    #[tabled(rename = "max price")]
    pub max_price: String,
    pub pages: usize,
    #[tabled(rename = "fastest poll")]
    pub fastest_poll: String,
}

pub fn product_rows(config: &AppConfig) -> Vec<ProductRow> {
    config
        .product_targets()
        .into_iter()
        .map(|product| ProductRow {
            store: product.store.to_string(),
            product: product.id.clone(),
            max_price: product.max_price.to_string(),
            pages: product.pages.len(),
            fastest_poll: product
                .pages
                .iter()
                .map(|p| p.refresh_interval)
                .min()
                .map(|d| format!("{}s", d.as_secs()))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect()
}

/// One finished race
#[derive(Debug, Tabled, Serialize)]
pub struct RaceRow {
    pub store: String,
    pub product: String,
    pub result: String,
    pub monitors: String,
    pub note: String,
}

impl From<&RaceReport> for RaceRow {
    fn from(race: &RaceReport) -> Self {
        let mut note = race.note.clone().unwrap_or_default();
        if !race.double_purchases.is_empty() {
            note = format!("{} extra order(s) placed! {}", race.double_purchases.len(), note);
        }
        Self {
            store: race.store.to_string(),
            product: race.product.clone(),
            result: race.result.to_string(),
            monitors: race
                .monitors
                .iter()
                .map(|m| m.outcome.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            note: note.trim().to_string(),
        }
    }
}

/// Print the end-of-run summary
pub fn print_report(report: &SupervisorReport, mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputMode::Table => {
            let rows: Vec<RaceRow> = report.races.iter().map(RaceRow::from).collect();
            print_items(&rows, mode)?;
            println!(
                "{} purchased, {} without purchase, took {}s",
                report.purchased().count(),
                report.failed().count(),
                (report.finished_at - report.started_at).num_seconds()
            );
        }
    }
    Ok(())
}
