//! Supervisor layer
//!
//! Fans product races out over every configured store and collects the
//! results into one report.

pub mod report;
#[allow(clippy::module_inception)]
pub mod supervisor;

pub use report::SupervisorReport;
pub use supervisor::{MonitorSupervisor, StorePlan, SupervisorSettings};
