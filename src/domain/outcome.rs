use serde::{Deserialize, Serialize};

use super::PageTarget;

/// Why a monitor gave up on its page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The page never showed a price or an availability signal
    Structural(String),
    /// Too many consecutive timeouts or driver errors
    TransientExhausted(String),
    /// The store's human-assist session failed
    Arbitration(String),
    /// Store login did not complete
    Login(String),
    /// The monitor task panicked
    Panicked(String),
    /// The page driver rejected an operation outright
    Driver(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Structural(s) => write!(f, "structural: {}", s),
            FailureReason::TransientExhausted(s) => write!(f, "transient errors exhausted: {}", s),
            FailureReason::Arbitration(s) => write!(f, "arbitration: {}", s),
            FailureReason::Login(s) => write!(f, "login: {}", s),
            FailureReason::Panicked(s) => write!(f, "panicked: {}", s),
            FailureReason::Driver(s) => write!(f, "driver: {}", s),
        }
    }
}

/// Result of one page monitor run.
///
/// `Purchased` is only ever produced after the order confirmation step
/// succeeded; a monitor that stops because it was told to stop is `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum MonitorOutcome {
    Purchased,
    Failed(FailureReason),
    Cancelled,
}

impl MonitorOutcome {
    pub fn is_purchased(&self) -> bool {
        matches!(self, MonitorOutcome::Purchased)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorOutcome::Purchased => "purchased",
            MonitorOutcome::Failed(_) => "failed",
            MonitorOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for MonitorOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorOutcome::Failed(reason) => write!(f, "failed ({})", reason),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Aggregate result of a product race
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RaceResult {
    Purchased { by: PageTarget },
    AllFailed,
}

impl RaceResult {
    pub fn is_purchased(&self) -> bool {
        matches!(self, RaceResult::Purchased { .. })
    }

    pub fn winner(&self) -> Option<&PageTarget> {
        match self {
            RaceResult::Purchased { by } => Some(by),
            RaceResult::AllFailed => None,
        }
    }
}

impl std::fmt::Display for RaceResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaceResult::Purchased { by } => write!(f, "purchased via {}", by.url),
            RaceResult::AllFailed => write!(f, "all pages failed"),
        }
    }
}
