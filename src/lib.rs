pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod services;
pub mod stores;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{ChallengeArbitrator, GracefulShutdown, ShutdownSignal};
pub use coordinator::{ProductRaceCoordinator, RaceReport};
pub use domain::{MonitorOutcome, ProductTarget, RaceResult};
pub use error::{CartwatchError, Result};
pub use services::PageMonitor;
pub use supervisor::{MonitorSupervisor, SupervisorReport};
