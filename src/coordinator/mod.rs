//! Race coordination
//!
//! One coordinator per product. It owns its monitors and their shared
//! cancellation token, and guarantees a single winner is reported.

pub mod race;

pub use race::{MonitorRecord, ProductRaceCoordinator, RaceReport};
