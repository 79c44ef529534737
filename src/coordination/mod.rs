//! Coordination layer
//!
//! Per-store challenge arbitration and process shutdown handling.

pub mod arbitrator;
pub mod shutdown;

pub use arbitrator::{
    ArbitratorConfig, ChallengeArbitrator, ChallengeResolution, ChallengeSession, ClaimMarker,
    ResolutionRole, SessionPhase,
};
pub use shutdown::{install_signal_handlers, GracefulShutdown, ShutdownPhase, ShutdownSignal};
