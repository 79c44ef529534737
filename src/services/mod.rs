pub mod diagnostics;
pub mod monitor;

pub use diagnostics::DiagnosticSink;
pub use monitor::{jittered, MonitorSettings, PageMonitor, StoreRuntime};
