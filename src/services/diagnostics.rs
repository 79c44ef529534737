//! Diagnostic captures
//!
//! Captures are observational: a failed capture is logged and never changes
//! what the monitor does next.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::adapters::{Capture, PageDriver};

/// Writes page captures to the capture folder
#[derive(Debug, Clone)]
pub struct DiagnosticSink {
    dir: Option<PathBuf>,
}

impl DiagnosticSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// Sink that only logs
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Capture the current page under `label`; returns the written file
    pub async fn capture(&self, page: &dyn PageDriver, label: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        match page.capture().await {
            Ok(capture) => self.write(dir, label, &capture).await,
            Err(e) => {
                warn!("Capture '{}' failed: {}", label, e);
                None
            }
        }
    }

    async fn write(&self, dir: &Path, label: &str, capture: &Capture) -> Option<PathBuf> {
        let path = dir.join(file_name(label, capture.extension));
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("Cannot create capture folder {:?}: {}", dir, e);
            return None;
        }
        match tokio::fs::write(&path, &capture.bytes).await {
            Ok(()) => {
                debug!("Saved capture {:?}", path);
                Some(path)
            }
            Err(e) => {
                warn!("Failed to save capture {:?}: {}", path, e);
                None
            }
        }
    }
}

fn file_name(label: &str, extension: &str) -> String {
    let label: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!(
        "{}_{}.{}",
        label,
        Utc::now().format("%Y%m%d_%H%M%S%.3f"),
        extension
    )
}
