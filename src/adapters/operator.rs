//! Human-assist channel
//!
//! The arbitrator hands challenge artifacts to a `HumanChannel` and waits for the
//! operator's answer. `ConsoleOperator` saves the artifact next to the other
//! captures, optionally pings a webhook, and reads the answer from a line reader
//! (stdin in the binary).

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::page::Capture;
use super::webhook::WebhookNotifier;
use crate::domain::StoreId;
use crate::error::ArbitrationError;

/// What the human is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Read the characters off the artifact and type them back
    Characters,
    /// Finish a verification step outside cartwatch, then acknowledge
    Acknowledge,
}

/// Artifact and instructions shown to the human for one attempt
#[derive(Debug, Clone)]
pub struct ChallengePrompt {
    pub kind: ChallengeKind,
    pub image: Capture,
    pub text: String,
}

/// Handle of one prompt sent to the human
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub String);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel to the single person who solves interactive challenges
#[async_trait]
pub trait HumanChannel: Send + Sync {
    /// Show the artifact and prompt to the human
    async fn notify(
        &self,
        store: &StoreId,
        prompt: &ChallengePrompt,
    ) -> Result<SessionHandle, ArbitrationError>;

    /// Block until the human answers the given prompt.
    /// For `Acknowledge` prompts the reply text carries no meaning.
    async fn await_reply(&self, handle: &SessionHandle) -> Result<String, ArbitrationError>;

    /// One-way notice (purchases, fatal errors)
    async fn announce(&self, _text: &str) {}
}

struct PendingPrompt {
    store: StoreId,
    kind: ChallengeKind,
    prompt: String,
    artifact: Option<PathBuf>,
}

/// Operator sitting at the console running cartwatch
pub struct ConsoleOperator<R> {
    capture_dir: PathBuf,
    webhook: Option<Arc<WebhookNotifier>>,
    input: Mutex<Lines<R>>,
    pending: SyncMutex<HashMap<SessionHandle, PendingPrompt>>,
}

impl ConsoleOperator<BufReader<Stdin>> {
    pub fn stdin(capture_dir: PathBuf, webhook: Option<Arc<WebhookNotifier>>) -> Self {
        Self::with_reader(capture_dir, webhook, BufReader::new(tokio::io::stdin()))
    }
}

impl<R> ConsoleOperator<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn with_reader(capture_dir: PathBuf, webhook: Option<Arc<WebhookNotifier>>, reader: R) -> Self {
        Self {
            capture_dir,
            webhook,
            input: Mutex::new(reader.lines()),
            pending: SyncMutex::new(HashMap::new()),
        }
    }

    async fn save_artifact(&self, store: &StoreId, image: &Capture) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.capture_dir).await {
            warn!("Cannot create capture directory {:?}: {}", self.capture_dir, e);
            return None;
        }
        let path = self.capture_dir.join(format!(
            "challenge_{}_{}.{}",
            store,
            Utc::now().timestamp_millis(),
            image.extension
        ));
        match tokio::fs::write(&path, &image.bytes).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Failed to save challenge artifact {:?}: {}", path, e);
                None
            }
        }
    }
}

#[async_trait]
impl<R> HumanChannel for ConsoleOperator<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn notify(
        &self,
        store: &StoreId,
        prompt: &ChallengePrompt,
    ) -> Result<SessionHandle, ArbitrationError> {
        let artifact = self.save_artifact(store, &prompt.image).await;

        if let Some(webhook) = &self.webhook {
            if let Err(e) = webhook
                .notify_challenge(store, &prompt.text, &prompt.image.bytes)
                .await
            {
                // The console prompt still reaches the operator.
                warn!("Challenge webhook for {} failed: {}", store, e);
            }
        }

        let handle = SessionHandle(Uuid::new_v4().to_string());
        self.pending.lock().insert(
            handle.clone(),
            PendingPrompt {
                store: store.clone(),
                kind: prompt.kind,
                prompt: prompt.text.clone(),
                artifact,
            },
        );
        info!("Challenge prompt {} queued for store {}", handle, store);
        Ok(handle)
    }

    async fn await_reply(&self, handle: &SessionHandle) -> Result<String, ArbitrationError> {
        let mut input = self.input.lock().await;

        let shown = self.pending.lock().remove(handle);
        let kind = shown
            .as_ref()
            .map_or(ChallengeKind::Characters, |p| p.kind);
        match &shown {
            Some(p) => {
                println!();
                println!("=== [{}] human assistance needed ===", p.store);
                println!("{}", p.prompt);
                if let Some(path) = &p.artifact {
                    println!("Artifact: {}", path.display());
                }
                match p.kind {
                    ChallengeKind::Characters => println!("Type the answer and press Enter:"),
                    ChallengeKind::Acknowledge => {
                        println!("Complete the verification, then press Enter:")
                    }
                }
            }
            None => println!("Answer for prompt {}:", handle),
        }

        loop {
            match input.next_line().await {
                Ok(Some(line)) => {
                    let answer = line.trim();
                    if kind == ChallengeKind::Acknowledge || !answer.is_empty() {
                        return Ok(answer.to_string());
                    }
                }
                Ok(None) => {
                    return Err(ArbitrationError::ChannelUnavailable(
                        "operator input closed".to_string(),
                    ))
                }
                Err(e) => return Err(ArbitrationError::ChannelUnavailable(e.to_string())),
            }
        }
    }

    async fn announce(&self, text: &str) {
        info!("{}", text);
        if let Some(webhook) = &self.webhook {
            if let Err(e) = webhook.send_message(text, None).await {
                warn!("Announcement webhook failed: {}", e);
            }
        }
    }
}
