//! Per-store challenge arbitration
//!
//! Only one person can answer challenges, so each store gets one
//! `ChallengeArbitrator` shared by all of its monitors. The first monitor that
//! hits a challenge becomes the session owner and talks to the human; every
//! other monitor that hits one meanwhile joins that session and waits for its
//! outcome. The exchange runs on its own task, so a monitor that stops
//! waiting does not take the session down with it.
//!
//! A claim marker cookie mirrors the in-flight session into the store's shared
//! cookie context so that other execution contexts using the same browser
//! state can see it. The marker is advisory: the check-then-set runs under a
//! local gate, and the in-memory session is what joiners actually wait on.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex as SyncMutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::adapters::{HumanChannel, PageDriver};
use crate::config::ChallengeConfig;
use crate::coordinator::race::panic_message;
use crate::domain::{MonitorId, StoreId};
use crate::error::ArbitrationError;
use crate::stores::StoreAutomation;

/// Tunables for one arbitrator
#[derive(Debug, Clone)]
pub struct ArbitratorConfig {
    pub marker_cookie: String,
    /// A foreign marker older than this is considered abandoned
    pub marker_stale: Duration,
    /// Poll interval while another context holds the marker
    pub marker_poll: Duration,
    /// Per-reply wait bound; `None` waits for the human indefinitely
    pub reply_timeout: Option<Duration>,
    /// Cap on wrong answers; `None` keeps asking
    pub max_attempts: Option<u32>,
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self::from(&ChallengeConfig::default())
    }
}

impl From<&ChallengeConfig> for ArbitratorConfig {
    fn from(config: &ChallengeConfig) -> Self {
        Self {
            marker_cookie: config.marker_cookie.clone(),
            marker_stale: Duration::from_secs(config.marker_stale_secs),
            marker_poll: Duration::from_millis(config.marker_poll_ms.max(10)),
            reply_timeout: config.timeout_secs.map(Duration::from_secs),
            max_attempts: config.max_attempts,
        }
    }
}

/// Lifecycle of a human-assist session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Pending,
    Resolved { attempts: u32 },
    Abandoned(ArbitrationError),
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionPhase::Pending)
    }
}

/// The one open human-assist exchange of a store
#[derive(Debug, Clone)]
pub struct ChallengeSession {
    pub id: Uuid,
    pub owner: MonitorId,
    pub started_at: DateTime<Utc>,
}

impl ChallengeSession {
    fn new(owner: MonitorId) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            started_at: Utc::now(),
        }
    }
}

/// Cookie payload announcing an in-progress session: `<session_id>:<unix_secs>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMarker {
    pub session_id: String,
    pub claimed_at: i64,
}

impl ClaimMarker {
    pub fn for_session(session: &ChallengeSession) -> Self {
        Self {
            session_id: session.id.to_string(),
            claimed_at: session.started_at.timestamp(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.session_id, self.claimed_at)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let (session_id, ts) = raw.trim().rsplit_once(':')?;
        if session_id.is_empty() {
            return None;
        }
        Some(Self {
            session_id: session_id.to_string(),
            claimed_at: ts.parse().ok()?,
        })
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now.timestamp() - self.claimed_at >= stale_after.as_secs() as i64
    }
}

/// How a caller's challenge got resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionRole {
    /// This caller ran the exchange with the human
    Owner,
    /// This caller waited on another monitor's session
    Joined,
    /// Another execution context held the marker until it cleared
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResolution {
    pub session_id: Option<Uuid>,
    pub role: ResolutionRole,
    /// Prompts sent to the human (owner only)
    pub attempts: u32,
}

struct InFlight {
    session: ChallengeSession,
    phase_tx: watch::Sender<SessionPhase>,
    /// Page the session driver works on; also used to clear the marker
    page: Arc<dyn PageDriver>,
    driver: Option<AbortHandle>,
}

enum Claim {
    Opened {
        session_id: Uuid,
        phase_rx: watch::Receiver<SessionPhase>,
    },
    Join {
        session_id: Uuid,
        phase_rx: watch::Receiver<SessionPhase>,
    },
    External(ClaimMarker),
}

/// Releases joiners and clears the marker if the session driver goes away
/// without finishing
struct SessionGuard {
    arbitrator: Arc<ChallengeArbitrator>,
    session_id: Uuid,
    armed: bool,
}

impl SessionGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(f) = self.arbitrator.take_session(self.session_id) else {
            return;
        };
        warn!(
            "Challenge session {} for {} dropped before finishing",
            self.session_id, self.arbitrator.store
        );
        if let Ok(handle) = Handle::try_current() {
            let page = f.page.clone();
            let cookie = self.arbitrator.config.marker_cookie.clone();
            handle.spawn(async move {
                if let Err(e) = page.delete_cookie(&cookie).await {
                    warn!("Cannot clear challenge marker: {}", e);
                }
            });
        }
        f.phase_tx.send_replace(SessionPhase::Abandoned(ArbitrationError::OwnerGone(
            self.session_id.to_string(),
        )));
    }
}

/// Serializes human-assist sessions for one store
pub struct ChallengeArbitrator {
    store: StoreId,
    channel: Arc<dyn HumanChannel>,
    config: ArbitratorConfig,
    /// Makes marker check-then-set atomic within this process
    gate: Mutex<()>,
    in_flight: SyncMutex<Option<InFlight>>,
    sessions_started: AtomicU64,
}

impl ChallengeArbitrator {
    pub fn new(store: StoreId, channel: Arc<dyn HumanChannel>, config: ArbitratorConfig) -> Self {
        Self {
            store,
            channel,
            config,
            gate: Mutex::new(()),
            in_flight: SyncMutex::new(None),
            sessions_started: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &StoreId {
        &self.store
    }

    /// Session currently in progress, if any
    pub fn active_session(&self) -> Option<ChallengeSession> {
        self.in_flight.lock().as_ref().map(|f| f.session.clone())
    }

    /// Sessions this arbitrator has opened since creation
    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::SeqCst)
    }

    /// Wait until the challenge on `page` is solved, either by opening a
    /// session with the human or by joining the one already running.
    ///
    /// The exchange itself runs on a task owned by the arbitrator. Cancelling
    /// the caller only stops it from waiting: a session it opened keeps going
    /// for the monitors that joined it, until it finishes or `close` is called.
    pub async fn resolve_challenge(
        self: &Arc<Self>,
        requester: &MonitorId,
        page: Arc<dyn PageDriver>,
        automation: Arc<dyn StoreAutomation>,
        cancel: &CancellationToken,
    ) -> Result<ChallengeResolution, ArbitrationError> {
        let claim = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ArbitrationError::Cancelled),
            _gate = self.gate.lock() => self.claim(requester, page.clone(), automation).await,
        };

        match claim {
            Claim::Opened {
                session_id,
                phase_rx,
            } => {
                self.wait(requester, session_id, phase_rx, ResolutionRole::Owner, cancel)
                    .await
            }
            Claim::Join {
                session_id,
                phase_rx,
            } => {
                info!(
                    "{} joining challenge session {} for {}",
                    requester, session_id, self.store
                );
                self.wait(requester, session_id, phase_rx, ResolutionRole::Joined, cancel)
                    .await
            }
            Claim::External(marker) => {
                self.await_external(requester, page.as_ref(), marker, cancel)
                    .await
            }
        }
    }

    /// Abandon the running session, if any, and clear its marker.
    ///
    /// Called when nothing of this store is left to wait on it.
    pub async fn close(&self) {
        let _gate = self.gate.lock().await;
        let Some(f) = self.in_flight.lock().take() else {
            return;
        };
        if let Some(driver) = &f.driver {
            driver.abort();
        }
        if let Err(e) = f.page.delete_cookie(&self.config.marker_cookie).await {
            warn!("Cannot clear challenge marker for {}: {}", self.store, e);
        }
        info!(
            "Challenge session {} for {} closed before it finished",
            f.session.id, self.store
        );
        f.phase_tx.send_replace(SessionPhase::Abandoned(ArbitrationError::OwnerGone(
            f.session.id.to_string(),
        )));
    }

    /// Must be called with the gate held.
    async fn claim(
        self: &Arc<Self>,
        requester: &MonitorId,
        page: Arc<dyn PageDriver>,
        automation: Arc<dyn StoreAutomation>,
    ) -> Claim {
        let joined = self
            .in_flight
            .lock()
            .as_ref()
            .map(|f| (f.session.id, f.phase_tx.subscribe()));
        if let Some((session_id, phase_rx)) = joined {
            return Claim::Join {
                session_id,
                phase_rx,
            };
        }

        let now = Utc::now();
        match page.get_cookie(&self.config.marker_cookie).await {
            Ok(Some(raw)) => match ClaimMarker::decode(&raw) {
                Some(marker) if !marker.is_stale(now, self.config.marker_stale) => {
                    return Claim::External(marker);
                }
                _ => warn!("Reclaiming stale challenge marker '{}' for {}", raw, self.store),
            },
            Ok(None) => {}
            Err(e) => warn!(
                "Cannot read challenge marker for {}: {} (local gate still applies)",
                self.store, e
            ),
        }

        let session = ChallengeSession::new(requester.clone());
        let marker = ClaimMarker::for_session(&session);
        if let Err(e) = page
            .set_cookie(&self.config.marker_cookie, &marker.encode())
            .await
        {
            warn!("Cannot write challenge marker for {}: {}", self.store, e);
        }

        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Pending);
        *self.in_flight.lock() = Some(InFlight {
            session: session.clone(),
            phase_tx,
            page: page.clone(),
            driver: None,
        });
        self.sessions_started.fetch_add(1, Ordering::SeqCst);

        info!(
            "Challenge session {} opened for {} by {}",
            session.id, self.store, requester
        );

        // The driver's `finish` needs the gate, so the handle is stored first.
        let driver = self.spawn_driver(session.id, page, automation);
        if let Some(f) = self.in_flight.lock().as_mut() {
            if f.session.id == session.id {
                f.driver = Some(driver);
            }
        }

        Claim::Opened {
            session_id: session.id,
            phase_rx,
        }
    }

    fn spawn_driver(
        self: &Arc<Self>,
        session_id: Uuid,
        page: Arc<dyn PageDriver>,
        automation: Arc<dyn StoreAutomation>,
    ) -> AbortHandle {
        let arbitrator = Arc::clone(self);
        let guard = SessionGuard {
            arbitrator: Arc::clone(self),
            session_id,
            armed: true,
        };
        let span = info_span!("challenge", store = %self.store, session = %session_id);

        let task = tokio::spawn(
            async move {
                let outcome = AssertUnwindSafe(arbitrator.drive(page.as_ref(), automation.as_ref()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(ArbitrationError::Panicked(panic_message(&panic)))
                    });
                arbitrator
                    .finish(guard, page.as_ref(), outcome)
                    .await;
            }
            .instrument(span),
        );
        task.abort_handle()
    }

    /// Prompt the human until the page clears; returns the number of prompts sent
    async fn drive(
        &self,
        page: &dyn PageDriver,
        automation: &dyn StoreAutomation,
    ) -> Result<u32, ArbitrationError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.exchange_once(page, automation).await? {
                return Ok(attempts);
            }
            warn!(
                "Challenge for {} still present after attempt {}",
                self.store, attempts
            );
            if let Some(max) = self.config.max_attempts {
                if attempts >= max {
                    return Err(ArbitrationError::AttemptsExhausted { attempts });
                }
            }
        }
    }

    /// One prompt/answer round; `Ok(true)` once the page no longer shows a challenge
    async fn exchange_once(
        &self,
        page: &dyn PageDriver,
        automation: &dyn StoreAutomation,
    ) -> Result<bool, ArbitrationError> {
        let prompt = automation.capture_challenge(page).await?;
        let handle = self.channel.notify(&self.store, &prompt).await?;
        debug!("Waiting for human reply on {} ({})", handle, self.store);

        let reply = match self.config.reply_timeout {
            Some(limit) => tokio::time::timeout(limit, self.channel.await_reply(&handle))
                .await
                .map_err(|_| ArbitrationError::Timeout {
                    secs: limit.as_secs(),
                })??,
            None => self.channel.await_reply(&handle).await?,
        };

        automation
            .apply_challenge_reply(page, prompt.kind, &reply)
            .await?;
        Ok(automation.challenge_cleared(page, prompt.kind).await?)
    }

    async fn finish(
        &self,
        guard: SessionGuard,
        page: &dyn PageDriver,
        outcome: Result<u32, ArbitrationError>,
    ) {
        let _gate = self.gate.lock().await;
        let session_id = guard.session_id;
        guard.disarm();

        // `close` may already have taken the session.
        let Some(f) = self.take_session(session_id) else {
            return;
        };

        if let Err(e) = page.delete_cookie(&self.config.marker_cookie).await {
            warn!("Cannot clear challenge marker for {}: {}", self.store, e);
        }

        let phase = match outcome {
            Ok(attempts) => {
                info!(
                    "Challenge session {} for {} resolved after {} attempt(s)",
                    session_id, self.store, attempts
                );
                SessionPhase::Resolved { attempts }
            }
            Err(e) => {
                error!(
                    "Challenge session {} for {} abandoned: {}",
                    session_id, self.store, e
                );
                SessionPhase::Abandoned(e)
            }
        };
        f.phase_tx.send_replace(phase);
    }

    fn take_session(&self, session_id: Uuid) -> Option<InFlight> {
        let mut slot = self.in_flight.lock();
        match slot.as_ref() {
            Some(f) if f.session.id == session_id => slot.take(),
            _ => None,
        }
    }

    async fn wait(
        &self,
        requester: &MonitorId,
        session_id: Uuid,
        mut phase_rx: watch::Receiver<SessionPhase>,
        role: ResolutionRole,
        cancel: &CancellationToken,
    ) -> Result<ChallengeResolution, ArbitrationError> {
        let phase = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(
                    "{} stopped waiting on challenge session {} for {}",
                    requester, session_id, self.store
                );
                return Err(ArbitrationError::Cancelled);
            }
            phase = phase_rx.wait_for(SessionPhase::is_terminal) => phase
                .map(|phase| (*phase).clone())
                .map_err(|_| ArbitrationError::OwnerGone(session_id.to_string()))?,
        };

        match phase {
            SessionPhase::Resolved { attempts } => Ok(ChallengeResolution {
                session_id: Some(session_id),
                role,
                attempts: if role == ResolutionRole::Owner { attempts } else { 0 },
            }),
            SessionPhase::Abandoned(e) => Err(e),
            SessionPhase::Pending => Err(ArbitrationError::OwnerGone(session_id.to_string())),
        }
    }

    async fn await_external(
        &self,
        requester: &MonitorId,
        page: &dyn PageDriver,
        marker: ClaimMarker,
        cancel: &CancellationToken,
    ) -> Result<ChallengeResolution, ArbitrationError> {
        info!(
            "{} waiting on challenge session {} held by another context for {}",
            requester, marker.session_id, self.store
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ArbitrationError::Cancelled),
                _ = tokio::time::sleep(self.config.marker_poll) => {}
            }
            match page.get_cookie(&self.config.marker_cookie).await? {
                None => break,
                Some(raw) => match ClaimMarker::decode(&raw) {
                    Some(current) if !current.is_stale(Utc::now(), self.config.marker_stale) => {
                        continue
                    }
                    _ => break,
                },
            }
        }

        Ok(ChallengeResolution {
            session_id: None,
            role: ResolutionRole::External,
            attempts: 0,
        })
    }
}
