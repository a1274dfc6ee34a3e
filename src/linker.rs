//! Session capture workflow.
//!
//! One spawned task per attempt owns the socket and its event stream. The
//! task feeds events into the pure [`Attempt`] state machine and runs the
//! actions it returns: request a pairing code or render a QR, persist the
//! credential store on open, reconnect on transient closes, and finally clean
//! up, audit, and release the registry slot.

mod attempt;
pub mod capture;
pub mod cleanup;
mod registry;
pub mod sweeper;

pub use attempt::Outcome;

use attempt::{Action, Attempt, Deadline, RetryPolicy};
use chrono::Utc;
use pairgate_channels::qr::qr_data_url;
use pairgate_core::{
    config::{shellexpand, LinkConfig, MemoryConfig},
    link::{format_pairing_code, user_jid, LinkMode, LinkRequest},
    traits::{LinkSocket, SocketEvent, SocketFactory},
};
use pairgate_memory::{
    audit::{AuditEntry, AuditOutcome},
    AuditLogger, Store,
};
use registry::AttemptRegistry;
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a cancelled attempt may keep working before it is cut short.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// The login artifact handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Formatted as `XXXX-XXXX`.
    PairingCode(String),
    Qr { payload: String, data_url: String },
}

/// Why an attempt could not produce an artifact.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{0}")]
    Validation(String),
    #[error("messaging library unavailable")]
    Unavailable,
    #[error("pairing code request failed")]
    PairingCode,
    #[error("QR rendering failed: {0}")]
    QrRender(String),
    #[error("{mode} attempt timed out")]
    Timeout { mode: LinkMode },
    #[error("superseded by a newer attempt")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl LinkError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Timeout { .. } => 408,
            Self::Unavailable | Self::PairingCode | Self::Cancelled => 503,
            Self::QrRender(_) | Self::Internal(_) => 500,
        }
    }

    /// Client-facing message.
    pub fn message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Unavailable => "Service Unavailable".to_string(),
            Self::PairingCode => {
                "Failed to get pairing code. Please check your phone number and try again."
                    .to_string()
            }
            Self::QrRender(_) => "Failed to generate QR code".to_string(),
            Self::Timeout { mode: LinkMode::Qr } => "QR generation timeout".to_string(),
            Self::Timeout { mode: LinkMode::Pair } => "Pairing code timeout".to_string(),
            Self::Cancelled => "Request superseded by a newer one".to_string(),
            Self::Internal(_) => "Service error".to_string(),
        }
    }
}

/// A started attempt.
pub struct PendingLink {
    pub attempt_id: Uuid,
    /// Resolves exactly once with the artifact or the reason there is none.
    pub artifact: oneshot::Receiver<Result<Artifact, LinkError>>,
    /// Resolves when the attempt has ended and cleaned up.
    pub done: oneshot::Receiver<Outcome>,
}

struct Inner {
    factory: Arc<dyn SocketFactory>,
    store: Store,
    audit: AuditLogger,
    link: LinkConfig,
    memory: MemoryConfig,
    sessions_dir: PathBuf,
    registry: AttemptRegistry,
}

/// Runs linking attempts.
#[derive(Clone)]
pub struct Linker {
    inner: Arc<Inner>,
}

impl Linker {
    pub fn new(
        factory: Arc<dyn SocketFactory>,
        store: Store,
        link: LinkConfig,
        memory: MemoryConfig,
    ) -> Self {
        let sessions_dir = PathBuf::from(shellexpand(&link.sessions_dir));
        let audit = AuditLogger::new(store.pool().clone());
        Self {
            inner: Arc::new(Inner {
                factory,
                store,
                audit,
                link,
                memory,
                sessions_dir,
                registry: AttemptRegistry::new(),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn factory_name(&self) -> &str {
        self.inner.factory.name()
    }

    pub async fn active_attempts(&self) -> usize {
        self.inner.registry.active_count().await
    }

    /// Remove credential stores left behind by a previous run.
    pub async fn clear_leftovers(&self) -> usize {
        cleanup::clear_leftovers(&self.inner.sessions_dir).await
    }

    /// Cancel every in-flight attempt and wait for them to clean up.
    pub async fn shutdown(&self) {
        self.inner.registry.cancel_all().await;
    }

    /// Start an attempt and return its channels without waiting.
    ///
    /// Any attempt already running for the same store is cancelled and
    /// awaited first, and the store directory is recreated empty.
    pub async fn begin(&self, request: LinkRequest) -> Result<PendingLink, LinkError> {
        let store_name = request.store_name();
        let dir = self.inner.sessions_dir.join(&store_name);
        let id = Uuid::new_v4();
        let (artifact_tx, artifact_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let _guard = self.inner.registry.start_guard(&store_name).await;
        if self.inner.registry.cancel(&store_name).await {
            info!("superseded previous attempt for {store_name}");
        }
        cleanup::remove_store(&dir).await;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| LinkError::Internal(format!("create {}: {e}", dir.display())))?;

        info!("starting {} attempt {id} for {store_name}", request.mode);
        let run = AttemptRun {
            inner: self.inner.clone(),
            id,
            artifact_deadline: Instant::now() + self.inner.link.artifact_timeout(),
            request,
            store_name: store_name.clone(),
            dir,
            responder: Some(artifact_tx),
            persisted_as: None,
        };
        self.inner
            .registry
            .spawn(store_name, id, move |cancel| run.drive(cancel, done_tx))
            .await;

        Ok(PendingLink {
            attempt_id: id,
            artifact: artifact_rx,
            done: done_rx,
        })
    }

    /// Start an attempt and wait for its artifact.
    pub async fn start(&self, request: LinkRequest) -> Result<Artifact, LinkError> {
        let pending = self.begin(request).await?;
        pending.artifact.await.unwrap_or_else(|_| {
            Err(LinkError::Internal(
                "attempt ended without a response".into(),
            ))
        })
    }
}

/// What the driver does after running a batch of actions.
enum Flow {
    Continue,
    Reconnect(Duration),
    Finish(Outcome),
}

struct AttemptRun {
    inner: Arc<Inner>,
    id: Uuid,
    artifact_deadline: Instant,
    request: LinkRequest,
    store_name: String,
    dir: PathBuf,
    /// Taken on first use, so at most one response goes out.
    responder: Option<oneshot::Sender<Result<Artifact, LinkError>>>,
    /// `(key, session_id)` once credentials are stored.
    persisted_as: Option<(String, String)>,
}

impl AttemptRun {
    async fn drive(mut self, mut cancel: watch::Receiver<bool>, done: oneshot::Sender<Outcome>) {
        let started = Instant::now();
        let mut attempt = Attempt::new(
            self.request.mode,
            RetryPolicy::fixed(self.inner.link.max_retries, self.inner.link.retry_backoff()),
        );

        let grace = grace_expired(cancel.clone());
        let finished = tokio::select! {
            outcome = self.run(&mut attempt, &mut cancel, started) => Some(outcome),
            _ = grace => None,
        };
        let outcome = match finished {
            Some(outcome) => outcome,
            None => {
                warn!(
                    "attempt {} still busy {CANCEL_GRACE:?} after cancellation, dropping it",
                    self.id
                );
                final_outcome(attempt.on_cancel())
            }
        };

        self.finish(outcome, attempt.retries(), started, done).await;
    }

    /// Connect, reconnect, and feed the state machine until it finishes.
    async fn run(
        &mut self,
        attempt: &mut Attempt,
        cancel: &mut watch::Receiver<bool>,
        started: Instant,
    ) -> Outcome {
        let inner = self.inner.clone();
        let artifact_deadline = self.artifact_deadline;
        let link_deadline = started + inner.link.link_timeout();
        let mut linger: Option<Instant> = None;
        let mut connected_once = false;

        loop {
            let mut session = match inner.factory.open(&self.dir).await {
                Ok(session) => session,
                Err(e) if !connected_once => {
                    error!("{}: failed to open socket: {e}", inner.factory.name());
                    self.respond(Err(LinkError::Unavailable));
                    return Outcome::Failed(format!("socket unavailable: {e}"));
                }
                Err(e) => {
                    warn!("{}: reconnect failed: {e}", inner.factory.name());
                    let actions = attempt.on_connect_failed(&e.to_string());
                    match self.execute(attempt, None, actions, &mut linger, cancel).await {
                        Flow::Finish(outcome) => return outcome,
                        Flow::Reconnect(delay) => {
                            if !backoff(delay, cancel).await {
                                return final_outcome(attempt.on_cancel());
                            }
                            continue;
                        }
                        Flow::Continue => continue,
                    }
                }
            };
            connected_once = true;

            let mut actions = attempt.on_connected();
            let flow = loop {
                let flow = self
                    .execute(attempt, Some(session.socket.as_ref()), actions, &mut linger, cancel)
                    .await;
                if !matches!(flow, Flow::Continue) {
                    break flow;
                }

                actions = tokio::select! {
                    biased;
                    _ = cancelled(cancel) => attempt.on_cancel(),
                    _ = sleep_until(artifact_deadline), if attempt.is_armed(Deadline::Artifact) => {
                        warn!("{} attempt {} produced no artifact in time", self.request.mode, self.id);
                        attempt.on_deadline(Deadline::Artifact)
                    }
                    _ = sleep_until(link_deadline), if attempt.is_armed(Deadline::Link) => {
                        warn!("{} attempt {} was never linked", self.request.mode, self.id);
                        attempt.on_deadline(Deadline::Link)
                    }
                    _ = sleep_until(linger.unwrap_or(link_deadline)),
                        if linger.is_some() && attempt.is_armed(Deadline::Linger) => {
                        attempt.on_deadline(Deadline::Linger)
                    }
                    event = session.events.recv() => {
                        let event = event.unwrap_or(SocketEvent::Close { status: None });
                        debug!("attempt {}: {event:?}", self.id);
                        attempt.on_event(&event)
                    }
                };
            };

            session.socket.end().await;
            match flow {
                Flow::Finish(outcome) => return outcome,
                Flow::Reconnect(delay) => {
                    info!(
                        "reconnecting {} in {delay:?} (retry {}/{})",
                        self.store_name,
                        attempt.retries(),
                        inner.link.max_retries
                    );
                    if !backoff(delay, cancel).await {
                        return final_outcome(attempt.on_cancel());
                    }
                }
                Flow::Continue => {}
            }
        }
    }

    /// Run actions in order. Follow-up actions are queued behind them.
    async fn execute(
        &mut self,
        attempt: &mut Attempt,
        socket: Option<&dyn LinkSocket>,
        actions: Vec<Action>,
        linger: &mut Option<Instant>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Flow {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::RequestPairingCode => {
                    if let Some(socket) = socket {
                        queue.extend(self.request_pairing_code(attempt, socket, cancel).await);
                    }
                }
                Action::RenderQr(payload) => queue.extend(self.render_qr(attempt, payload)),
                Action::Persist { me } => {
                    let outcome = self.persist(me.as_deref(), socket, cancel).await;
                    if matches!(outcome, Outcome::Persisted { .. }) {
                        *linger = Some(Instant::now() + self.inner.link.persist_linger());
                    }
                    queue.extend(attempt.on_persist_result(outcome));
                }
                Action::RefreshCredentials => self.refresh().await,
                Action::RespondTimeout => self.respond(Err(LinkError::Timeout {
                    mode: self.request.mode,
                })),
                Action::Reconnect { delay } => return Flow::Reconnect(delay),
                Action::Finish(outcome) => return Flow::Finish(outcome),
            }
        }
        Flow::Continue
    }

    async fn request_pairing_code(
        &mut self,
        attempt: &mut Attempt,
        socket: &dyn LinkSocket,
        cancel: &mut watch::Receiver<bool>,
    ) -> Vec<Action> {
        let Some(number) = self.request.key.clone() else {
            self.respond(Err(LinkError::Internal("pair attempt without a number".into())));
            return attempt.on_artifact_failed("pair attempt without a number");
        };

        let settle = self.inner.link.pair_settle();
        let deadline = self.artifact_deadline;
        let requested = unless_cancelled(cancel, async {
            // The library needs a moment after connecting before it accepts the request.
            tokio::time::sleep(settle).await;
            tokio::time::timeout_at(deadline, socket.request_pairing_code(&number)).await
        })
        .await;
        let Some(requested) = requested else {
            debug!("attempt {} cancelled before its pairing code", self.id);
            return attempt.on_cancel();
        };
        let Ok(requested) = requested else {
            warn!("pairing code for {number} not issued in time");
            return attempt.on_artifact_timeout();
        };

        match requested {
            Ok(code) => {
                let code = format_pairing_code(&code);
                info!("pairing code issued for {number}");
                self.respond(Ok(Artifact::PairingCode(code)));
                attempt.on_artifact_sent();
                Vec::new()
            }
            Err(e) => {
                warn!("pairing code request for {number} failed: {e}");
                self.respond(Err(LinkError::PairingCode));
                attempt.on_artifact_failed(&format!("pairing code request failed: {e}"))
            }
        }
    }

    fn render_qr(&mut self, attempt: &mut Attempt, payload: String) -> Vec<Action> {
        match qr_data_url(&payload) {
            Ok(data_url) => {
                info!("QR issued for attempt {}", self.id);
                self.respond(Ok(Artifact::Qr { payload, data_url }));
                attempt.on_artifact_sent();
                Vec::new()
            }
            Err(e) => {
                error!("QR rendering failed: {e}");
                self.respond(Err(LinkError::QrRender(e.to_string())));
                attempt.on_artifact_failed(&format!("QR rendering failed: {e}"))
            }
        }
    }

    async fn persist(
        &mut self,
        me: Option<&str>,
        socket: Option<&dyn LinkSocket>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let inner = self.inner.clone();
        let link = &inner.link;

        let waited = unless_cancelled(
            cancel,
            capture::wait_for_creds(&self.dir, link.creds_wait_attempts, link.creds_wait_interval()),
        )
        .await;
        let Some(found) = waited else {
            debug!("attempt {} cancelled while waiting for credentials", self.id);
            return Outcome::Cancelled;
        };
        if !found {
            warn!("linked, but no credentials were written to {}", self.dir.display());
            return Outcome::Skipped("no credentials written".into());
        }

        let captured = match capture::read_store(&self.dir).await {
            Ok(captured) => captured,
            Err(e) => {
                warn!("cannot read credential store {}: {e}", self.dir.display());
                return Outcome::Skipped(format!("unreadable store: {e}"));
            }
        };

        let Some(key) = capture::resolve_key(self.request.key.as_deref(), me, &captured) else {
            warn!("linked, but the account number is unknown; nothing stored");
            return Outcome::Skipped("account number unknown".into());
        };
        let session_id = self.request.session_id(&key);

        let record = match capture::persist(
            &inner.store,
            &key,
            &session_id,
            self.request.mode,
            captured,
            inner.memory.session_ttl_days,
            inner.memory.retention_versions,
        )
        .await
        {
            Ok(record) => record,
            Err(e) => {
                error!("failed to persist session for {key}: {e}");
                return Outcome::Failed(format!("persistence failed: {e}"));
            }
        };
        info!("session {key} persisted as version {}", record.version);

        if link.send_confirmation {
            if let Some(socket) = socket {
                match unless_cancelled(cancel, socket.send_text(&user_jid(&key), &session_id)).await
                {
                    Some(Ok(())) => {}
                    Some(Err(e)) => warn!("confirmation to {key} failed: {e}"),
                    None => debug!("confirmation to {key} skipped, attempt cancelled"),
                }
            }
        }

        self.persisted_as = Some((key.clone(), session_id));
        Outcome::Persisted {
            key,
            version: record.version,
        }
    }

    async fn refresh(&self) {
        let Some((key, session_id)) = &self.persisted_as else {
            return;
        };
        let captured = match capture::read_store(&self.dir).await {
            Ok(captured) => captured,
            Err(e) => {
                warn!("credential refresh for {key} skipped: {e}");
                return;
            }
        };
        match self
            .inner
            .store
            .refresh_credentials(
                key,
                session_id,
                &captured.credentials,
                &captured.files,
                Utc::now(),
            )
            .await
        {
            Ok(true) => debug!("credentials for {key} refreshed"),
            Ok(false) => debug!("credentials for {key} superseded, refresh dropped"),
            Err(e) => warn!("credential refresh for {key} failed: {e}"),
        }
    }

    fn respond(&mut self, result: Result<Artifact, LinkError>) {
        if let Some(tx) = self.responder.take() {
            if tx.send(result).is_err() {
                debug!("attempt {}: caller gone before the response", self.id);
            }
        }
    }

    async fn finish(
        mut self,
        outcome: Outcome,
        retries: u32,
        started: Instant,
        done: oneshot::Sender<Outcome>,
    ) {
        let unanswered = match &outcome {
            Outcome::TimedOut => LinkError::Timeout {
                mode: self.request.mode,
            },
            Outcome::Cancelled => LinkError::Cancelled,
            _ => LinkError::Unavailable,
        };
        self.respond(Err(unanswered));

        cleanup::remove_store(&self.dir).await;

        let (audit_outcome, detail) = match &outcome {
            Outcome::Persisted { version, .. } => {
                (AuditOutcome::Persisted, Some(format!("version {version}")))
            }
            Outcome::Skipped(reason) => (AuditOutcome::Skipped, Some(reason.clone())),
            Outcome::Failed(reason) => (AuditOutcome::Failed, Some(reason.clone())),
            Outcome::TimedOut => (AuditOutcome::TimedOut, None),
            Outcome::Cancelled => (AuditOutcome::Cancelled, None),
        };
        let key = self
            .persisted_as
            .as_ref()
            .map(|(key, _)| key.clone())
            .or_else(|| self.request.key.clone());
        let entry = AuditEntry {
            attempt_id: self.id.to_string(),
            key,
            mode: self.request.mode,
            outcome: audit_outcome,
            detail,
            retries,
            duration_ms: Some(started.elapsed().as_millis() as i64),
        };
        if let Err(e) = self.inner.audit.log(&entry).await {
            warn!("audit write failed: {e}");
        }

        match &outcome {
            Outcome::Persisted { key, .. } => info!("attempt {} done: {key} linked", self.id),
            Outcome::Cancelled => info!("attempt {} cancelled", self.id),
            other => warn!("attempt {} for {} ended: {other:?}", self.id, self.store_name),
        }

        self.inner.registry.release(&self.store_name, self.id).await;
        let _ = done.send(outcome);
    }
}

/// Wait out a reconnect delay. False when cancelled meanwhile.
async fn backoff(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    unless_cancelled(cancel, tokio::time::sleep(delay))
        .await
        .is_some()
}

/// Resolves once the attempt is cancelled, immediately if it already was.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // A dropped sender means the registry let go of the attempt.
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// Run `fut` unless the attempt is cancelled first.
async fn unless_cancelled<F: Future>(
    cancel: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => None,
        out = fut => Some(out),
    }
}

/// Resolves `CANCEL_GRACE` after cancellation was requested.
async fn grace_expired(mut cancel: watch::Receiver<bool>) {
    cancelled(&mut cancel).await;
    tokio::time::sleep(CANCEL_GRACE).await;
}

fn final_outcome(actions: Vec<Action>) -> Outcome {
    actions
        .into_iter()
        .find_map(|action| match action {
            Action::Finish(outcome) => Some(outcome),
            _ => None,
        })
        .unwrap_or(Outcome::Cancelled)
}
