//! Per-attempt state machine.
//!
//! `Attempt` is pure: it consumes socket events and timer expiries and returns
//! the side effects the driver must run. It never touches the socket, disk,
//! or database itself.

use pairgate_core::link::LinkMode;
use pairgate_core::traits::{is_terminal_close, SocketEvent};
use std::time::Duration;

/// Lifecycle of one linking attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Socket starting, no login artifact yet.
    Pending,
    /// Artifact returned to the caller, waiting for the device to link.
    ArtifactReady,
    /// Connection opened, credentials being persisted.
    Linked,
    /// Credentials stored. Lingering for late credential updates.
    Persisted,
    /// Attempt over without a stored session.
    Failed,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Persisted { key: String, version: i64 },
    /// Linked, but nothing could be stored (no credentials or no key).
    Skipped(String),
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Timers the driver arms for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// No login artifact was produced in time.
    Artifact,
    /// The device never linked.
    Link,
    /// Post-persistence window for late credential updates is over.
    Linger,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RequestPairingCode,
    RenderQr(String),
    Persist { me: Option<String> },
    RefreshCredentials,
    Reconnect { delay: Duration },
    RespondTimeout,
    Finish(Outcome),
}

/// Bounded reconnect budget as an explicit backoff table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
}

impl RetryPolicy {
    /// `max_retries` reconnects, each after the same `delay`.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            backoff: vec![delay; max_retries as usize],
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.backoff.len() as u32
    }

    /// Delay before reconnect number `retry` (0-based), or `None` when exhausted.
    pub fn delay(&self, retry: u32) -> Option<Duration> {
        self.backoff.get(retry as usize).copied()
    }
}

/// State of one linking attempt.
#[derive(Debug)]
pub struct Attempt {
    mode: LinkMode,
    phase: Phase,
    /// Set as soon as an artifact is on its way to the caller.
    artifact_claimed: bool,
    retries: u32,
    policy: RetryPolicy,
    /// Set once credentials are stored.
    persisted: Option<Outcome>,
}

impl Attempt {
    pub fn new(mode: LinkMode, policy: RetryPolicy) -> Self {
        Self {
            mode,
            phase: Phase::Pending,
            artifact_claimed: false,
            retries: 0,
            policy,
            persisted: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn artifact_claimed(&self) -> bool {
        self.artifact_claimed
    }

    /// Whether the given timer still matters in the current phase.
    pub fn is_armed(&self, deadline: Deadline) -> bool {
        match deadline {
            Deadline::Artifact => !self.artifact_claimed && self.phase == Phase::Pending,
            Deadline::Link => matches!(self.phase, Phase::Pending | Phase::ArtifactReady),
            Deadline::Linger => self.phase == Phase::Persisted,
        }
    }

    /// A socket (first or reconnected) is up.
    pub fn on_connected(&mut self) -> Vec<Action> {
        if self.mode == LinkMode::Pair && !self.artifact_claimed && self.phase == Phase::Pending {
            self.artifact_claimed = true;
            return vec![Action::RequestPairingCode];
        }
        Vec::new()
    }

    /// The socket could not be (re)opened.
    pub fn on_connect_failed(&mut self, reason: &str) -> Vec<Action> {
        self.on_event(&SocketEvent::Close { status: None })
            .into_iter()
            .map(|action| match action {
                Action::Finish(Outcome::Failed(_)) => {
                    Action::Finish(Outcome::Failed(format!("socket unavailable: {reason}")))
                }
                other => other,
            })
            .collect()
    }

    pub fn on_event(&mut self, event: &SocketEvent) -> Vec<Action> {
        if self.phase == Phase::Failed {
            return Vec::new();
        }

        match event {
            SocketEvent::Qr(payload) => {
                if self.mode == LinkMode::Qr && !self.artifact_claimed && self.phase == Phase::Pending
                {
                    self.artifact_claimed = true;
                    vec![Action::RenderQr(payload.clone())]
                } else {
                    // Rotated QR after the first one was returned.
                    Vec::new()
                }
            }
            SocketEvent::Open { me } => match self.phase {
                Phase::Pending | Phase::ArtifactReady => {
                    self.phase = Phase::Linked;
                    vec![Action::Persist { me: me.clone() }]
                }
                _ => Vec::new(),
            },
            SocketEvent::CredsUpdated => {
                if self.phase == Phase::Persisted {
                    vec![Action::RefreshCredentials]
                } else {
                    Vec::new()
                }
            }
            SocketEvent::Close { status } => self.on_close(*status),
        }
    }

    fn finish_persisted(&self) -> Vec<Action> {
        self.persisted
            .clone()
            .map(Action::Finish)
            .into_iter()
            .collect()
    }

    fn on_close(&mut self, status: Option<u16>) -> Vec<Action> {
        if self.phase == Phase::Persisted {
            return self.finish_persisted();
        }

        if is_terminal_close(status) {
            self.phase = Phase::Failed;
            let code = status.map(|s| s.to_string()).unwrap_or_default();
            return vec![Action::Finish(Outcome::Failed(format!(
                "logged out (status {code})"
            )))];
        }

        match self.policy.delay(self.retries) {
            Some(delay) => {
                self.retries += 1;
                vec![Action::Reconnect { delay }]
            }
            None => {
                self.phase = Phase::Failed;
                vec![Action::Finish(Outcome::Failed(format!(
                    "connection closed after {} retries",
                    self.retries
                )))]
            }
        }
    }

    /// The login artifact reached the responder.
    pub fn on_artifact_sent(&mut self) {
        if self.phase == Phase::Pending {
            self.phase = Phase::ArtifactReady;
        }
    }

    /// Producing the artifact failed (pairing-code request or QR render).
    pub fn on_artifact_failed(&mut self, reason: &str) -> Vec<Action> {
        self.phase = Phase::Failed;
        vec![Action::Finish(Outcome::Failed(reason.to_string()))]
    }

    /// Producing the artifact took too long.
    pub fn on_artifact_timeout(&mut self) -> Vec<Action> {
        self.phase = Phase::Failed;
        vec![Action::RespondTimeout, Action::Finish(Outcome::TimedOut)]
    }

    /// Result of the `Persist` action.
    pub fn on_persist_result(&mut self, outcome: Outcome) -> Vec<Action> {
        match outcome {
            Outcome::Persisted { .. } => {
                self.phase = Phase::Persisted;
                self.persisted = Some(outcome);
                Vec::new()
            }
            other => {
                self.phase = Phase::Failed;
                vec![Action::Finish(other)]
            }
        }
    }

    pub fn on_deadline(&mut self, deadline: Deadline) -> Vec<Action> {
        if !self.is_armed(deadline) {
            return Vec::new();
        }
        match deadline {
            Deadline::Artifact => self.on_artifact_timeout(),
            Deadline::Link => {
                self.phase = Phase::Failed;
                vec![Action::Finish(Outcome::TimedOut)]
            }
            Deadline::Linger => self.finish_persisted(),
        }
    }

    pub fn on_cancel(&mut self) -> Vec<Action> {
        if self.phase == Phase::Persisted {
            return self.finish_persisted();
        }
        self.phase = Phase::Failed;
        vec![Action::Finish(Outcome::Cancelled)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_secs(2))
    }

    fn persisted() -> Outcome {
        Outcome::Persisted {
            key: "15551234567".into(),
            version: 1,
        }
    }

    #[test]
    fn test_pair_requests_code_once_across_reconnects() {
        let mut attempt = Attempt::new(LinkMode::Pair, policy());
        assert_eq!(attempt.on_connected(), vec![Action::RequestPairingCode]);
        attempt.on_artifact_sent();

        let actions = attempt.on_event(&SocketEvent::Close { status: Some(515) });
        assert_eq!(
            actions,
            vec![Action::Reconnect {
                delay: Duration::from_secs(2)
            }]
        );
        assert!(attempt.on_connected().is_empty());
    }

    #[test]
    fn test_qr_only_first_payload_is_rendered() {
        let mut attempt = Attempt::new(LinkMode::Qr, policy());
        assert!(attempt.on_connected().is_empty());
        assert_eq!(
            attempt.on_event(&SocketEvent::Qr("first".into())),
            vec![Action::RenderQr("first".into())]
        );
        attempt.on_artifact_sent();
        assert!(attempt.on_event(&SocketEvent::Qr("second".into())).is_empty());
        assert!(attempt.on_event(&SocketEvent::Qr("third".into())).is_empty());
    }

    #[test]
    fn test_pair_mode_ignores_qr() {
        let mut attempt = Attempt::new(LinkMode::Pair, policy());
        attempt.on_connected();
        assert!(attempt.on_event(&SocketEvent::Qr("x".into())).is_empty());
    }

    #[test]
    fn test_open_triggers_persist_then_linger() {
        let mut attempt = Attempt::new(LinkMode::Pair, policy());
        attempt.on_connected();
        attempt.on_artifact_sent();

        let me = Some("15551234567:1@s.whatsapp.net".to_string());
        assert_eq!(
            attempt.on_event(&SocketEvent::Open { me: me.clone() }),
            vec![Action::Persist { me }]
        );
        assert_eq!(attempt.phase(), Phase::Linked);

        assert!(attempt.on_persist_result(persisted()).is_empty());
        assert_eq!(attempt.phase(), Phase::Persisted);
        assert!(attempt.is_armed(Deadline::Linger));
        assert!(!attempt.is_armed(Deadline::Link));
        assert_eq!(
            attempt.on_event(&SocketEvent::CredsUpdated),
            vec![Action::RefreshCredentials]
        );
        // A close after persistence is a normal end, not a retry.
        assert_eq!(
            attempt.on_event(&SocketEvent::Close { status: Some(428) }),
            vec![Action::Finish(persisted())]
        );
        assert_eq!(attempt.retries(), 0);
    }

    #[test]
    fn test_creds_update_before_open_is_noop() {
        let mut attempt = Attempt::new(LinkMode::Pair, policy());
        attempt.on_connected();
        assert!(attempt.on_event(&SocketEvent::CredsUpdated).is_empty());
    }

    #[test]
    fn test_terminal_close_never_retries() {
        let mut attempt = Attempt::new(LinkMode::Pair, policy());
        attempt.on_connected();
        let actions = attempt.on_event(&SocketEvent::Close { status: Some(401) });
        assert!(matches!(
            actions.as_slice(),
            [Action::Finish(Outcome::Failed(_))]
        ));
        assert_eq!(attempt.retries(), 0);
        assert_eq!(attempt.phase(), Phase::Failed);
        // Further events are ignored once failed.
        assert!(attempt.on_event(&SocketEvent::Close { status: Some(500) }).is_empty());
    }

    #[test]
    fn test_transient_close_stops_after_budget() {
        let mut attempt = Attempt::new(LinkMode::Qr, policy());
        for expected in 1..=3 {
            let actions = attempt.on_event(&SocketEvent::Close { status: Some(408) });
            assert!(matches!(actions.as_slice(), [Action::Reconnect { .. }]));
            assert_eq!(attempt.retries(), expected);
        }
        let actions = attempt.on_event(&SocketEvent::Close { status: Some(408) });
        assert!(matches!(
            actions.as_slice(),
            [Action::Finish(Outcome::Failed(_))]
        ));
        assert_eq!(attempt.retries(), 3);
    }

    #[test]
    fn test_zero_budget_fails_on_first_close() {
        let mut attempt = Attempt::new(LinkMode::Qr, RetryPolicy::fixed(0, Duration::ZERO));
        let actions = attempt.on_event(&SocketEvent::Close { status: None });
        assert!(matches!(
            actions.as_slice(),
            [Action::Finish(Outcome::Failed(_))]
        ));
    }

    #[test]
    fn test_connect_failure_consumes_budget() {
        let mut attempt = Attempt::new(LinkMode::Qr, RetryPolicy::fixed(1, Duration::ZERO));
        assert!(matches!(
            attempt.on_connect_failed("spawn failed").as_slice(),
            [Action::Reconnect { .. }]
        ));
        match attempt.on_connect_failed("spawn failed").as_slice() {
            [Action::Finish(Outcome::Failed(reason))] => {
                assert!(reason.contains("spawn failed"))
            }
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[test]
    fn test_artifact_timeout_only_before_artifact() {
        let mut attempt = Attempt::new(LinkMode::Qr, policy());
        assert_eq!(
            attempt.on_deadline(Deadline::Artifact),
            vec![Action::RespondTimeout, Action::Finish(Outcome::TimedOut)]
        );

        let mut attempt = Attempt::new(LinkMode::Qr, policy());
        attempt.on_event(&SocketEvent::Qr("x".into()));
        attempt.on_artifact_sent();
        assert!(attempt.on_deadline(Deadline::Artifact).is_empty());
        assert_eq!(
            attempt.on_deadline(Deadline::Link),
            vec![Action::Finish(Outcome::TimedOut)]
        );
    }

    #[test]
    fn test_slow_pairing_code_times_out() {
        let mut attempt = Attempt::new(LinkMode::Pair, policy());
        attempt.on_connected();
        assert_eq!(
            attempt.on_artifact_timeout(),
            vec![Action::RespondTimeout, Action::Finish(Outcome::TimedOut)]
        );
        assert_eq!(attempt.phase(), Phase::Failed);
    }

    #[test]
    fn test_persist_skip_finishes_attempt() {
        let mut attempt = Attempt::new(LinkMode::Qr, policy());
        attempt.on_event(&SocketEvent::Open { me: None });
        let actions = attempt.on_persist_result(Outcome::Skipped("no creds".into()));
        assert_eq!(
            actions,
            vec![Action::Finish(Outcome::Skipped("no creds".into()))]
        );
        assert_eq!(attempt.phase(), Phase::Failed);
    }

    #[test]
    fn test_cancel_after_persist_keeps_outcome() {
        let mut attempt = Attempt::new(LinkMode::Pair, policy());
        attempt.on_connected();
        attempt.on_event(&SocketEvent::Open { me: None });
        attempt.on_persist_result(persisted());
        assert_eq!(attempt.on_cancel(), vec![Action::Finish(persisted())]);
        assert_eq!(
            attempt.on_deadline(Deadline::Linger),
            vec![Action::Finish(persisted())]
        );

        let mut attempt = Attempt::new(LinkMode::Pair, policy());
        assert_eq!(attempt.on_cancel(), vec![Action::Finish(Outcome::Cancelled)]);
    }

    #[test]
    fn test_retry_policy_table() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(5));
        assert_eq!(policy.max_retries(), 2);
        assert_eq!(policy.delay(0), Some(Duration::from_millis(5)));
        assert_eq!(policy.delay(2), None);
    }
}
