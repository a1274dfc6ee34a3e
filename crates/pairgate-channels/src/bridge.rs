//! Child-process bridge to the external WhatsApp messaging library.
//!
//! The library runs as a separate process bound to one credential store
//! directory (appended as the last argument). It speaks JSON lines:
//!
//! - stdout events: `qr`, `open`, `close`, `creds`, and replies
//!   (`pairing_code`, `sent`, `error`) correlated by `id`.
//! - stdin commands: `pairing_code`, `send`, `end`.
//!
//! The library flushes credential files to the store before it emits `creds`.

use async_trait::async_trait;
use pairgate_core::{
    config::BridgeConfig,
    error::PairgateError,
    traits::{LinkSocket, SocketEvent, SocketFactory, SocketSession},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Retry delays for sending a message: 500ms, 1s, 2s.
const RETRY_DELAYS_MS: [u64; 3] = [500, 1000, 2000];

/// Grace period for the bridge to exit after `end` before it is killed.
const END_GRACE: Duration = Duration::from_secs(2);

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<String, String>>>>>;

/// A line written by the bridge on stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeMessage {
    Qr {
        data: String,
    },
    Open {
        #[serde(default)]
        me: Option<String>,
    },
    Close {
        #[serde(default, rename = "statusCode")]
        status_code: Option<u16>,
    },
    Creds,
    PairingCode {
        id: u64,
        code: String,
    },
    Sent {
        id: u64,
    },
    Error {
        #[serde(default)]
        id: Option<u64>,
        message: String,
    },
}

/// A line written to the bridge on stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    PairingCode { id: u64, number: &'a str },
    Send { id: u64, jid: &'a str, text: &'a str },
    End,
}

/// Opens bridge processes per credential store.
pub struct BridgeSocketFactory {
    command: Vec<String>,
    request_timeout: Duration,
}

impl BridgeSocketFactory {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            command: config.command.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Program name of the bridge, for diagnostics.
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }
}

#[async_trait]
impl SocketFactory for BridgeSocketFactory {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn open(&self, store_dir: &Path) -> Result<SocketSession, PairgateError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| PairgateError::Config("bridge.command is empty".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .arg(store_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PairgateError::Channel(format!("failed to spawn bridge {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PairgateError::Channel("bridge stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PairgateError::Channel("bridge stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("bridge stderr: {line}");
                }
            });
        }

        let (event_tx, events) = mpsc::channel::<SocketEvent>(64);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));

        let pending_reader = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut closed = false;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        closed |= dispatch_line(&line, &event_tx, &pending_reader).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("bridge stdout read failed: {e}");
                        break;
                    }
                }
            }
            // Fail any requests still waiting on a reply.
            for (_, reply) in pending_reader.lock().await.drain() {
                let _ = reply.send(Err("bridge exited".to_string()));
            }
            if !closed {
                let _ = event_tx.send(SocketEvent::Close { status: None }).await;
            }
            debug!("bridge stdout closed");
        });

        info!("bridge started for {}", store_dir.display());

        Ok(SocketSession {
            socket: Box::new(BridgeSocket {
                stdin: Mutex::new(Some(stdin)),
                child: Mutex::new(child),
                pending,
                next_id: AtomicU64::new(1),
                request_timeout: self.request_timeout,
            }),
            events,
        })
    }
}

/// Route one stdout line. Returns true when the line reported a close.
async fn dispatch_line(
    line: &str,
    event_tx: &mpsc::Sender<SocketEvent>,
    pending: &PendingReplies,
) -> bool {
    let message: BridgeMessage = match serde_json::from_str(line) {
        Ok(m) => m,
        Err(_) => {
            debug!("bridge: ignoring non-protocol line: {line}");
            return false;
        }
    };

    let (event, reply) = match message {
        BridgeMessage::Qr { data } => (Some(SocketEvent::Qr(data)), None),
        BridgeMessage::Open { me } => (Some(SocketEvent::Open { me }), None),
        BridgeMessage::Close { status_code } => (
            Some(SocketEvent::Close {
                status: status_code,
            }),
            None,
        ),
        BridgeMessage::Creds => (Some(SocketEvent::CredsUpdated), None),
        BridgeMessage::PairingCode { id, code } => (None, Some((id, Ok(code)))),
        BridgeMessage::Sent { id } => (None, Some((id, Ok(String::new())))),
        BridgeMessage::Error { id: Some(id), message } => (None, Some((id, Err(message)))),
        BridgeMessage::Error { id: None, message } => {
            error!("bridge error: {message}");
            (None, None)
        }
    };

    if let Some((id, result)) = reply {
        match pending.lock().await.remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!("bridge: reply for unknown request {id}"),
        }
    }

    match event {
        Some(event) => {
            let is_close = matches!(event, SocketEvent::Close { .. });
            let _ = event_tx.send(event).await;
            is_close
        }
        None => false,
    }
}

/// A running bridge process.
struct BridgeSocket {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
    pending: PendingReplies,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl BridgeSocket {
    async fn write_command(&self, command: &BridgeCommand<'_>) -> Result<(), PairgateError> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| PairgateError::Channel("bridge already ended".into()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| PairgateError::Channel(format!("bridge write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| PairgateError::Channel(format!("bridge flush failed: {e}")))?;
        Ok(())
    }

    /// Send a command and wait for its correlated reply.
    async fn request<'a>(
        &self,
        build: impl FnOnce(u64) -> BridgeCommand<'a>,
    ) -> Result<String, PairgateError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_command(&build(id)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(PairgateError::Channel(message)),
            Ok(Err(_)) => Err(PairgateError::Channel("bridge dropped request".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(PairgateError::Channel(format!(
                    "bridge request {id} timed out"
                )))
            }
        }
    }
}

#[async_trait]
impl LinkSocket for BridgeSocket {
    async fn request_pairing_code(&self, number: &str) -> Result<String, PairgateError> {
        self.request(|id| BridgeCommand::PairingCode { id, number })
            .await
    }

    async fn send_text(&self, jid: &str, text: &str) -> Result<(), PairgateError> {
        let mut last_err = None;

        for (attempt, delay_ms) in RETRY_DELAYS_MS.iter().enumerate() {
            match self.request(|id| BridgeCommand::Send { id, jid, text }).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    let attempt_num = attempt + 1;
                    if attempt_num < RETRY_DELAYS_MS.len() {
                        warn!(
                            "send attempt {attempt_num}/{} failed: {e}, retrying in {delay_ms}ms",
                            RETRY_DELAYS_MS.len()
                        );
                        tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(PairgateError::Channel(format!(
            "send failed after {} attempts: {}",
            RETRY_DELAYS_MS.len(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn end(&self) {
        if let Err(e) = self.write_command(&BridgeCommand::End).await {
            debug!("bridge end command not delivered: {e}");
        }
        // Closing stdin lets the bridge observe EOF as well.
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        match tokio::time::timeout(END_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("bridge exited: {status}"),
            Ok(Err(e)) => warn!("bridge wait failed: {e}"),
            Err(_) => {
                warn!("bridge did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}
