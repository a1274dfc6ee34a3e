//! Seams to the external messaging library.

use crate::error::PairgateError;
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;

/// Close status reported when the account logged the device out.
pub const STATUS_LOGGED_OUT: u16 = 401;
/// Close status reported when the link was refused outright.
pub const STATUS_FORBIDDEN: u16 = 403;

/// Lifecycle events emitted by a socket, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A (possibly rotated) QR payload to be scanned.
    Qr(String),
    /// The link succeeded. `me` is the device JID when the library knows it.
    Open { me: Option<String> },
    /// The connection ended.
    Close { status: Option<u16> },
    /// The library flushed new key material to the credential store.
    CredsUpdated,
}

/// Whether a close status means the link is permanently invalid.
pub fn is_terminal_close(status: Option<u16>) -> bool {
    matches!(status, Some(STATUS_LOGGED_OUT) | Some(STATUS_FORBIDDEN))
}

/// A live socket bound to one local credential store.
#[async_trait]
pub trait LinkSocket: Send + Sync {
    /// Ask the server for a pairing code for `number` (canonical digits).
    async fn request_pairing_code(&self, number: &str) -> Result<String, PairgateError>;

    /// Send a text message to a JID.
    async fn send_text(&self, jid: &str, text: &str) -> Result<(), PairgateError>;

    /// Release the socket. Best-effort; never fails.
    async fn end(&self);
}

/// An opened socket plus its event stream.
pub struct SocketSession {
    pub socket: Box<dyn LinkSocket>,
    pub events: mpsc::Receiver<SocketEvent>,
}

/// Opens sockets bound to a credential store directory.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self, store_dir: &Path) -> Result<SocketSession, PairgateError>;
}
