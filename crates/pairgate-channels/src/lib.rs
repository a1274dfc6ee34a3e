//! # pairgate-channels
//!
//! Integration with the external WhatsApp messaging library and QR rendering.

pub mod bridge;
pub mod qr;

pub use bridge::BridgeSocketFactory;
