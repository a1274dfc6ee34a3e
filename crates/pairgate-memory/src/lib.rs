//! # pairgate-memory
//!
//! Persistent session store for pairgate (SQLite-backed).

pub mod audit;
pub mod store;

pub use audit::AuditLogger;
pub use store::{NewSession, Store};
