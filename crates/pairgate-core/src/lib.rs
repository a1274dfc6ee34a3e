//! # pairgate-core
//!
//! Core types, traits, config, and error handling shared by the pairgate crates.

pub mod config;
pub mod error;
pub mod link;
pub mod phone;
pub mod traits;

pub use config::shellexpand;
