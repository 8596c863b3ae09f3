//! Core logic for the WhatsApp assistant bridge.
//!
//! This crate is intentionally framework-agnostic. The database, the completion
//! backend and the messaging protocol client live behind ports (traits)
//! implemented in adapter crates.

pub mod assistant;
pub mod auth_state;
pub mod codec;
pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod queue;
pub mod reply;
pub mod utils;
pub mod value;

pub use errors::{Error, Result};
pub use value::Value;
