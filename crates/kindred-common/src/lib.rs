//! # kindred-common
//!
//! Shared identifiers, signaling wire models, configuration, and error handling
//! used across all Kindred crates. No negotiation logic lives here.

pub mod config;
pub mod error;
pub mod models;
pub mod validation;
