//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the pairing and injection core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//! - Retry/backoff policy shared by the heartbeat and the commit loop
//!
//! ## Overview
//!
//! This crate contains the core runtime utilities that other modules depend on.
//! It establishes the logging conventions, configuration validation, and event
//! broadcasting mechanisms used throughout the system.

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use backoff::BackoffPolicy;
pub use error::{Error, Result};
