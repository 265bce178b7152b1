//! conductor - phased multi-agent workflow orchestration engine.
//!
//! `conductor` decomposes a user request into a fixed sequence of phases,
//! dispatches specialized agents to LLM providers with fallback, coordinates
//! parallel agent execution with shared scratch state, manages bounded
//! context packages with token-aware compression, and records evidence and
//! timeline events for cross-session continuity.
//!
//! # Architecture
//!
//! - [`tokens`] - heuristic token estimator
//! - [`atomic`] - atomic file writer and multi-op file transactions
//! - [`memory`] - typed entity store with per-type retention
//! - [`coordination`] - ephemeral key/value, pub/sub, and timeline store
//! - [`context`] - token-budgeted context packages with typed compression
//! - [`agents`] - agent definition registry
//! - [`provider`] - agent provider adapter with fallback and bounded fan-out
//! - [`workflow`] - phase sequencing engine
//! - [`orchestrator`] - facade wiring all of the above together
//! - [`config`] - layered configuration loading
//!
//! Library code never installs a global `tracing` subscriber; only the
//! `conductor` binary does, so this crate is safe to embed.

#![warn(missing_docs)]

pub mod agents;
pub mod atomic;
pub mod config;
pub mod context;
pub mod coordination;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod provider;
pub mod tokens;
pub mod workflow;

pub use error::{ConductorError, Result};
pub use orchestrator::Orchestrator;

/// conductor version, derived from the crate's own manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
