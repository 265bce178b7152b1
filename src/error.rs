//! Per-component error taxonomy, unified at the facade boundary.
//!
//! Each component raises its own `thiserror`-derived enum; the adapter and
//! workflow engine convert per-agent/per-phase failures into data
//! (`AgentResponse::error`, `PhaseResult::error`) rather than propagating
//! them, per the propagation policy in spec §7. Only truly unhandled
//! failures escalate up to [`ConductorError`].

use thiserror::Error;

/// Errors raised by the atomic writer / file transaction layer (C2).
#[derive(Debug, Error)]
pub enum AtomicWriteError {
    /// Payload failed schema validation or could not be serialized.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Post-write checksum did not match the pre-write checksum.
    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        /// Target path whose checksum mismatched.
        path: String,
        /// Checksum computed from the temp file before rename.
        expected: String,
        /// Checksum recomputed from the target after rename.
        actual: String,
    },

    /// Underlying I/O failure.
    #[error("atomic write failed for {path}: {source}")]
    Io {
        /// Target path being written.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Escape hatch for anything not worth a dedicated variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the in-process memory store (C3).
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Entity content or metadata failed to serialize.
    #[error("failed to encode entity {id}: {source}")]
    Encode {
        /// Entity id being encoded.
        id: String,
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },

    /// Snapshot persistence failed.
    #[error("snapshot failed: {0}")]
    Snapshot(#[from] AtomicWriteError),

    /// Escape hatch.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the coordination store (C4).
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The backend is unavailable; callers should degrade rather than fail.
    #[error("coordination backend unavailable: {0}")]
    Unavailable(String),

    /// Escape hatch.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the context package manager (C5).
#[derive(Debug, Error)]
pub enum ContextError {
    /// Requested package id has no cached or persisted entry.
    #[error("context package not found: {0}")]
    NotFound(String),

    /// One or more source packages for a merge were missing.
    #[error("cannot merge {missing} missing package(s) out of {requested} requested")]
    MergeIncomplete {
        /// Number of source ids that could not be resolved.
        missing: usize,
        /// Total number of source ids requested for the merge.
        requested: usize,
    },

    /// Underlying memory-store failure while mirroring a package.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Escape hatch.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the agent registry (C6).
#[derive(Debug, Error)]
pub enum AgentRegistryError {
    /// The configured agents directory does not exist or isn't readable.
    #[error("cannot read agents directory {path}: {source}")]
    DirectoryUnreadable {
        /// Directory that could not be scanned.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Escape hatch.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the agent provider adapter (C7).
#[derive(Debug, Error)]
pub enum AgentAdapterError {
    /// The requested agent type has no registered definition.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// Every provider in the fallback chain failed.
    #[error("provider failure: {0}")]
    Provider(String),

    /// Escape hatch.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the workflow engine (C8).
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Workflow configuration did not parse or was missing required phases.
    #[error("invalid workflow configuration: {0}")]
    Configuration(String),

    /// Internal signal: a critical phase failed and the phase loop stopped.
    /// Never escapes the engine as a propagated error — recorded on the
    /// workflow execution instead.
    #[error("critical phase failure at {0}")]
    CriticalPhaseFailure(String),

    /// Underlying adapter failure that escaped per-agent handling.
    #[error(transparent)]
    Adapter(#[from] AgentAdapterError),

    /// Escape hatch.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Crate-wide configuration error, raised at init and not recoverable
/// without user action.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A config file existed but could not be parsed.
    #[error("failed to parse configuration at {path}: {source}")]
    Parse {
        /// Path of the offending config file.
        path: String,
        /// Underlying error from the `config` crate.
        #[source]
        source: anyhow::Error,
    },

    /// Escape hatch.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Unified top-level error for the Orchestrator Facade (C9) and binary.
#[derive(Debug, Error)]
pub enum ConductorError {
    /// Configuration failed to load.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Atomic write layer failed.
    #[error(transparent)]
    AtomicWrite(#[from] AtomicWriteError),

    /// Memory store failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Coordination store failed.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// Context package manager failed.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Agent registry failed.
    #[error(transparent)]
    AgentRegistry(#[from] AgentRegistryError),

    /// Agent provider adapter failed.
    #[error(transparent)]
    AgentAdapter(#[from] AgentAdapterError),

    /// Workflow engine failed.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// Escape hatch for anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias used throughout the crate's fallible public API.
pub type Result<T, E = ConductorError> = std::result::Result<T, E>;
