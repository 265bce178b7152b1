//! Layered configuration loader (A2).
//!
//! Matches the scope-precedence merge idiom in `axon/src/cc/settings/loader.rs`
//! and the `config`-crate usage in `cortex-cli`: compiled-in defaults, then an
//! optional `~/.conductor/config.toml`, then an optional project-local
//! `conductor.toml`, then `CONDUCTOR_`-prefixed environment variables, each
//! layer overriding the previous on a per-key basis.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// `orchestration.*` settings from spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationSettings {
    /// Bound on in-flight parallel agent dispatches.
    pub max_parallel_agents: usize,
    /// Bound on workflow phase-loop iterations (defensive upper bound; the
    /// fixed 10-phase sequence never approaches it in normal operation).
    pub max_workflow_iterations: u32,
    /// Whether to collect and store evidence items.
    pub enable_evidence_collection: bool,
    /// Whether the coordination store is initialized for cross-session
    /// continuity (timeline/state persistence).
    pub enable_cross_session_continuity: bool,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            max_parallel_agents: crate::provider::DEFAULT_MAX_PARALLEL,
            max_workflow_iterations: 50,
            enable_evidence_collection: true,
            enable_cross_session_continuity: true,
        }
    }
}

/// `context.*` settings: per-package-type token budgets, overriding
/// [`crate::context::PackageType::token_limit`] defaults when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Override for the strategic package token budget.
    pub strategic_context_tokens: Option<u64>,
    /// Override for the technical package token budget.
    pub technical_context_tokens: Option<u64>,
    /// Override for the frontend package token budget.
    pub frontend_context_tokens: Option<u64>,
    /// Override for the security package token budget.
    pub security_context_tokens: Option<u64>,
    /// Override for the performance package token budget.
    pub performance_context_tokens: Option<u64>,
    /// Override for the database package token budget.
    pub database_context_tokens: Option<u64>,
    /// Fallback budget applied to any package type without an explicit
    /// override.
    pub default_context_tokens: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            strategic_context_tokens: None,
            technical_context_tokens: None,
            frontend_context_tokens: None,
            security_context_tokens: None,
            performance_context_tokens: None,
            database_context_tokens: None,
            default_context_tokens: 4000,
        }
    }
}

/// Redis connection settings under `mcp.redis.*`, kept for configuration
/// shape compatibility even though this crate ships only the in-process
/// [`crate::coordination::InMemoryCoordinationBackend`] (see spec.md §6,
/// "Any RESP-compatible implementation satisfies the contract").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Connection URL for a real RESP-compatible backend, unused by the
    /// shipped in-process default.
    pub redis_url: Option<String>,
}

/// `mcp.*` settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    /// Redis-shaped coordination backend settings.
    pub redis: RedisSettings,
}

/// `workflow.*` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Path to the YAML workflow configuration file (phase definitions).
    pub config_path: String,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            config_path: "workflow.yaml".to_string(),
        }
    }
}

/// Top-level orchestrator configuration, per spec.md §6.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// `orchestration.*`.
    pub orchestration: OrchestrationSettings,
    /// `context.*`.
    pub context: ContextSettings,
    /// `mcp.*`.
    pub mcp: McpSettings,
    /// `workflow.*`.
    pub workflow: WorkflowSettings,
    /// Directory persisted state (sessions, reports, audit trail) is
    /// written under, per spec.md §6 ("Persisted state layout").
    pub state_dir: String,
}

fn default_state_dir() -> String {
    dirs::home_dir()
        .map(|home| home.join(".conductor").display().to_string())
        .unwrap_or_else(|| ".conductor".to_string())
}

impl OrchestratorConfig {
    /// Loads configuration by layering, in order: compiled-in defaults, an
    /// optional `~/.conductor/config.toml`, an optional project-local
    /// `conductor.toml`, and `CONDUCTOR_`-prefixed environment variables.
    pub fn load() -> Result<Self, ConfigurationError> {
        let defaults_toml = toml::to_string(&Self::defaults()).map_err(|e| ConfigurationError::Parse {
            path: "<compiled-in defaults>".to_string(),
            source: anyhow::anyhow!(e),
        })?;
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(&defaults_toml, config::FileFormat::Toml));

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".conductor").join("config.toml");
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config).required(false));
            }
        }

        let project_config = std::path::Path::new("conductor.toml");
        if project_config.exists() {
            builder = builder.add_source(config::File::from(project_config).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONDUCTOR")
                .separator("__")
                .try_parsing(true),
        );

        let built = builder.build().map_err(|e| ConfigurationError::Parse {
            path: "<layered config>".to_string(),
            source: anyhow::anyhow!(e),
        })?;

        built.try_deserialize().map_err(|e| ConfigurationError::Parse {
            path: "<layered config>".to_string(),
            source: anyhow::anyhow!(e),
        })
    }

    fn defaults() -> Self {
        Self {
            state_dir: default_state_dir(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let defaults = OrchestratorConfig::defaults();
        assert_eq!(defaults.orchestration.max_parallel_agents, crate::provider::DEFAULT_MAX_PARALLEL);
        assert!(defaults.orchestration.enable_evidence_collection);
        assert_eq!(defaults.context.default_context_tokens, 4000);
        assert!(!defaults.state_dir.is_empty());
    }

    #[test]
    fn serializes_round_trips_through_toml() {
        let defaults = OrchestratorConfig::defaults();
        let serialized = toml::to_string(&defaults).expect("serialize");
        let parsed: OrchestratorConfig = toml::from_str(&serialized).expect("parse");
        assert_eq!(parsed.orchestration.max_parallel_agents, defaults.orchestration.max_parallel_agents);
    }
}
