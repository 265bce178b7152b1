//! Context package manager: bounded, token-budgeted payloads with
//! type-directed compression (C5).
//!
//! The compression strategies below are a field-for-field port of
//! `original_source/app/orchestration/context_manager.py`'s
//! `_compress_*` methods, as spec.md §4.5 requires.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::ContextError;
use crate::memory::MemoryStore;
use crate::tokens;

/// The type of a context package, each with its own token budget and
/// compression strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    /// High-level architecture and decisions.
    Strategic,
    /// Implementation-level detail.
    Technical,
    /// UI/component-level detail.
    Frontend,
    /// Vulnerabilities and mitigations.
    Security,
    /// Bottlenecks and optimization opportunities.
    Performance,
    /// Schema and query detail.
    Database,
    /// Per-agent scoped context.
    AgentContext,
    /// Result of merging several packages.
    MergedContext,
    /// Catch-all, generic compression strategy.
    Generic,
}

impl PackageType {
    /// Token budget for this package type, per spec.md §3 defaults.
    pub fn token_limit(self) -> u64 {
        match self {
            PackageType::Strategic => 3000,
            PackageType::Technical => 4000,
            PackageType::Frontend => 3000,
            PackageType::Security => 3000,
            PackageType::Performance => 3000,
            PackageType::Database => 3500,
            PackageType::AgentContext | PackageType::MergedContext | PackageType::Generic => 4000,
        }
    }
}

/// A token-budgeted, typed context payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPackage {
    /// Caller-assigned id, unique within the manager.
    pub package_id: String,
    /// Determines the token budget and compression strategy.
    pub package_type: PackageType,
    /// The package's payload.
    pub content: Map<String, Value>,
    /// Free-form metadata; compression annotates this with
    /// `original_tokens`/`compression_ratio`.
    pub metadata: Map<String, Value>,
    /// Estimated token count of `content`, always `<= package_type.token_limit()`.
    pub token_count: u64,
    /// When the package was created.
    pub created_at: DateTime<Utc>,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether `content` underwent lossy compression.
    pub compressed: bool,
}

fn get_array<'a>(content: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    content.get(key).and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

fn get_str(content: &Map<String, Value>, key: &str) -> String {
    content.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn take_first(values: &[Value], n: usize) -> Vec<Value> {
    values.iter().take(n).cloned().collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Compresses `content` according to the per-type strategy in spec.md §4.5,
/// returning the compressed map. Never called unless the package is over
/// budget.
fn compress_content(package_type: PackageType, content: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    match package_type {
        PackageType::Strategic => {
            out.insert(
                "architecture_overview".into(),
                Value::String(truncate_chars(&get_str(content, "architecture_overview"), 500)),
            );
            out.insert("key_decisions".into(), Value::Array(take_first(get_array(content, "key_decisions"), 3)));
            out.insert(
                "integration_points".into(),
                Value::Array(take_first(get_array(content, "integration_points"), 5)),
            );
            out.insert(
                "success_criteria".into(),
                Value::Array(take_first(get_array(content, "success_criteria"), 3)),
            );
            out.insert("constraints".into(), Value::Array(take_first(get_array(content, "constraints"), 3)));
            out.insert(
                "_compression_note".into(),
                Value::String(
                    "Strategic context compressed - detailed implementation available in technical context".into(),
                ),
            );
        }
        PackageType::Technical => {
            out.insert("key_components".into(), Value::Array(take_first(get_array(content, "key_components"), 5)));
            out.insert(
                "implementation_patterns".into(),
                Value::Array(take_first(get_array(content, "implementation_patterns"), 3)),
            );
            out.insert("dependencies".into(), Value::Array(take_first(get_array(content, "dependencies"), 10)));
            out.insert("critical_files".into(), Value::Array(take_first(get_array(content, "critical_files"), 8)));
            out.insert("api_endpoints".into(), Value::Array(take_first(get_array(content, "api_endpoints"), 10)));
            let config = content
                .get("configuration")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            out.insert("configuration".into(), Value::Object(compress_config(&config)));
            out.insert(
                "_compression_note".into(),
                Value::String("Technical details compressed - full codebase analysis available".into()),
            );
        }
        PackageType::Frontend => {
            out.insert("ui_components".into(), Value::Array(take_first(get_array(content, "ui_components"), 8)));
            out.insert("styling_approach".into(), Value::String(get_str(content, "styling_approach")));
            out.insert("state_management".into(), Value::String(get_str(content, "state_management")));
            out.insert(
                "routing_config".into(),
                content.get("routing_config").cloned().unwrap_or(Value::Object(Map::new())),
            );
            out.insert(
                "key_interactions".into(),
                Value::Array(take_first(get_array(content, "key_interactions"), 5)),
            );
            out.insert(
                "_compression_note".into(),
                Value::String("UI details compressed - component library available".into()),
            );
        }
        PackageType::Security => {
            out.insert(
                "critical_vulnerabilities".into(),
                Value::Array(take_first(get_array(content, "critical_vulnerabilities"), 5)),
            );
            out.insert("auth_patterns".into(), Value::Array(take_first(get_array(content, "auth_patterns"), 3)));
            out.insert(
                "security_headers".into(),
                content.get("security_headers").cloned().unwrap_or(Value::Object(Map::new())),
            );
            out.insert(
                "input_validation".into(),
                Value::Array(take_first(get_array(content, "input_validation"), 5)),
            );
            out.insert(
                "mitigation_strategies".into(),
                Value::Array(take_first(get_array(content, "mitigation_strategies"), 5)),
            );
            out.insert(
                "_compression_note".into(),
                Value::String("Security analysis compressed - full audit available".into()),
            );
        }
        PackageType::Performance => {
            out.insert("bottlenecks".into(), Value::Array(take_first(get_array(content, "bottlenecks"), 5)));
            let metrics = content
                .get("performance_metrics")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let limited: Map<String, Value> = metrics.into_iter().take(5).collect();
            out.insert("performance_metrics".into(), Value::Object(limited));
            out.insert(
                "optimization_opportunities".into(),
                Value::Array(take_first(get_array(content, "optimization_opportunities"), 5)),
            );
            out.insert(
                "resource_usage".into(),
                content.get("resource_usage").cloned().unwrap_or(Value::Object(Map::new())),
            );
            out.insert(
                "_compression_note".into(),
                Value::String("Performance data compressed - detailed metrics available".into()),
            );
        }
        PackageType::Database => {
            out.insert("key_tables".into(), Value::Array(take_first(get_array(content, "key_tables"), 10)));
            out.insert("relationships".into(), Value::Array(take_first(get_array(content, "relationships"), 8)));
            out.insert("indexes".into(), Value::Array(take_first(get_array(content, "indexes"), 5)));
            out.insert("query_patterns".into(), Value::Array(take_first(get_array(content, "query_patterns"), 5)));
            out.insert("migrations".into(), Value::Array(take_first(get_array(content, "migrations"), 3)));
            out.insert(
                "_compression_note".into(),
                Value::String("Database schema compressed - full DDL available".into()),
            );
        }
        PackageType::AgentContext | PackageType::MergedContext | PackageType::Generic => {
            const ESSENTIAL_KEYS: &[&str] = &["summary", "key_points", "findings", "recommendations", "status"];
            for key in ESSENTIAL_KEYS {
                if let Some(value) = content.get(*key) {
                    let compressed = match value {
                        Value::Array(items) => Value::Array(take_first(items, 5)),
                        Value::String(s) => Value::String(truncate_chars(s, 500)),
                        other => other.clone(),
                    };
                    out.insert((*key).to_string(), compressed);
                }
            }
            out.insert("_compression_note".into(), Value::String("Generic compression applied".into()));
            out.insert(
                "_available_keys".into(),
                Value::Array(content.keys().map(|k| Value::String(k.clone())).collect()),
            );
        }
    }
    out
}

fn compress_config(config: &Map<String, Value>) -> Map<String, Value> {
    const IMPORTANT_KEYS: &[&str] = &["host", "port", "database", "timeout", "max_connections", "auth_type"];
    let mut out = Map::new();
    for (key, value) in config {
        let important = IMPORTANT_KEYS.contains(&key.as_str());
        let short = value.to_string().len() < 50;
        if important || short {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

fn content_token_count(content: &Map<String, Value>) -> u64 {
    tokens::count_of(&Value::Object(content.clone()))
}

/// Creates, retrieves, and merges [`ContextPackage`]s, compressing payloads
/// that exceed their type's token budget.
pub struct ContextManager {
    packages: DashMap<String, ContextPackage>,
    memory: Option<Arc<MemoryStore>>,
    /// Per-type budget overrides from `context.*` configuration; falls back
    /// to [`PackageType::token_limit`] for any type without an override.
    budget_overrides: HashMap<PackageType, u64>,
    /// Cap on the number of packages held in the local cache at once, from
    /// the workflow config file's `context_limits.context_packages` (spec.md
    /// §6). `None` means unbounded. Oldest-created packages are evicted
    /// first once the cap is exceeded.
    max_packages: Option<usize>,
}

impl ContextManager {
    /// Creates a manager with no memory-store mirroring.
    pub fn new() -> Self {
        Self {
            packages: DashMap::new(),
            memory: None,
            budget_overrides: HashMap::new(),
            max_packages: None,
        }
    }

    /// Creates a manager that mirrors created packages into `memory` as
    /// `context-package` entities.
    pub fn with_memory(memory: Arc<MemoryStore>) -> Self {
        Self {
            packages: DashMap::new(),
            memory: Some(memory),
            budget_overrides: HashMap::new(),
            max_packages: None,
        }
    }

    /// Applies per-type token budget overrides (from `context.*`
    /// configuration) on top of the built-in [`PackageType::token_limit`]
    /// defaults.
    pub fn with_budget_overrides(mut self, overrides: HashMap<PackageType, u64>) -> Self {
        self.budget_overrides = overrides;
        self
    }

    /// Caps the number of packages held locally at once, per the workflow
    /// config file's `context_limits.context_packages` (spec.md §6).
    /// Exceeding the cap evicts the oldest-created package first.
    pub fn with_max_packages(mut self, max_packages: Option<usize>) -> Self {
        self.max_packages = max_packages;
        self
    }

    fn enforce_package_cap(&self) {
        let Some(max) = self.max_packages else { return };
        while self.packages.len() > max {
            let oldest = self
                .packages
                .iter()
                .min_by_key(|p| p.created_at)
                .map(|p| p.package_id.clone());
            match oldest {
                Some(id) => {
                    self.packages.remove(&id);
                }
                None => break,
            }
        }
    }

    fn budget_for(&self, package_type: PackageType) -> u64 {
        self.budget_overrides
            .get(&package_type)
            .copied()
            .unwrap_or_else(|| package_type.token_limit())
    }

    /// Creates a new package, compressing it if it exceeds its type's token
    /// budget. Invariant: the returned package's `token_count` is always
    /// `<= package_type.token_limit()`.
    pub fn create_package(
        &self,
        package_id: impl Into<String>,
        package_type: PackageType,
        content: Map<String, Value>,
        metadata: Option<Map<String, Value>>,
        ttl: Option<Duration>,
    ) -> ContextPackage {
        let package_id = package_id.into();
        let mut metadata = metadata.unwrap_or_default();
        let token_count = content_token_count(&content);
        let limit = self.budget_for(package_type);
        let now = Utc::now();

        let (final_content, final_tokens, compressed) = if token_count > limit {
            let compressed_content = compress_content(package_type, &content);
            let compressed_tokens = content_token_count(&compressed_content);
            metadata.insert("original_tokens".into(), Value::from(token_count));
            metadata.insert(
                "compression_ratio".into(),
                Value::from(limit as f64 / token_count as f64),
            );
            info!(
                package_id = %package_id,
                from = token_count,
                to = compressed_tokens,
                "compressed context package"
            );
            (compressed_content, compressed_tokens, true)
        } else {
            (content, token_count, false)
        };

        let package = ContextPackage {
            package_id: package_id.clone(),
            package_type,
            content: final_content,
            metadata,
            token_count: final_tokens,
            created_at: now,
            expires_at: ttl.map(|d| now + d),
            compressed,
        };

        self.packages.insert(package_id.clone(), package.clone());
        self.enforce_package_cap();

        if let Some(memory) = &self.memory {
            if let Ok(serialized) = serde_json::to_string(&package) {
                memory.store("context-package", package_id, serialized, Default::default());
            }
        }

        package
    }

    /// Retrieves a package by id: local cache first, then the mirrored
    /// memory-store entry on a cache miss. Expired packages are never
    /// returned.
    pub fn retrieve_package(&self, package_id: &str) -> Option<ContextPackage> {
        if let Some(package) = self.packages.get(package_id) {
            if let Some(expires_at) = package.expires_at {
                if expires_at < Utc::now() {
                    drop(package);
                    self.packages.remove(package_id);
                    return None;
                }
            }
            return Some(package.clone());
        }

        let memory = self.memory.as_ref()?;
        let entity = memory.retrieve(package_id)?;
        let package: ContextPackage = serde_json::from_str(&entity.content).ok()?;
        if let Some(expires_at) = package.expires_at {
            if expires_at < Utc::now() {
                return None;
            }
        }
        self.packages.insert(package_id.to_string(), package.clone());
        Some(package)
    }

    /// Merges several packages into one `merged_context` package with a
    /// 7200s expiry.
    pub fn merge_packages(
        &self,
        package_ids: &[String],
        merged_id: impl Into<String>,
    ) -> Result<ContextPackage, ContextError> {
        let mut found = Vec::new();
        for id in package_ids {
            if let Some(package) = self.retrieve_package(id) {
                found.push(package);
            }
        }

        if found.is_empty() && !package_ids.is_empty() {
            return Err(ContextError::MergeIncomplete {
                missing: package_ids.len(),
                requested: package_ids.len(),
            });
        }

        let mut content = Map::new();
        content.insert(
            "merged_from".into(),
            Value::Array(package_ids.iter().map(|id| Value::String(id.clone())).collect()),
        );
        let packages_value: Vec<Value> = found
            .iter()
            .map(|p| {
                let mut m = Map::new();
                m.insert("id".into(), Value::String(p.package_id.clone()));
                m.insert("type".into(), serde_json::to_value(p.package_type).unwrap());
                m.insert("content".into(), Value::Object(p.content.clone()));
                m.insert("compressed".into(), Value::Bool(p.compressed));
                Value::Object(m)
            })
            .collect();
        content.insert("packages".into(), Value::Array(packages_value));

        let mut metadata = Map::new();
        metadata.insert("source_count".into(), Value::from(found.len()));

        Ok(self.create_package(
            merged_id,
            PackageType::MergedContext,
            content,
            Some(metadata),
            Some(Duration::seconds(7200)),
        ))
    }

    /// Builds an `agent_context` package scoping workflow context + agent
    /// data for a single agent, with a 1-hour expiry.
    pub fn create_agent_context(
        &self,
        agent_name: &str,
        workflow_context: AgentContextWorkflow,
        agent_data: Map<String, Value>,
    ) -> ContextPackage {
        let mut content = Map::new();
        content.insert(
            "workflow_context".into(),
            serde_json::to_value(&workflow_context).unwrap_or(Value::Null),
        );
        content.insert("agent_data".into(), Value::Object(agent_data));

        let package_id = format!("agent_{agent_name}_{}", Utc::now().timestamp());
        let mut metadata = Map::new();
        metadata.insert("agent_name".into(), Value::String(agent_name.to_string()));

        self.create_package(
            package_id,
            PackageType::AgentContext,
            content,
            Some(metadata),
            Some(Duration::seconds(3600)),
        )
    }

    /// Removes packages whose `expires_at` has passed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .packages
            .iter()
            .filter(|p| matches!(p.expires_at, Some(t) if t < now))
            .map(|p| p.package_id.clone())
            .collect();
        for id in &expired {
            self.packages.remove(id);
        }
        expired.len()
    }

    /// Returns every non-expired package whose id contains `workflow_id`.
    pub fn workflow_packages(&self, workflow_id: &str) -> Vec<ContextPackage> {
        let now = Utc::now();
        self.packages
            .iter()
            .filter(|p| p.package_id.contains(workflow_id))
            .filter(|p| !matches!(p.expires_at, Some(t) if t < now))
            .map(|p| p.clone())
            .collect()
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The workflow-scoped fields embedded in an agent context package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContextWorkflow {
    /// Phase the agent is executing under.
    pub current_phase: String,
    /// Owning workflow id.
    pub workflow_id: String,
    /// Original user request.
    pub user_request: String,
    /// Success criteria carried from workflow metadata.
    pub success_criteria: Vec<String>,
}
