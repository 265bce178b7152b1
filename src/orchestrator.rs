//! Orchestrator Facade: wires the agent adapter, coordination/memory
//! stores, context manager, and workflow engine together, and assembles
//! workflow reports (C9).
//!
//! Mirrors `axon/src/orchestration/mod.rs`'s `Orchestrator`, which owns
//! `Arc`-wrapped subsystems and tracks active runs behind an
//! `RwLock<HashMap<...>>`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{error, info, instrument};

use crate::agents::AgentRegistry;
use crate::config::OrchestratorConfig;
use crate::context::{ContextManager, PackageType};
use crate::coordination::CoordinationStore;
use crate::error::{ConductorError, Result};
use crate::memory::MemoryStore;
use crate::provider::{AgentProviderAdapter, AgentRequest, ProviderManager};
use crate::workflow::{PhaseDefinition, Status, WorkflowEngine, WorkflowExecution};

/// Per-phase summary used in the assembled report.
#[derive(Debug, Serialize)]
pub struct PhaseSummary {
    /// Phase id.
    pub id: String,
    /// Phase name.
    pub name: String,
    /// Final status.
    pub status: Status,
    /// Agents dispatched.
    pub agents_executed: usize,
    /// Agents whose response succeeded.
    pub successful_agents: usize,
    /// Phase wall-clock time in seconds.
    pub execution_time: f64,
    /// Evidence items collected for this phase.
    pub evidence_count: usize,
    /// Phase-level error, if any.
    pub error: Option<String>,
}

/// Aggregate per-agent performance across a workflow run.
#[derive(Debug, Default, Serialize, Clone)]
pub struct AgentPerformance {
    /// Times this agent was dispatched.
    pub executions: u64,
    /// Dispatches with `success=true`.
    pub successes: u64,
    /// Summed execution time in seconds.
    pub total_time: f64,
    /// Summed token usage across dispatches.
    pub total_tokens: u64,
}

/// Top-level shape returned to callers of every orchestrator operation.
#[derive(Debug, Serialize)]
pub struct WorkflowReport {
    /// Whether the run is considered successful overall.
    pub success: bool,
    /// Workflow id.
    pub workflow_id: String,
    /// `{total, completed, failed, skipped, total_time_seconds, iteration_count}`.
    pub execution_summary: Map<String, Value>,
    /// One entry per phase attempted.
    pub phase_summaries: Vec<PhaseSummary>,
    /// Keyed by agent name.
    pub agent_performance: HashMap<String, AgentPerformance>,
    /// `{total_items, per_phase, per_agent}`.
    pub evidence_summary: Map<String, Value>,
    /// `{package_id -> {type, token_count, compressed}}`.
    pub context_summary: Map<String, Value>,
}

/// Aggregate health snapshot across the wired subsystems.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// True only if every checked subsystem reports healthy.
    pub overall_healthy: bool,
    /// Number of agents loaded.
    pub adapter: Map<String, Value>,
    /// Coordination store health.
    pub coordination: Map<String, Value>,
    /// Memory store stats.
    pub memory: Map<String, Value>,
    /// Per-provider health from the provider manager.
    pub providers: HashMap<String, Value>,
}

/// Wires every component named in spec.md §2 and exposes the three
/// top-level operations from spec.md §4.9.
pub struct Orchestrator {
    config: OrchestratorConfig,
    adapter: Arc<AgentProviderAdapter>,
    provider_manager: Arc<dyn ProviderManager>,
    coordination: Arc<CoordinationStore>,
    memory: Arc<MemoryStore>,
    context_manager: Arc<ContextManager>,
    workflow_engine: Arc<WorkflowEngine>,
    active_workflows: RwLock<HashMap<String, WorkflowExecution>>,
}

impl Orchestrator {
    /// Builds an orchestrator from its config, agent registry, loaded phase
    /// list, and a caller-supplied provider manager implementation.
    pub async fn new(
        config: OrchestratorConfig,
        registry: Arc<AgentRegistry>,
        phases: Vec<PhaseDefinition>,
        provider_manager: Arc<dyn ProviderManager>,
    ) -> Result<Self> {
        Self::with_context_limits(config, registry, phases, provider_manager, None).await
    }

    /// Same as [`Orchestrator::new`], additionally capping the number of
    /// context packages held locally at once (the workflow config file's
    /// `context_limits.context_packages`, spec.md §6). `None` leaves the
    /// cache unbounded.
    pub async fn with_context_limits(
        config: OrchestratorConfig,
        registry: Arc<AgentRegistry>,
        phases: Vec<PhaseDefinition>,
        provider_manager: Arc<dyn ProviderManager>,
        max_context_packages: Option<usize>,
    ) -> Result<Self> {
        let adapter = Arc::new(AgentProviderAdapter::new(
            registry,
            Arc::clone(&provider_manager),
            config.orchestration.max_parallel_agents,
        ));

        let coordination = Arc::new(CoordinationStore::in_memory());
        if config.orchestration.enable_cross_session_continuity {
            coordination.initialize().await;
        }

        let memory = Arc::new(MemoryStore::new());
        let context_manager = Arc::new(
            ContextManager::with_memory(Arc::clone(&memory))
                .with_budget_overrides(context_budget_overrides(&config))
                .with_max_packages(max_context_packages),
        );

        let workflow_engine = Arc::new(WorkflowEngine::new(
            phases,
            Arc::clone(&adapter),
            Some(Arc::clone(&context_manager)),
            Some(Arc::clone(&coordination)),
        ));

        info!("orchestrator initialized");

        Ok(Self {
            config,
            adapter,
            provider_manager,
            coordination,
            memory,
            context_manager,
            workflow_engine,
            active_workflows: RwLock::new(HashMap::new()),
        })
    }

    /// Runs the full phase sequence for `prompt`, returning the assembled
    /// report.
    #[instrument(skip(self, context))]
    pub async fn execute_workflow(
        &self,
        prompt: &str,
        context: Option<Map<String, Value>>,
        workflow_id: Option<String>,
    ) -> Result<WorkflowReport> {
        let context = context.unwrap_or_default();
        let workflow_id = workflow_id.unwrap_or_else(|| format!("wf-{}", uuid::Uuid::new_v4()));

        self.coordination
            .add_timeline(&workflow_id, "workflow_started", serde_json::json!({"prompt": prompt}))
            .await;

        let outcome = self
            .workflow_engine
            .execute_workflow(prompt, context, Some(workflow_id.clone()))
            .await;

        let execution = match outcome {
            Ok(execution) => execution,
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "workflow execution raised");
                self.coordination
                    .add_timeline(&workflow_id, "workflow_failed", serde_json::json!({"error": e.to_string()}))
                    .await;
                return Err(ConductorError::from(e));
            }
        };

        let event_type = if execution.status == Status::Completed {
            "workflow_completed"
        } else {
            "workflow_failed"
        };
        self.coordination
            .add_timeline(
                &workflow_id,
                event_type,
                serde_json::json!({"status": format!("{:?}", execution.status)}),
            )
            .await;

        let report = assemble_report(&execution, &self.context_manager, &workflow_id);

        self.active_workflows.write().await.insert(workflow_id, execution);

        Ok(report)
    }

    /// Dispatches exactly one agent, bypassing the phase sequence.
    #[instrument(skip(self, context))]
    pub async fn execute_single_agent(
        &self,
        agent_type: &str,
        prompt: &str,
        context: Option<Map<String, Value>>,
    ) -> Result<WorkflowReport> {
        let mut request = AgentRequest::new("single", agent_type, prompt);
        if let Some(context) = context {
            request.context = context.into_iter().collect();
        }

        let response = self.adapter.execute_agent(request).await;
        let workflow_id = format!("single-{}", uuid::Uuid::new_v4());

        let mut agent_performance = HashMap::new();
        agent_performance.insert(
            agent_type.to_string(),
            AgentPerformance {
                executions: 1,
                successes: u64::from(response.success),
                total_time: response.execution_time_seconds,
                total_tokens: response.token_usage.total,
            },
        );

        let mut execution_summary = Map::new();
        execution_summary.insert("total".into(), Value::from(1));
        execution_summary.insert("completed".into(), Value::from(u64::from(response.success)));
        execution_summary.insert("failed".into(), Value::from(u64::from(!response.success)));
        execution_summary.insert("skipped".into(), Value::from(0));
        execution_summary.insert("total_time_seconds".into(), Value::from(response.execution_time_seconds));
        execution_summary.insert("iteration_count".into(), Value::from(1));

        let mut evidence_summary = Map::new();
        evidence_summary.insert("total_items".into(), Value::from(response.evidence.len()));

        Ok(WorkflowReport {
            success: response.success,
            workflow_id,
            execution_summary,
            phase_summaries: Vec::new(),
            agent_performance,
            evidence_summary,
            context_summary: Map::new(),
        })
    }

    /// Dispatches several agents concurrently, bounded by the configured
    /// `max_parallel_agents`, sharing `shared_context` across requests.
    #[instrument(skip(self, requests, shared_context))]
    pub async fn execute_parallel_agents(
        &self,
        requests: Vec<(String, Option<String>, String)>,
        shared_context: Option<Map<String, Value>>,
    ) -> Result<WorkflowReport> {
        let shared_context = shared_context.unwrap_or_default();
        let agent_requests: Vec<AgentRequest> = requests
            .into_iter()
            .map(|(agent_type, description, prompt)| {
                let mut request = AgentRequest::new(agent_type.clone(), agent_type, prompt);
                request.description = description.unwrap_or_default();
                request.context = shared_context.clone().into_iter().collect();
                request
            })
            .collect();

        let responses = self.adapter.execute_parallel(agent_requests).await;
        let workflow_id = format!("parallel-{}", uuid::Uuid::new_v4());

        let total = responses.len();
        let completed = responses.iter().filter(|r| r.success).count();
        let total_time: f64 = responses.iter().map(|r| r.execution_time_seconds).sum();
        let total_items: usize = responses.iter().map(|r| r.evidence.len()).sum();

        let mut execution_summary = Map::new();
        execution_summary.insert("total".into(), Value::from(total));
        execution_summary.insert("completed".into(), Value::from(completed));
        execution_summary.insert("failed".into(), Value::from(total - completed));
        execution_summary.insert("skipped".into(), Value::from(0));
        execution_summary.insert("total_time_seconds".into(), Value::from(total_time));
        execution_summary.insert("iteration_count".into(), Value::from(1));

        let mut evidence_summary = Map::new();
        evidence_summary.insert("total_items".into(), Value::from(total_items));

        Ok(WorkflowReport {
            success: completed == total,
            workflow_id,
            execution_summary,
            phase_summaries: Vec::new(),
            agent_performance: HashMap::new(),
            evidence_summary,
            context_summary: Map::new(),
        })
    }

    /// Aggregates health across the adapter, coordination store, memory
    /// store, and provider manager.
    pub async fn health(&self) -> HealthReport {
        let coordination_health = self.coordination.health().await;
        let memory_stats = self.memory.stats();
        let provider_health = self.adapter_provider_health().await;

        let mut adapter = Map::new();
        adapter.insert("loaded_agents".into(), Value::from(self.adapter.registry_len()));
        let stats = self.adapter.stats();
        adapter.insert("total_requests".into(), Value::from(stats.total_requests));
        adapter.insert("successful_requests".into(), Value::from(stats.successful_requests));
        adapter.insert("failed_requests".into(), Value::from(stats.failed_requests));

        let mut coordination = Map::new();
        coordination.insert("healthy".into(), Value::Bool(coordination_health.healthy));
        coordination.insert("latency_ms".into(), Value::from(coordination_health.latency_ms));

        let mut memory = Map::new();
        memory.insert("total_bytes".into(), Value::from(memory_stats.total_bytes));
        memory.insert(
            "count_by_type".into(),
            serde_json::to_value(&memory_stats.count_by_type).unwrap_or(Value::Null),
        );

        let providers_healthy = provider_health
            .values()
            .all(|v| v.get("healthy").and_then(Value::as_bool).unwrap_or(false));

        HealthReport {
            overall_healthy: coordination_health.healthy && providers_healthy,
            adapter,
            coordination,
            memory,
            providers: provider_health,
        }
    }

    async fn adapter_provider_health(&self) -> HashMap<String, Value> {
        self.provider_manager.health_check_all().await
    }

    /// Snapshot of active (non-evicted) workflow ids.
    pub async fn active_workflow_ids(&self) -> Vec<String> {
        self.active_workflows.read().await.keys().cloned().collect()
    }

    /// Returns the loaded configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Pauses the underlying workflow engine.
    pub fn pause(&self) {
        self.workflow_engine.pause();
    }

    /// Resumes the underlying workflow engine.
    pub fn resume(&self) {
        self.workflow_engine.resume();
    }
}

/// Builds the per-[`PackageType`] budget overrides from `context.*`
/// configuration: explicit `<type>_context_tokens` values win; the catch-all
/// package types (`agent_context`, `merged_context`, `generic`) take
/// `default_context_tokens`.
fn context_budget_overrides(config: &OrchestratorConfig) -> HashMap<PackageType, u64> {
    let settings = &config.context;
    let mut overrides = HashMap::new();
    if let Some(v) = settings.strategic_context_tokens {
        overrides.insert(PackageType::Strategic, v);
    }
    if let Some(v) = settings.technical_context_tokens {
        overrides.insert(PackageType::Technical, v);
    }
    if let Some(v) = settings.frontend_context_tokens {
        overrides.insert(PackageType::Frontend, v);
    }
    if let Some(v) = settings.security_context_tokens {
        overrides.insert(PackageType::Security, v);
    }
    if let Some(v) = settings.performance_context_tokens {
        overrides.insert(PackageType::Performance, v);
    }
    if let Some(v) = settings.database_context_tokens {
        overrides.insert(PackageType::Database, v);
    }
    overrides.insert(PackageType::AgentContext, settings.default_context_tokens);
    overrides.insert(PackageType::MergedContext, settings.default_context_tokens);
    overrides.insert(PackageType::Generic, settings.default_context_tokens);
    overrides
}

fn assemble_report(execution: &WorkflowExecution, context_manager: &ContextManager, workflow_id: &str) -> WorkflowReport {
    let total = execution.phase_results.len();
    let completed = execution
        .phase_results
        .iter()
        .filter(|p| p.status == Status::Completed)
        .count();
    let failed = execution
        .phase_results
        .iter()
        .filter(|p| p.status == Status::Failed)
        .count();
    let skipped = total - completed - failed;

    let total_time_seconds = execution
        .end_time
        .map(|end| (end - execution.start_time).num_milliseconds() as f64 / 1000.0)
        .unwrap_or(0.0);

    let mut execution_summary = Map::new();
    execution_summary.insert("total".into(), Value::from(total));
    execution_summary.insert("completed".into(), Value::from(completed));
    execution_summary.insert("failed".into(), Value::from(failed));
    execution_summary.insert("skipped".into(), Value::from(skipped));
    execution_summary.insert("total_time_seconds".into(), Value::from(total_time_seconds));
    execution_summary.insert("iteration_count".into(), Value::from(execution.iteration_count));

    let phase_summaries: Vec<PhaseSummary> = execution
        .phase_results
        .iter()
        .map(|p| PhaseSummary {
            id: p.phase_id.clone(),
            name: p.name.clone(),
            status: p.status,
            agents_executed: p.agents_executed.len(),
            successful_agents: p.agent_responses.iter().filter(|r| r.success).count(),
            execution_time: p
                .end_time
                .map(|end| (end - p.start_time).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(0.0),
            evidence_count: p.evidence.len(),
            error: p.error.clone(),
        })
        .collect();

    let mut agent_performance: HashMap<String, AgentPerformance> = HashMap::new();
    for phase in &execution.phase_results {
        for (name, response) in phase.agents_executed.iter().zip(phase.agent_responses.iter()) {
            let entry = agent_performance.entry(name.clone()).or_default();
            entry.executions += 1;
            entry.successes += u64::from(response.success);
            entry.total_time += response.execution_time_seconds;
            entry.total_tokens += response.token_usage.total;
        }
    }

    let total_items = execution.global_evidence.len();
    let mut per_phase: Map<String, Value> = Map::new();
    for phase in &execution.phase_results {
        per_phase.insert(phase.phase_id.clone(), Value::from(phase.evidence.len()));
    }
    let mut per_agent: HashMap<String, usize> = HashMap::new();
    for phase in &execution.phase_results {
        for name in &phase.agents_executed {
            *per_agent.entry(name.clone()).or_insert(0) += 1;
        }
    }
    let mut evidence_summary = Map::new();
    evidence_summary.insert("total_items".into(), Value::from(total_items));
    evidence_summary.insert("per_phase".into(), Value::Object(per_phase));
    evidence_summary.insert("per_agent".into(), serde_json::to_value(&per_agent).unwrap_or(Value::Null));

    let mut context_summary = Map::new();
    for package in context_manager.workflow_packages(workflow_id) {
        let mut entry = Map::new();
        entry.insert("type".into(), serde_json::to_value(package.package_type).unwrap_or(Value::Null));
        entry.insert("token_count".into(), Value::from(package.token_count));
        entry.insert("compressed".into(), Value::Bool(package.compressed));
        context_summary.insert(package.package_id, Value::Object(entry));
    }

    let success = execution.status == Status::Completed && failed == 0;

    WorkflowReport {
        success,
        workflow_id: execution.workflow_id.clone(),
        execution_summary,
        phase_summaries,
        agent_performance,
        evidence_summary,
        context_summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentDefinition;
    use crate::provider::{CompletionRequest, CompletionResponse, TokenUsage};
    use async_trait::async_trait;
    use std::collections::HashMap as Map2;
    use std::path::PathBuf;

    struct AlwaysSucceeds;

    #[async_trait]
    impl ProviderManager for AlwaysSucceeds {
        async fn complete_with_fallback(
            &self,
            _request: CompletionRequest,
            _preferred: Option<&str>,
        ) -> anyhow::Result<CompletionResponse> {
            Ok(CompletionResponse {
                content: "Status: SUCCESS and here is plenty of substantial content for the bar.".to_string(),
                model: "mock".to_string(),
                usage: Some(TokenUsage { prompt: 5, completion: 5, total: 10 }),
                provider: "mock".to_string(),
                finish_reason: Some("stop".to_string()),
            })
        }

        async fn health_check_all(&self) -> Map2<String, Value> {
            let mut m = Map2::new();
            m.insert("mock".to_string(), serde_json::json!({"healthy": true}));
            m
        }
    }

    fn registry() -> Arc<AgentRegistry> {
        let mut agents = Map2::new();
        agents.insert(
            "developer".to_string(),
            AgentDefinition {
                name: "developer".to_string(),
                description: "writes code".to_string(),
                body: "body".to_string(),
                source_path: PathBuf::from("x.md"),
                extra: Map2::new(),
            },
        );
        Arc::new(AgentRegistry::from_definitions(agents))
    }

    #[tokio::test]
    async fn execute_single_agent_reports_success() {
        let config = OrchestratorConfig::default();
        let orchestrator = Orchestrator::new(config, registry(), Vec::new(), Arc::new(AlwaysSucceeds))
            .await
            .unwrap();

        let report = orchestrator
            .execute_single_agent("developer", "build the thing", None)
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.agent_performance.get("developer").unwrap().successes, 1);
    }

    #[tokio::test]
    async fn execute_workflow_with_no_phases_reports_completed_and_empty_summaries() {
        let config = OrchestratorConfig::default();
        let orchestrator = Orchestrator::new(config, registry(), Vec::new(), Arc::new(AlwaysSucceeds))
            .await
            .unwrap();

        let report = orchestrator.execute_workflow("hello", None, None).await.unwrap();
        assert!(report.phase_summaries.is_empty());
        assert_eq!(report.execution_summary.get("total").unwrap().as_u64().unwrap(), 0);
    }

    #[tokio::test]
    async fn health_reports_coordination_and_adapter_counters() {
        let config = OrchestratorConfig::default();
        let orchestrator = Orchestrator::new(config, registry(), Vec::new(), Arc::new(AlwaysSucceeds))
            .await
            .unwrap();

        orchestrator.execute_single_agent("developer", "x", None).await.unwrap();
        let health = orchestrator.health().await;
        assert_eq!(health.adapter.get("total_requests").unwrap().as_u64().unwrap(), 1);
        assert!(health.overall_healthy);
        assert_eq!(
            health.providers.get("mock").unwrap().get("healthy").unwrap().as_bool(),
            Some(true)
        );
    }
}
