//! Phased workflow engine: sequences a fixed list of phases, dispatching
//! sequential/parallel/multi-stream agent execution and enforcing the
//! critical-failure policy (C8).
//!
//! Phase-execution semantics are a direct port of
//! `original_source/app/orchestration/workflow_engine.py`'s
//! `execute_workflow`, restructured around explicit result types per
//! spec.md §9 ("replace exceptions for control flow... with explicit result
//! types at phase boundaries").

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::context::ContextManager;
use crate::coordination::CoordinationStore;
use crate::error::WorkflowError;
use crate::provider::{AgentProviderAdapter, AgentRequest, AgentResponse, EvidenceItem};

/// How a phase's agents are dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "execution", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Agents run one after another; responses append in declared order.
    Sequential {
        /// Agent names, in dispatch order.
        agents: Vec<String>,
    },
    /// Agents run concurrently; response order matches request order.
    Parallel {
        /// Agent names, in request order.
        agents: Vec<String>,
    },
    /// Named streams each contribute agents, plus a flat list of mandatory
    /// agents; all are dispatched together via one `execute_parallel` call.
    MultiStream {
        /// Stream name to its agent list.
        streams: BTreeMap<String, Vec<String>>,
        /// Agents dispatched regardless of stream, tagged `agent_type="mandatory"`.
        #[serde(default)]
        mandatory_agents: Vec<String>,
    },
}

/// One phase's immutable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    /// Stable id, e.g. `"phase_0"`.
    pub phase_id: String,
    /// Human-readable name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Dispatch mode and agent lists.
    #[serde(flatten)]
    pub execution: ExecutionMode,
    /// Free-form requirements serialized into agent prompts.
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// Lifecycle status of a phase or workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Constructed but not yet started.
    Pending,
    /// Initializing.
    Initializing,
    /// Actively executing.
    Running,
    /// Finished without a critical failure.
    Completed,
    /// Finished with an unhandled exception escalated to this level.
    Failed,
    /// Paused between phases.
    Paused,
    /// Never attempted (phases after a critical failure).
    Skipped,
}

/// The outcome of running one phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseResult {
    /// Phase this result belongs to.
    pub phase_id: String,
    /// Human-readable phase name, copied from `PhaseDefinition.name`.
    pub name: String,
    /// Final phase status.
    pub status: Status,
    /// When the phase started.
    pub start_time: DateTime<Utc>,
    /// When the phase ended.
    pub end_time: Option<DateTime<Utc>>,
    /// Agent names dispatched, in response order.
    pub agents_executed: Vec<String>,
    /// One response per dispatched agent, in the same order.
    pub agent_responses: Vec<AgentResponse>,
    /// Evidence collected for this phase.
    pub evidence: Vec<EvidenceItem>,
    /// Free-form phase metadata.
    pub metadata: Map<String, Value>,
    /// Set if the phase failed.
    pub error: Option<String>,
}

impl PhaseResult {
    fn new(phase_id: &str, name: &str) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            name: name.to_string(),
            status: Status::Running,
            start_time: Utc::now(),
            end_time: None,
            agents_executed: Vec::new(),
            agent_responses: Vec::new(),
            evidence: Vec::new(),
            metadata: Map::new(),
            error: None,
        }
    }

    fn successful_agents(&self) -> usize {
        self.agent_responses.iter().filter(|r| r.success).count()
    }
}

/// The full state of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecution {
    /// Unique id for this run.
    pub workflow_id: String,
    /// Current lifecycle status.
    pub status: Status,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run ended.
    pub end_time: Option<DateTime<Utc>>,
    /// Phase currently (or most recently) executing.
    pub current_phase: Option<String>,
    /// Completed and attempted phase results, in execution order.
    pub phase_results: Vec<PhaseResult>,
    /// Number of phase-loop iterations performed.
    pub iteration_count: u32,
    /// Context package ids created during this run.
    pub context_packages: Vec<String>,
    /// All evidence items across all phases, in phase order.
    pub global_evidence: Vec<EvidenceItem>,
    /// Original prompt and caller-supplied context.
    pub metadata: Map<String, Value>,
}

impl WorkflowExecution {
    fn new(workflow_id: String, prompt: &str, context: Map<String, Value>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("initial_prompt".into(), Value::String(prompt.to_string()));
        metadata.insert("context".into(), Value::Object(context));

        Self {
            workflow_id,
            status: Status::Initializing,
            start_time: Utc::now(),
            end_time: None,
            current_phase: None,
            phase_results: Vec::new(),
            iteration_count: 0,
            context_packages: Vec::new(),
            global_evidence: Vec::new(),
            metadata,
        }
    }
}

/// `phase_0` and `phase_1` treat ANY agent failure as critical; every other
/// phase is critical only when EVERY dispatched agent failed, per
/// spec.md §4.8.
fn phase_is_critical(phase_id: &str, responses: &[AgentResponse]) -> bool {
    if responses.is_empty() {
        return false;
    }
    if matches!(phase_id, "phase_0" | "phase_1") {
        responses.iter().any(|r| !r.success)
    } else {
        responses.iter().all(|r| !r.success)
    }
}

fn build_phase_prompt(phase: &PhaseDefinition, agent_name: &str, prompt: &str, extra: &str) -> String {
    let requirements_json = serde_json::to_string(&phase.requirements).unwrap_or_else(|_| "[]".to_string());
    format!(
        "## Phase {phase_id}: {name}\n\
         **Your role**: {agent_name}\n\
         **Original request**: {prompt}\n\
         **Phase-specific context**: {extra}\n\
         **Requirements**: {requirements_json}\n",
        phase_id = phase.phase_id,
        name = phase.name,
        agent_name = agent_name,
        prompt = prompt,
        extra = extra,
        requirements_json = requirements_json,
    )
}

/// Drives the 10-phase sequence against an [`AgentProviderAdapter`],
/// optionally attaching a [`ContextManager`] and [`CoordinationStore`].
pub struct WorkflowEngine {
    phases: Vec<PhaseDefinition>,
    adapter: Arc<AgentProviderAdapter>,
    context_manager: Option<Arc<ContextManager>>,
    coordination: Option<Arc<CoordinationStore>>,
    paused: RwLock<bool>,
}

impl WorkflowEngine {
    /// Builds an engine over an ordered phase list, sorted by `phase_id`
    /// (`phase_0` first) at construction time.
    pub fn new(
        mut phases: Vec<PhaseDefinition>,
        adapter: Arc<AgentProviderAdapter>,
        context_manager: Option<Arc<ContextManager>>,
        coordination: Option<Arc<CoordinationStore>>,
    ) -> Self {
        phases.sort_by(|a, b| phase_sort_key(&a.phase_id).cmp(&phase_sort_key(&b.phase_id)));
        Self {
            phases,
            adapter,
            context_manager,
            coordination,
            paused: RwLock::new(false),
        }
    }

    /// Runs every phase in order against `prompt`, stopping early on a
    /// critical phase failure but still completing the workflow overall.
    #[instrument(skip(self, context), fields(workflow_id = %workflow_id.as_deref().unwrap_or("<generated>")))]
    pub async fn execute_workflow(
        &self,
        prompt: &str,
        context: Map<String, Value>,
        workflow_id: Option<String>,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let workflow_id = workflow_id.unwrap_or_else(|| format!("wf-{}", uuid::Uuid::new_v4()));
        let mut execution = WorkflowExecution::new(workflow_id.clone(), prompt, context.clone());
        execution.status = Status::Running;

        let context_str = serde_json::to_string(&context).unwrap_or_default();

        for phase in &self.phases {
            while *self.paused.read() {
                tokio::task::yield_now().await;
            }

            execution.current_phase = Some(phase.phase_id.clone());
            execution.iteration_count += 1;
            let mut result = PhaseResult::new(&phase.phase_id, &phase.name);

            let dispatch_outcome = self.dispatch_phase(phase, prompt, &context_str).await;

            match dispatch_outcome {
                Ok((names, responses)) => {
                    result.agents_executed = names;
                    result.agent_responses = responses;
                    result.evidence = collect_phase_evidence(&phase.phase_id, &result.agents_executed, &result.agent_responses);
                    if phase_is_critical(&phase.phase_id, &result.agent_responses) {
                        result.status = Status::Failed;
                        result.error = Some(format!("critical failure in phase {}", phase.phase_id));
                        warn!(phase_id = %phase.phase_id, "critical phase failure");
                    } else {
                        result.status = Status::Completed;
                    }
                }
                Err(e) => {
                    result.status = Status::Failed;
                    result.error = Some(e.to_string());
                    warn!(phase_id = %phase.phase_id, error = %e, "phase execution raised");
                }
            }
            result.end_time = Some(Utc::now());

            if let Some(context_manager) = &self.context_manager {
                let package_id = format!("{workflow_id}_{}", phase.phase_id);
                let mut payload = Map::new();
                payload.insert("phase_id".into(), Value::String(phase.phase_id.clone()));
                payload.insert(
                    "agents_executed".into(),
                    Value::Array(result.agents_executed.iter().cloned().map(Value::String).collect()),
                );
                payload.insert("success_count".into(), Value::from(result.successful_agents()));
                payload.insert("evidence".into(), serde_json::to_value(&result.evidence).unwrap_or(Value::Null));
                let execution_time = result
                    .end_time
                    .map(|end| (end - result.start_time).num_milliseconds() as f64 / 1000.0)
                    .unwrap_or(0.0);
                payload.insert("execution_time".into(), Value::from(execution_time));

                context_manager.create_package(
                    package_id.clone(),
                    crate::context::PackageType::Generic,
                    payload,
                    None,
                    None,
                );
                execution.context_packages.push(package_id);
            }

            execution.global_evidence.extend(result.evidence.clone());
            let critical = phase_is_critical(&phase.phase_id, &result.agent_responses);
            execution.phase_results.push(result);

            if critical {
                info!(phase_id = %phase.phase_id, "critical phase failure; stopping phase loop");
                break;
            }
        }

        execution.current_phase = None;
        execution.end_time = Some(Utc::now());
        execution.status = Status::Completed;

        Ok(execution)
    }

    async fn dispatch_phase(
        &self,
        phase: &PhaseDefinition,
        prompt: &str,
        context_str: &str,
    ) -> Result<(Vec<String>, Vec<AgentResponse>), WorkflowError> {
        match &phase.execution {
            ExecutionMode::Sequential { agents } => {
                let mut names = Vec::with_capacity(agents.len());
                let mut responses = Vec::with_capacity(agents.len());
                for agent_name in agents {
                    let request = self.build_request(phase, agent_name, "sequential", prompt, context_str, None);
                    let response = self.adapter.execute_agent(request).await;
                    names.push(agent_name.clone());
                    responses.push(response);
                }
                Ok((names, responses))
            }
            ExecutionMode::Parallel { agents } => {
                let mut names = Vec::with_capacity(agents.len());
                let mut requests = Vec::with_capacity(agents.len());
                for agent_name in agents {
                    names.push(agent_name.clone());
                    requests.push(self.build_request(phase, agent_name, "parallel", prompt, context_str, None));
                }
                let responses = self.adapter.execute_parallel(requests).await;
                Ok((names, responses))
            }
            ExecutionMode::MultiStream { streams, mandatory_agents } => {
                let mut names = Vec::new();
                let mut requests = Vec::new();

                for (stream_name, stream_agents) in streams {
                    for agent_name in stream_agents {
                        names.push(agent_name.clone());
                        requests.push(self.build_request(
                            phase,
                            agent_name,
                            &format!("stream_{stream_name}"),
                            prompt,
                            context_str,
                            Some(stream_name),
                        ));
                    }
                }
                for agent_name in mandatory_agents {
                    names.push(agent_name.clone());
                    requests.push(self.build_request(phase, agent_name, "mandatory", prompt, context_str, None));
                }

                let responses = self.adapter.execute_parallel(requests).await;
                Ok((names, responses))
            }
        }
    }

    fn build_request(
        &self,
        phase: &PhaseDefinition,
        agent_name: &str,
        agent_type: &str,
        prompt: &str,
        context_str: &str,
        stream_name: Option<&str>,
    ) -> AgentRequest {
        let mut phase_prompt = build_phase_prompt(phase, agent_name, prompt, context_str);
        if let Some(stream) = stream_name {
            phase_prompt.push_str(&format!(
                "**Stream**: {stream}\nCoordinate with other streams through shared context.\n"
            ));
        }

        let mut request = AgentRequest::new(agent_type, agent_name, phase_prompt);
        request.description = format!("{} / {}", phase.phase_id, agent_name);
        if let Some(stream) = stream_name {
            request.context.insert("stream".to_string(), Value::String(stream.to_string()));
        }
        request
    }

    /// Pauses the phase loop; takes effect before the next phase begins.
    pub fn pause(&self) {
        *self.paused.write() = true;
    }

    /// Resumes a paused phase loop.
    pub fn resume(&self) {
        *self.paused.write() = false;
    }

    /// Whether the engine is currently paused.
    pub fn is_paused(&self) -> bool {
        *self.paused.read()
    }
}

fn phase_sort_key(phase_id: &str) -> u32 {
    phase_id.rsplit('_').next().and_then(|n| n.parse().ok()).unwrap_or(u32::MAX)
}

fn collect_phase_evidence(phase_id: &str, agents: &[String], responses: &[AgentResponse]) -> Vec<EvidenceItem> {
    let mut items = Vec::new();
    let mut successful = 0usize;
    let mut total_time = 0.0;

    for (agent_name, response) in agents.iter().zip(responses.iter()) {
        if response.success {
            successful += 1;
        }
        total_time += response.execution_time_seconds;

        items.push(EvidenceItem::AgentExecution {
            agent: agent_name.clone(),
            success: response.success,
            execution_time_seconds: response.execution_time_seconds,
            token_usage: response.token_usage,
            provider_used: response.provider_used.clone(),
            evidence_items: response.evidence.clone(),
        });

        for e in &response.evidence {
            items.push(EvidenceItem::AgentEvidence {
                agent: agent_name.clone(),
                source: "response".to_string(),
                line_number: e.line_number,
                content: e.content.clone(),
            });
        }
    }

    items.push(EvidenceItem::PhaseSummary {
        phase_id: phase_id.to_string(),
        total_agents: agents.len(),
        successful_agents: successful,
        total_execution_time_seconds: total_time,
        status: "completed".to_string(),
    });

    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentDefinition, AgentRegistry};
    use crate::provider::{CompletionRequest, CompletionResponse, ProviderManager, TokenUsage};
    use async_trait::async_trait;
    use std::collections::HashMap as Map2;
    use std::path::PathBuf;

    fn agent(name: &str) -> (String, AgentDefinition) {
        (
            name.to_string(),
            AgentDefinition {
                name: name.to_string(),
                description: "test".to_string(),
                body: "body".to_string(),
                source_path: PathBuf::from("x.md"),
                extra: Map2::new(),
            },
        )
    }

    struct ScriptedProvider {
        outcomes: dashmap::DashMap<String, Result<String, String>>,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self { outcomes: dashmap::DashMap::new() }
        }
        fn on(self, agent: &str, outcome: Result<&str, &str>) -> Self {
            self.outcomes.insert(
                agent.to_string(),
                outcome.map(|s| s.to_string()).map_err(|s| s.to_string()),
            );
            self
        }
    }

    #[async_trait]
    impl ProviderManager for ScriptedProvider {
        async fn complete_with_fallback(
            &self,
            request: CompletionRequest,
            _preferred: Option<&str>,
        ) -> anyhow::Result<CompletionResponse> {
            for entry in self.outcomes.iter() {
                if request.prompt.contains(entry.key()) {
                    return match entry.value() {
                        Ok(content) => Ok(CompletionResponse {
                            content: content.clone(),
                            model: "mock".to_string(),
                            usage: Some(TokenUsage { prompt: 1, completion: 1, total: 2 }),
                            provider: "mock".to_string(),
                            finish_reason: Some("stop".to_string()),
                        }),
                        Err(e) => Err(anyhow::anyhow!(e.clone())),
                    };
                }
            }
            Ok(CompletionResponse {
                content: "Status: SUCCESS default".to_string(),
                model: "mock".to_string(),
                usage: None,
                provider: "mock".to_string(),
                finish_reason: None,
            })
        }

        async fn health_check_all(&self) -> Map2<String, Value> {
            Map2::new()
        }
    }

    fn adapter_with(agents: Vec<(&str, &str, Result<&str, &str>)>) -> Arc<AgentProviderAdapter> {
        let mut defs = Map2::new();
        let mut provider = ScriptedProvider::new();
        for (name, _role, outcome) in agents {
            let (n, d) = agent(name);
            defs.insert(n, d);
            // anchor on the "**Your role**: <name>" line `build_phase_prompt`
            // always emits, since a bare agent name would also match the
            // literal word "Agent" in every prompt's `# <name> Agent` header.
            provider = provider.on(&format!("**Your role**: {name}"), outcome);
        }
        let registry = Arc::new(AgentRegistry::from_definitions(defs));
        Arc::new(AgentProviderAdapter::new(registry, Arc::new(provider), 10))
    }

    #[tokio::test]
    async fn single_phase_sequential_success() {
        let adapter = adapter_with(vec![(
            "A",
            "agent-A",
            Ok("Status: SUCCESS\nfile: x.txt\n"),
        )]);
        let phase = PhaseDefinition {
            phase_id: "phase_0".to_string(),
            name: "bootstrap".to_string(),
            description: "".to_string(),
            execution: ExecutionMode::Sequential { agents: vec!["A".to_string()] },
            requirements: vec![],
        };
        let engine = WorkflowEngine::new(vec![phase], adapter, None, None);

        let execution = engine.execute_workflow("hello", Map::new(), None).await.unwrap();

        assert_eq!(execution.status, Status::Completed);
        assert_eq!(execution.phase_results.len(), 1);
        let phase_result = &execution.phase_results[0];
        assert_eq!(phase_result.agent_responses.len(), 1);
        assert!(phase_result.agent_responses[0].success);

        let has_agent_execution = phase_result
            .evidence
            .iter()
            .any(|e| matches!(e, EvidenceItem::AgentExecution { .. }));
        let has_agent_evidence = phase_result
            .evidence
            .iter()
            .any(|e| matches!(e, EvidenceItem::AgentEvidence { .. }));
        let summary_ok = phase_result.evidence.iter().any(|e| {
            matches!(e, EvidenceItem::PhaseSummary { successful_agents, .. } if *successful_agents == 1)
        });
        assert!(has_agent_execution && has_agent_evidence && summary_ok);
    }

    #[tokio::test]
    async fn parallel_phase_preserves_order_with_mixed_outcomes() {
        let adapter = adapter_with(vec![
            ("A", "agent-A", Ok("Status: SUCCESS plenty of content here to pass the length bar.")),
            ("B", "agent-B", Err("boom")),
            ("C", "agent-C", Ok("Status: SUCCESS plenty of content here to pass the length bar.")),
        ]);
        let phase = PhaseDefinition {
            phase_id: "phase_2".to_string(),
            name: "fanout".to_string(),
            description: "".to_string(),
            execution: ExecutionMode::Parallel { agents: vec!["A".to_string(), "B".to_string(), "C".to_string()] },
            requirements: vec![],
        };
        let engine = WorkflowEngine::new(vec![phase], adapter, None, None);

        let execution = engine.execute_workflow("hello", Map::new(), None).await.unwrap();
        let phase_result = &execution.phase_results[0];

        assert_eq!(phase_result.agents_executed, vec!["A", "B", "C"]);
        assert!(phase_result.agent_responses[0].success);
        assert!(!phase_result.agent_responses[1].success);
        assert!(phase_result.agent_responses[1].error.is_some());
        assert!(phase_result.agent_responses[2].success);
        let summary_ok = phase_result.evidence.iter().any(|e| {
            matches!(e, EvidenceItem::PhaseSummary { successful_agents, .. } if *successful_agents == 2)
        });
        assert!(summary_ok);
    }

    #[tokio::test]
    async fn critical_phase_1_failure_stops_loop_without_failing_workflow() {
        let adapter = adapter_with(vec![
            ("A", "agent-A", Ok("Status: SUCCESS plenty of content here to pass the length bar.")),
            ("B", "agent-B", Err("always fails")),
        ]);
        let phase_0 = PhaseDefinition {
            phase_id: "phase_0".to_string(),
            name: "bootstrap".to_string(),
            description: "".to_string(),
            execution: ExecutionMode::Sequential { agents: vec!["A".to_string()] },
            requirements: vec![],
        };
        let phase_1 = PhaseDefinition {
            phase_id: "phase_1".to_string(),
            name: "critical".to_string(),
            description: "".to_string(),
            execution: ExecutionMode::Sequential { agents: vec!["B".to_string()] },
            requirements: vec![],
        };
        let phase_2 = PhaseDefinition {
            phase_id: "phase_2".to_string(),
            name: "never reached".to_string(),
            description: "".to_string(),
            execution: ExecutionMode::Sequential { agents: vec!["A".to_string()] },
            requirements: vec![],
        };
        let engine = WorkflowEngine::new(vec![phase_0, phase_1, phase_2], adapter, None, None);

        let execution = engine.execute_workflow("hello", Map::new(), None).await.unwrap();

        assert_eq!(execution.status, Status::Completed);
        assert_eq!(execution.phase_results.len(), 2);
        assert_eq!(execution.phase_results[0].status, Status::Completed);
        assert_eq!(execution.phase_results[1].phase_id, "phase_1");
        assert_eq!(execution.phase_results[1].name, "critical");
        assert_eq!(execution.phase_results[1].status, Status::Failed);
        assert!(execution.phase_results[1].error.is_some());
        assert!(!execution.phase_results[1].agent_responses[0].success);
    }

    #[tokio::test]
    async fn empty_agents_phase_reports_zero_total() {
        let adapter = adapter_with(vec![]);
        let phase = PhaseDefinition {
            phase_id: "phase_3".to_string(),
            name: "empty".to_string(),
            description: "".to_string(),
            execution: ExecutionMode::Parallel { agents: vec![] },
            requirements: vec![],
        };
        let engine = WorkflowEngine::new(vec![phase], adapter, None, None);

        let execution = engine.execute_workflow("hello", Map::new(), None).await.unwrap();
        let phase_result = &execution.phase_results[0];
        assert!(phase_result.agent_responses.is_empty());
        let summary_ok = phase_result.evidence.iter().any(|e| {
            matches!(e, EvidenceItem::PhaseSummary { total_agents, .. } if *total_agents == 0)
        });
        assert!(summary_ok);
    }
}
