//! Agent provider adapter: prompt assembly, fallback dispatch, bounded
//! parallel fan-out, and evidence/success extraction (C7).
//!
//! Grounded field-for-field on
//! `original_source/app/orchestration/agent_adapter.py` — the evidence
//! marker list and success/failure marker detection are intentionally a
//! literal port (spec.md §9 Open Questions: "an implementer MAY extend it
//! but MUST keep the listed markers").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::agents::AgentRegistry;
use crate::error::AgentAdapterError;

/// Default per-request token budget, per spec.md §3.
pub const DEFAULT_MAX_TOKENS: u32 = 4000;
/// Default sampling temperature, per spec.md §3.
pub const DEFAULT_TEMPERATURE: f32 = 0.1;
/// Default parallel fan-out bound, per spec.md §4.7.
pub const DEFAULT_MAX_PARALLEL: usize = 10;

const EVIDENCE_MARKERS: &[&str] = &["evidence:", "**evidence**", "proof:", "file:", "command:"];
const SUCCESS_MARKERS: &[&str] = &["status: success", "success:", "completed successfully"];
const FAILURE_MARKERS: &[&str] = &["status: failure", "failed:", "error:", "unable to"];
const SUBSTANTIAL_CONTENT_THRESHOLD: usize = 100;

/// A request to dispatch one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// The phase or stream this request belongs to (e.g. `"phase_0"`,
    /// `"stream_backend"`, `"mandatory"`).
    pub agent_type: String,
    /// Which registered agent definition to use.
    pub subagent_type: String,
    /// Human-readable task description.
    pub description: String,
    /// Task-specific instructions appended to the agent's prompt.
    pub prompt: String,
    /// Arbitrary context passed through to the prompt.
    pub context: HashMap<String, Value>,
    /// Token budget for the completion.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whether the provider should stream tokens (not displayed by this
    /// crate; forwarded as-is).
    pub stream: bool,
    /// Preferred provider name, if any.
    pub provider_preference: Option<String>,
}

impl AgentRequest {
    /// Builds a request with the spec's documented defaults
    /// (`max_tokens=4000, temperature=0.1, stream=false`).
    pub fn new(agent_type: impl Into<String>, subagent_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            subagent_type: subagent_type.into(),
            description: String::new(),
            prompt: prompt.into(),
            context: HashMap::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            stream: false,
            provider_preference: None,
        }
    }
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt: u64,
    /// Tokens consumed by the completion.
    pub completion: u64,
    /// `prompt + completion`.
    pub total: u64,
}

/// An evidence artifact extracted from an agent response or recorded at the
/// phase level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidenceItem {
    /// One dispatched agent's execution summary.
    AgentExecution {
        /// Dispatched agent's name.
        agent: String,
        /// Whether the dispatch succeeded.
        success: bool,
        /// Wall-clock execution time in seconds.
        execution_time_seconds: f64,
        /// Token usage reported by the provider.
        token_usage: TokenUsage,
        /// Provider that ultimately served the request.
        provider_used: String,
        /// Evidence items extracted from the response content.
        evidence_items: Vec<TextEvidence>,
    },
    /// A concrete artifact pulled from a response's content.
    AgentEvidence {
        /// Dispatched agent's name.
        agent: String,
        /// Always `"response"`.
        source: String,
        /// Line number the marker was found on.
        line_number: usize,
        /// The matched line's trimmed content.
        content: String,
    },
    /// Phase-level rollup.
    PhaseSummary {
        /// Phase this summary belongs to.
        phase_id: String,
        /// Total agents dispatched.
        total_agents: usize,
        /// Agents whose response indicated success.
        successful_agents: usize,
        /// Phase wall-clock time in seconds.
        total_execution_time_seconds: f64,
        /// Final phase status, as a string.
        status: String,
    },
}

/// A raw evidence marker hit inside response content, before it is folded
/// into an [`EvidenceItem::AgentEvidence`] at the phase level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEvidence {
    /// 1-based line number within the response content.
    pub line_number: usize,
    /// Trimmed line content.
    pub content: String,
    /// Always `"text_evidence"`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// The outcome of dispatching one [`AgentRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Whether the dispatch is considered successful.
    pub success: bool,
    /// Raw response content.
    pub content: String,
    /// Provider-reported metadata (model, finish reason, ...).
    pub metadata: HashMap<String, Value>,
    /// Evidence markers extracted from `content`.
    pub evidence: Vec<TextEvidence>,
    /// Wall-clock execution time in seconds.
    pub execution_time_seconds: f64,
    /// Token usage reported by the provider.
    pub token_usage: TokenUsage,
    /// Name of the provider that served the request (empty on failure).
    pub provider_used: String,
    /// Error message, set only when `success` is false due to a dispatch
    /// failure (as opposed to a provider response interpreted as failed).
    pub error: Option<String>,
}

impl AgentResponse {
    fn failed(agent_type: &str, error: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("agent_type".to_string(), Value::String(agent_type.to_string()));
        Self {
            success: false,
            content: String::new(),
            metadata,
            evidence: Vec::new(),
            execution_time_seconds: 0.0,
            token_usage: TokenUsage::default(),
            provider_used: String::new(),
            error: Some(error.into()),
        }
    }
}

/// A completion request sent to the provider manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The fully-assembled agent prompt.
    pub prompt: String,
    /// Token budget.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whether to stream.
    pub stream: bool,
    /// Explicit model override; `None` lets the provider choose.
    pub model: Option<String>,
}

/// A completion returned by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Completion text.
    pub content: String,
    /// Model that served the completion.
    pub model: String,
    /// Token usage, if the provider reported it.
    pub usage: Option<TokenUsage>,
    /// Provider name.
    pub provider: String,
    /// Provider-reported finish reason.
    pub finish_reason: Option<String>,
}

/// Per-provider and aggregate dispatch counters.
#[derive(Debug, Default, Serialize)]
pub struct ExecutionStats {
    /// Total dispatch attempts.
    pub total_requests: u64,
    /// Dispatches that produced a response (success or provider-failure).
    pub successful_requests: u64,
    /// Dispatches that failed before reaching a provider (unknown agent,
    /// provider manager exhausted fallback).
    pub failed_requests: u64,
    /// Successful dispatch count per provider name.
    pub provider_usage: HashMap<String, u64>,
}

#[derive(Default)]
struct StatsInner {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    provider_usage: DashMap<String, AtomicU64>,
}

impl StatsInner {
    fn snapshot(&self) -> ExecutionStats {
        ExecutionStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            provider_usage: self
                .provider_usage
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// The provider-manager contract this crate consumes. Real implementations
/// talk to LLM providers (Ollama, OpenAI, Gemini, ...); this crate only
/// defines the trait boundary, per spec.md §1 out-of-scope.
#[async_trait]
pub trait ProviderManager: Send + Sync {
    /// Tries `preferred_provider` first, falling through remaining
    /// providers on any failure; returns the first success or an error once
    /// every provider has failed.
    async fn complete_with_fallback(
        &self,
        request: CompletionRequest,
        preferred_provider: Option<&str>,
    ) -> anyhow::Result<CompletionResponse>;

    /// Health-checks every configured provider.
    async fn health_check_all(&self) -> HashMap<String, Value>;
}

/// Bridges the agent registry and a [`ProviderManager`], building prompts
/// and dispatching with fallback and bounded parallelism.
pub struct AgentProviderAdapter {
    registry: Arc<AgentRegistry>,
    provider_manager: Arc<dyn ProviderManager>,
    max_parallel: usize,
    stats: StatsInner,
}

impl AgentProviderAdapter {
    /// Builds an adapter over `registry` and `provider_manager`, bounding
    /// parallel fan-out at `max_parallel` (spec default 10).
    pub fn new(registry: Arc<AgentRegistry>, provider_manager: Arc<dyn ProviderManager>, max_parallel: usize) -> Self {
        Self {
            registry,
            provider_manager,
            max_parallel,
            stats: StatsInner::default(),
        }
    }

    /// Number of agent definitions available to this adapter.
    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    /// Current execution statistics snapshot.
    pub fn stats(&self) -> ExecutionStats {
        self.stats.snapshot()
    }

    /// Dispatches a single agent request.
    #[instrument(skip(self, request), fields(agent = %request.subagent_type))]
    pub async fn execute_agent(&self, request: AgentRequest) -> AgentResponse {
        let start = Instant::now();
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let agent = match self.registry.get(&request.subagent_type) {
            Some(agent) => agent,
            None => {
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                return AgentResponse::failed(&request.subagent_type, "Agent not found");
            }
        };

        let prompt = build_agent_prompt(agent, &request);
        let completion_request = CompletionRequest {
            prompt,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: request.stream,
            model: None,
        };

        match self
            .provider_manager
            .complete_with_fallback(completion_request, request.provider_preference.as_deref())
            .await
        {
            Ok(response) => {
                let elapsed = start.elapsed().as_secs_f64();
                self.stats.successful_requests.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .provider_usage
                    .entry(response.provider.clone())
                    .or_default()
                    .fetch_add(1, Ordering::Relaxed);
                process_response(response, elapsed)
            }
            Err(e) => {
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                warn!(agent = %request.subagent_type, error = %e, "agent dispatch failed after fallback");
                AgentResponse::failed(&request.subagent_type, e.to_string())
            }
        }
    }

    /// Dispatches every request concurrently, bounded by `max_parallel`
    /// in-flight calls. Response order matches request order regardless of
    /// completion order; a single agent's failure never fails the whole
    /// call.
    pub async fn execute_parallel(&self, requests: Vec<AgentRequest>) -> Vec<AgentResponse> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut handles = Vec::with_capacity(requests.len());

        for request in requests {
            let semaphore = Arc::clone(&semaphore);
            let agent_type = request.subagent_type.clone();
            let registry = Arc::clone(&self.registry);
            let provider_manager = Arc::clone(&self.provider_manager);

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return AgentResponse::failed(&agent_type, "semaphore closed"),
                };
                execute_agent_standalone(&registry, provider_manager.as_ref(), request).await
            }));
        }

        futures::future::join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(i, joined)| match joined {
                Ok(response) => response,
                Err(e) => AgentResponse::failed(&format!("request-{i}"), format!("task panicked: {e}")),
            })
            .collect()
    }
}

/// Free function so [`AgentProviderAdapter::execute_parallel`] can spawn
/// tasks without borrowing `&self` across an await boundary.
async fn execute_agent_standalone(
    registry: &Arc<AgentRegistry>,
    provider_manager: &dyn ProviderManager,
    request: AgentRequest,
) -> AgentResponse {
    let start = Instant::now();

    let agent = match registry.get(&request.subagent_type) {
        Some(agent) => agent,
        None => return AgentResponse::failed(&request.subagent_type, "Agent not found"),
    };

    let prompt = build_agent_prompt(agent, &request);
    let completion_request = CompletionRequest {
        prompt,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream: request.stream,
        model: None,
    };

    match provider_manager
        .complete_with_fallback(completion_request, request.provider_preference.as_deref())
        .await
    {
        Ok(response) => process_response(response, start.elapsed().as_secs_f64()),
        Err(e) => AgentResponse::failed(&request.subagent_type, e.to_string()),
    }
}

/// Builds the fixed agent prompt template: name, description, body, task
/// type, description, instructions, pretty-printed context, requirements,
/// and the required response structure.
fn build_agent_prompt(agent: &crate::agents::AgentDefinition, request: &AgentRequest) -> String {
    let context_json = serde_json::to_string_pretty(&request.context).unwrap_or_default();

    format!(
        "# {name} Agent\n\
         ## Description: {description}\n\n\
         ## Agent Specification:\n{body}\n\n\
         ## Current Task:\n\
         **Task Type**: {agent_type}\n\
         **Description**: {task_description}\n\
         **Specific Instructions**: {prompt}\n\n\
         ## Context Information:\n{context_json}\n\n\
         ## Requirements:\n\
         - Provide specific, actionable results\n\
         - Include concrete evidence where applicable\n\
         - Focus on the task boundaries defined in the agent specification\n\
         - Return structured output with clear success/failure indicators\n\
         - Optimize for token efficiency while maintaining completeness\n\n\
         ## Response Format:\n\
         Please structure your response with:\n\
         1. **Summary**: Brief overview of actions taken\n\
         2. **Results**: Specific findings or outputs\n\
         3. **Evidence**: Concrete proof of work (file paths, commands, etc.)\n\
         4. **Status**: SUCCESS or FAILURE with brief reason\n\n\
         Begin your specialized agent work:",
        name = agent.name,
        description = agent.description,
        body = agent.body,
        agent_type = request.agent_type,
        task_description = request.description,
        prompt = request.prompt,
        context_json = context_json,
    )
}

fn extract_evidence(content: &str) -> Vec<TextEvidence> {
    content
        .lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let lower = line.to_lowercase();
            if EVIDENCE_MARKERS.iter().any(|marker| lower.contains(marker)) {
                Some(TextEvidence {
                    line_number: i + 1,
                    content: line.trim().to_string(),
                    kind: "text_evidence".to_string(),
                })
            } else {
                None
            }
        })
        .collect()
}

fn assess_success(content: &str) -> bool {
    let lower = content.to_lowercase();
    if SUCCESS_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    if FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    content.trim().len() > SUBSTANTIAL_CONTENT_THRESHOLD
}

fn process_response(response: CompletionResponse, execution_time_seconds: f64) -> AgentResponse {
    let evidence = extract_evidence(&response.content);
    let success = assess_success(&response.content);

    let mut metadata = HashMap::new();
    metadata.insert("model_used".to_string(), Value::String(response.model));
    metadata.insert(
        "finish_reason".to_string(),
        Value::String(response.finish_reason.unwrap_or_else(|| "unknown".to_string())),
    );

    debug!(success, evidence_count = evidence.len(), "processed agent response");

    AgentResponse {
        success,
        content: response.content,
        metadata,
        evidence,
        execution_time_seconds,
        token_usage: response.usage.unwrap_or_default(),
        provider_used: response.provider,
        error: None,
    }
}

/// Re-exported so callers constructing adapter errors don't need to import
/// the error module separately for this common case.
pub fn agent_not_found(name: &str) -> AgentAdapterError {
    AgentAdapterError::AgentNotFound(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentDefinition;
    use std::collections::HashMap as Map;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration};

    fn registry_with(name: &str, body: &str) -> Arc<AgentRegistry> {
        let mut agents = Map::new();
        agents.insert(
            name.to_string(),
            AgentDefinition {
                name: name.to_string(),
                description: "test agent".to_string(),
                body: body.to_string(),
                source_path: PathBuf::from("test.md"),
                extra: Map::new(),
            },
        );
        Arc::new(AgentRegistry::from_definitions(agents))
    }

    struct MockProvider {
        outcomes: DashMap<String, Result<String, String>>,
        delay_ms: u64,
        in_flight: Arc<AtomicUsize>,
        max_observed_in_flight: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                outcomes: DashMap::new(),
                delay_ms: 0,
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_observed_in_flight: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_outcome(self, prompt_contains: &str, outcome: Result<String, String>) -> Self {
            self.outcomes.insert(prompt_contains.to_string(), outcome);
            self
        }
    }

    #[async_trait]
    impl ProviderManager for MockProvider {
        async fn complete_with_fallback(
            &self,
            request: CompletionRequest,
            _preferred_provider: Option<&str>,
        ) -> anyhow::Result<CompletionResponse> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed_in_flight.fetch_max(current, Ordering::SeqCst);

            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            for entry in self.outcomes.iter() {
                if request.prompt.contains(entry.key()) {
                    return match entry.value() {
                        Ok(content) => Ok(CompletionResponse {
                            content: content.clone(),
                            model: "mock-model".to_string(),
                            usage: Some(TokenUsage { prompt: 10, completion: 20, total: 30 }),
                            provider: "mock".to_string(),
                            finish_reason: Some("stop".to_string()),
                        }),
                        Err(e) => Err(anyhow::anyhow!(e.clone())),
                    };
                }
            }

            Ok(CompletionResponse {
                content: "default response".to_string(),
                model: "mock-model".to_string(),
                usage: None,
                provider: "mock".to_string(),
                finish_reason: None,
            })
        }

        async fn health_check_all(&self) -> HashMap<String, Value> {
            HashMap::new()
        }
    }

    #[tokio::test]
    async fn unknown_agent_fails_fast() {
        let registry = Arc::new(AgentRegistry::from_definitions(Map::new()));
        let provider = Arc::new(MockProvider::new());
        let adapter = AgentProviderAdapter::new(registry, provider, DEFAULT_MAX_PARALLEL);

        let response = adapter.execute_agent(AgentRequest::new("phase_0", "ghost", "do it")).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Agent not found"));
        assert_eq!(response.execution_time_seconds, 0.0);
    }

    #[tokio::test]
    async fn success_marker_and_evidence_line_are_detected() {
        let registry = registry_with("developer", "you write code");
        let provider = Arc::new(
            MockProvider::new().with_outcome("hello", Ok("Status: SUCCESS\nfile: x.txt\n".to_string())),
        );
        let adapter = AgentProviderAdapter::new(registry, provider, DEFAULT_MAX_PARALLEL);

        let response = adapter
            .execute_agent(AgentRequest::new("phase_0", "developer", "hello"))
            .await;

        assert!(response.success);
        assert_eq!(response.evidence.len(), 1);
        assert!(response.evidence[0].content.to_lowercase().contains("file:"));
    }

    #[tokio::test]
    async fn parallel_preserves_order_with_mixed_outcomes() {
        let registry = registry_with("agent-a", "a");
        let provider = Arc::new(
            MockProvider::new()
                .with_outcome("task-a", Ok("Status: SUCCESS and plenty of content".repeat(3)))
                .with_outcome("task-b", Err("boom".to_string()))
                .with_outcome("task-c", Ok("Status: SUCCESS and plenty of content".repeat(3))),
        );
        let adapter = AgentProviderAdapter::new(registry, provider, DEFAULT_MAX_PARALLEL);

        let requests = vec![
            AgentRequest::new("phase", "agent-a", "task-a"),
            AgentRequest::new("phase", "agent-a", "task-b"),
            AgentRequest::new("phase", "agent-a", "task-c"),
        ];
        let responses = adapter.execute_parallel(requests).await;

        assert_eq!(responses.len(), 3);
        assert!(responses[0].success);
        assert!(!responses[1].success);
        assert!(responses[1].error.is_some());
        assert!(responses[2].success);
    }

    #[tokio::test]
    async fn parallel_bound_limits_in_flight_requests() {
        let registry = registry_with("agent-a", "a");
        let mut provider = MockProvider::new();
        provider.delay_ms = 100;
        let provider = Arc::new(provider);
        let max_flight = Arc::clone(&provider.max_observed_in_flight);

        let adapter = AgentProviderAdapter::new(registry, provider, 2);
        let requests: Vec<_> = (0..5)
            .map(|i| AgentRequest::new("phase", "agent-a", format!("task-{i}")))
            .collect();

        let start = Instant::now();
        let responses = adapter.execute_parallel(requests).await;
        let elapsed = start.elapsed();

        assert_eq!(responses.len(), 5);
        assert!(max_flight.load(Ordering::SeqCst) <= 2);
        assert!(elapsed.as_millis() >= 250);
        assert!(elapsed.as_millis() < 500);
    }
}
