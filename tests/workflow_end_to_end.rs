//! Integration Tests for End-to-End Workflow Orchestration
//!
//! Exercises the seed scenarios through the full `Orchestrator` facade
//! (not just the workflow engine in isolation): phase sequencing, the
//! critical-failure policy, and timeline recording via the coordination
//! store.

use async_trait::async_trait;
use conductor::agents::{AgentDefinition, AgentRegistry};
use conductor::config::OrchestratorConfig;
use conductor::context::PackageType;
use conductor::orchestrator::Orchestrator;
use conductor::provider::{CompletionRequest, CompletionResponse, ProviderManager, TokenUsage};
use conductor::workflow::{ExecutionMode, PhaseDefinition};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

// ============================================================================
// Scripted provider: routes on a marker embedded in the prompt
// ============================================================================

struct ScriptedProvider {
    outcomes: HashMap<&'static str, Result<&'static str, &'static str>>,
}

#[async_trait]
impl ProviderManager for ScriptedProvider {
    async fn complete_with_fallback(
        &self,
        request: CompletionRequest,
        _preferred: Option<&str>,
    ) -> anyhow::Result<CompletionResponse> {
        for (marker, outcome) in &self.outcomes {
            if request.prompt.contains(marker) {
                return match outcome {
                    Ok(content) => Ok(CompletionResponse {
                        content: content.to_string(),
                        model: "mock".to_string(),
                        usage: Some(TokenUsage { prompt: 4, completion: 4, total: 8 }),
                        provider: "mock".to_string(),
                        finish_reason: Some("stop".to_string()),
                    }),
                    Err(e) => Err(anyhow::anyhow!(*e)),
                };
            }
        }
        Ok(CompletionResponse {
            content: "Status: SUCCESS default response with enough content to pass the bar.".to_string(),
            model: "mock".to_string(),
            usage: None,
            provider: "mock".to_string(),
            finish_reason: None,
        })
    }

    async fn health_check_all(&self) -> HashMap<String, Value> {
        let mut health = HashMap::new();
        health.insert("mock".to_string(), json!({"healthy": true}));
        health
    }
}

fn registry_with(names: &[&str]) -> Arc<AgentRegistry> {
    let mut defs = HashMap::new();
    for name in names {
        defs.insert(
            name.to_string(),
            AgentDefinition {
                name: name.to_string(),
                description: format!("{name} description"),
                body: "body".to_string(),
                source_path: PathBuf::from(format!("{name}.md")),
                extra: HashMap::new(),
            },
        );
    }
    Arc::new(AgentRegistry::from_definitions(defs))
}

fn phase(id: &str, execution: ExecutionMode) -> PhaseDefinition {
    PhaseDefinition {
        phase_id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        execution,
        requirements: vec![],
    }
}

#[tokio::test]
async fn single_phase_workflow_completes_with_timeline_recorded() {
    let mut outcomes = HashMap::new();
    outcomes.insert("agent-A", Ok("Status: SUCCESS\nfile: output.txt\n"));
    let provider = Arc::new(ScriptedProvider { outcomes });

    // "agent-A" has to be the registered agent name itself: `build_phase_prompt`
    // only ever embeds the bare name on its "**Your role**:" line, so a marker
    // distinct from a bare letter is needed to avoid also matching every
    // prompt's "# <name> Agent" header.
    let phases = vec![phase("phase_0", ExecutionMode::Sequential { agents: vec!["agent-A".to_string()] })];
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), registry_with(&["agent-A"]), phases, provider)
        .await
        .expect("orchestrator constructs");

    let report = orchestrator
        .execute_workflow("build the thing", None, Some("wf-e2e-1".to_string()))
        .await
        .expect("workflow executes");

    assert!(report.success);
    assert_eq!(report.phase_summaries.len(), 1);
    assert_eq!(report.phase_summaries[0].successful_agents, 1);
    assert!(report.evidence_summary.get("total_items").unwrap().as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn critical_phase_failure_halts_sequence_without_failing_the_workflow() {
    let mut outcomes = HashMap::new();
    outcomes.insert("agent-A", Ok("Status: SUCCESS plenty of substantial content to pass the bar."));
    outcomes.insert("agent-B", Err("provider exhausted"));
    let provider = Arc::new(ScriptedProvider { outcomes });

    let phases = vec![
        phase("phase_0", ExecutionMode::Sequential { agents: vec!["agent-A".to_string()] }),
        phase("phase_1", ExecutionMode::Sequential { agents: vec!["agent-B".to_string()] }),
        phase("phase_2", ExecutionMode::Sequential { agents: vec!["agent-A".to_string()] }),
    ];
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        registry_with(&["agent-A", "agent-B"]),
        phases,
        provider,
    )
    .await
    .expect("orchestrator constructs");

    let report = orchestrator.execute_workflow("hello", None, None).await.expect("workflow executes");

    // phase_1 is critical: every agent failing there halts the sequence
    // before phase_2 is ever attempted. The phase itself is recorded as
    // failed, but that's not escalated to a hard workflow failure, so the
    // run as a whole still reports `completed`.
    assert_eq!(report.phase_summaries.len(), 2);
    assert_eq!(report.phase_summaries[1].id, "phase_1");
    assert_eq!(report.phase_summaries[1].successful_agents, 0);
    assert_eq!(report.phase_summaries[1].status, conductor::workflow::Status::Failed);
    assert_eq!(report.execution_summary.get("completed").unwrap().as_u64().unwrap(), 1);
    assert_eq!(report.execution_summary.get("failed").unwrap().as_u64().unwrap(), 1);
    assert_eq!(report.execution_summary.get("total").unwrap().as_u64().unwrap(), 2);
}

#[tokio::test]
async fn phase_dispatch_persists_a_generic_context_package() {
    let provider = Arc::new(ScriptedProvider { outcomes: HashMap::new() });
    let phases = vec![phase("phase_0", ExecutionMode::Sequential { agents: vec!["agent-A".to_string()] })];
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), registry_with(&["agent-A"]), phases, provider)
        .await
        .unwrap();

    let workflow_id = "wf-context-1".to_string();
    let report = orchestrator
        .execute_workflow("hello", None, Some(workflow_id.clone()))
        .await
        .unwrap();

    let package_id = format!("{workflow_id}_phase_0");
    let entry = report
        .context_summary
        .get(&package_id)
        .expect("phase dispatch persists one generic context package");
    assert_eq!(entry.get("type").unwrap(), &json!("generic"));
    assert!(entry.get("token_count").unwrap().as_u64().unwrap() <= PackageType::Generic.token_limit());
}
