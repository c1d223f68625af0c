//! Planning Loop
//!
//! Top-level state machine for one request: submit the transcript plus the
//! declared capability schemas to the reasoning capability, classify the
//! response as a final answer or a set of proposed invocations, route
//! invocations through the dependency-aware executor, fold the results back
//! into the conversation, and repeat until a final answer or the round
//! budget runs out.
//!
//! The reasoning capability's output is never trusted as a transition until
//! it validates against the registry's declared contracts; a malformed
//! proposal is re-requested once and then fails the round.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::citations::{compose, Citation};
use crate::config::OrchestratorConfig;
use crate::conversation::ConversationState;
use crate::error::{OrchestratorError, Result};
use crate::executor::DependencyAwareExecutor;
use crate::invocation::{CapabilityInvocation, ExecutionResult};
use crate::llm::{LlmClient, LlmResponse, ToolCall, ToolChoice};
use crate::registry::CapabilityRegistry;
use crate::scope::{AccessControlContext, CallerIdentity};

const SYSTEM_PROMPT: &str = "\
You answer questions about business accounts by calling the available retrieval tools.

Rules:
- Every tool call MUST include 'accounts_mentioned': the account names exactly as the \
user wrote them in their request, or null if the request is unscoped.
- Never put identifiers you discovered from earlier results into 'accounts_mentioned'; \
put those into 'accounts_filter'.
- Reference a value discovered by another call in this round as \"$key\" inside 'bindings'.
- When execution results report a failure, you may still answer with the data you have, \
but say explicitly which data was unavailable.
- When you have enough information, answer in plain text without calling tools.";

/// One step of the loop: terminal answer or a round of proposed invocations
#[derive(Debug, Clone)]
pub enum PlannerStep {
    FinalAnswer(String),
    Invocations(Vec<CapabilityInvocation>),
}

/// Loop phases, traced per round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Analyzing,
    Dispatching,
    Folding,
    Done,
}

/// Final response for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerEnvelope {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub rounds_used: usize,
    pub request_id: Uuid,
}

/// The run-until-done planning loop
pub struct PlanningLoop {
    llm: Arc<dyn LlmClient>,
    registry: CapabilityRegistry,
    executor: DependencyAwareExecutor,
    config: OrchestratorConfig,
}

impl PlanningLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        registry: CapabilityRegistry,
        executor: DependencyAwareExecutor,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            llm,
            registry,
            executor,
            config,
        }
    }

    /// Drive one request to completion
    #[instrument(skip_all, fields(caller = %identity.caller_id))]
    pub async fn run(
        &self,
        user_request: &str,
        identity: &CallerIdentity,
    ) -> Result<AnswerEnvelope> {
        let ctx = Arc::new(AccessControlContext::build(identity));
        let mut state = ConversationState::new(user_request);
        let deadline = Instant::now() + self.config.request_deadline;
        let mut collected: Vec<ExecutionResult> = Vec::new();

        for round in 1..=self.config.max_rounds {
            let mut loop_state = LoopState::Analyzing;
            debug!(round, ?loop_state, "round start");

            match self.advance(&mut state, deadline).await? {
                PlannerStep::FinalAnswer(draft) => {
                    loop_state = LoopState::Done;
                    debug!(round, ?loop_state, "terminal answer");
                    let (answer, citations) = compose(&draft, &collected);
                    state.push_assistant(answer.as_str());
                    info!(
                        round,
                        citations = citations.len(),
                        request_id = %state.request_id,
                        "request complete"
                    );
                    return Ok(AnswerEnvelope {
                        answer,
                        citations,
                        rounds_used: round,
                        request_id: state.request_id,
                    });
                }
                PlannerStep::Invocations(invocations) => {
                    loop_state = LoopState::Dispatching;
                    debug!(round, ?loop_state, count = invocations.len(), "dispatching");

                    let results = self
                        .executor
                        .execute(&invocations, &ctx, state.working_mut(), deadline)
                        .await?;

                    loop_state = LoopState::Folding;
                    debug!(round, ?loop_state, "folding results");
                    state.fold_round(&invocations, &results);
                    collected.extend(results);
                }
            }
        }

        warn!(max_rounds = self.config.max_rounds, "round budget exhausted");
        Err(OrchestratorError::RoundBudgetExceeded {
            rounds: self.config.max_rounds,
        })
    }

    /// One reasoning step: transcript + schemas in, classified step out
    ///
    /// The reasoning call is bounded by the request deadline; expiry is a
    /// structured error, never a hang. A schema-violating proposal is pushed
    /// back into the transcript and re-requested exactly once before failing
    /// the round.
    pub async fn advance(
        &self,
        state: &mut ConversationState,
        deadline: Instant,
    ) -> Result<PlannerStep> {
        let tools = self.registry.tool_definitions();
        let mut attempt = 0;

        loop {
            let transcript = state.transcript();
            let call = self
                .llm
                .chat_with_tools(SYSTEM_PROMPT, &transcript, &tools, ToolChoice::Auto);
            let response = match tokio::time::timeout_at(deadline, call).await {
                Ok(response) => response?,
                Err(_) => {
                    warn!(request_id = %state.request_id, "deadline expired during reasoning");
                    return Err(OrchestratorError::DeadlineExceeded {
                        deadline_ms: self.config.request_deadline.as_millis(),
                    });
                }
            };

            match response {
                LlmResponse::Text(text) => return Ok(PlannerStep::FinalAnswer(text)),
                LlmResponse::ToolCalls(calls) => {
                    match self.parse_invocations(&calls, state) {
                        Ok(invocations) => return Ok(PlannerStep::Invocations(invocations)),
                        Err(err @ OrchestratorError::SchemaViolation { .. }) if attempt == 0 => {
                            attempt += 1;
                            warn!(error = %err, "invocation rejected, re-requesting once");
                            state.push_system_note(format!(
                                "Invocation rejected: {err}. Re-emit the tool calls with corrected fields."
                            ));
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    fn parse_invocations(
        &self,
        calls: &[ToolCall],
        state: &ConversationState,
    ) -> Result<Vec<CapabilityInvocation>> {
        calls
            .iter()
            .map(|call| {
                self.registry.validate_call(call)?;
                CapabilityInvocation::from_tool_call(call, state.working())
            })
            .collect()
    }
}

/// Builder wiring the loop's collaborators together
pub struct OrchestratorBuilder {
    llm: Option<Arc<dyn LlmClient>>,
    registry: CapabilityRegistry,
    capabilities: Vec<Arc<dyn crate::capability::CapabilityExecutor>>,
    embedder: Option<Arc<dyn crate::resolver::Embedder>>,
    candidates: Option<Arc<dyn crate::resolver::CandidateSource>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            llm: None,
            registry: CapabilityRegistry::with_default_capabilities(),
            capabilities: Vec::new(),
            embedder: None,
            candidates: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Use the Anthropic client configured from environment variables
    pub fn llm_from_env(mut self) -> anyhow::Result<Self> {
        self.llm = Some(Arc::new(crate::llm::AnthropicClient::from_env()?));
        Ok(self)
    }

    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn capability(mut self, capability: Arc<dyn crate::capability::CapabilityExecutor>) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn crate::resolver::Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn candidate_source(
        mut self,
        candidates: Arc<dyn crate::resolver::CandidateSource>,
    ) -> Self {
        self.candidates = Some(candidates);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> anyhow::Result<PlanningLoop> {
        let llm = self
            .llm
            .ok_or_else(|| anyhow::anyhow!("no LLM client configured"))?;
        let embedder = self
            .embedder
            .ok_or_else(|| anyhow::anyhow!("no embedder configured"))?;
        let candidates = self
            .candidates
            .ok_or_else(|| anyhow::anyhow!("no candidate source configured"))?;

        let resolver = Arc::new(crate::resolver::AccountResolver::new(
            embedder,
            candidates,
            self.config.resolver.clone(),
        ));
        let executor =
            DependencyAwareExecutor::new(self.capabilities, resolver, self.config.clone());

        Ok(PlanningLoop::new(llm, self.registry, executor, self.config))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityExecutor;
    use crate::config::ResolverConfig;
    use crate::resolver::{AccountResolver, AccountRef, CandidateSource, Embedder};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Reasoning double that replays a fixed script of responses
    struct ScriptedLlm {
        script: Mutex<Vec<LlmResponse>>,
    }

    impl ScriptedLlm {
        fn new(mut responses: Vec<LlmResponse>) -> Self {
            responses.reverse();
            Self {
                script: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat_with_tools(
            &self,
            _system: &str,
            _transcript: &str,
            _tools: &[crate::llm::ToolDefinition],
            _choice: ToolChoice,
        ) -> anyhow::Result<LlmResponse> {
            self.script
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        fn provider_name(&self) -> &str {
            "test"
        }
    }

    struct NullEmbedder;

    #[async_trait]
    impl Embedder for NullEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct NoCandidates;

    #[async_trait]
    impl CandidateSource for NoCandidates {
        async fn visible_accounts(
            &self,
            _ctx: &AccessControlContext,
        ) -> anyhow::Result<Vec<AccountRef>> {
            Ok(vec![])
        }
    }

    struct EchoCapability;

    #[async_trait]
    impl CapabilityExecutor for EchoCapability {
        fn name(&self) -> &str {
            "structured_data_query"
        }

        async fn execute(
            &self,
            invocation: &CapabilityInvocation,
            _scope: &AccessControlContext,
        ) -> anyhow::Result<ExecutionResult> {
            Ok(ExecutionResult::ok(
                invocation.capability.clone(),
                vec!["account_id".into()],
                vec![json!({"account_id": "acct-1"})],
            ))
        }
    }

    fn planning_loop_with(llm: Arc<dyn LlmClient>, config: OrchestratorConfig) -> PlanningLoop {
        let resolver = Arc::new(AccountResolver::new(
            Arc::new(NullEmbedder),
            Arc::new(NoCandidates),
            ResolverConfig::default(),
        ));
        let executor = DependencyAwareExecutor::new(
            vec![Arc::new(EchoCapability)],
            resolver,
            config.clone(),
        );
        PlanningLoop::new(
            llm,
            CapabilityRegistry::with_default_capabilities(),
            executor,
            config,
        )
    }

    fn planning_loop(responses: Vec<LlmResponse>) -> PlanningLoop {
        planning_loop_with(
            Arc::new(ScriptedLlm::new(responses)),
            OrchestratorConfig::default(),
        )
    }

    fn identity() -> CallerIdentity {
        CallerIdentity {
            caller_id: "user-1".to_string(),
            allowed_account_ids: vec!["acct-1".to_string()],
            row_filters: vec![],
        }
    }

    fn query_call() -> ToolCall {
        ToolCall {
            name: "structured_data_query".to_string(),
            arguments: json!({
                "query": "open opportunities",
                "accounts_mentioned": null
            }),
        }
    }

    #[tokio::test]
    async fn test_immediate_final_answer() {
        let planner = planning_loop(vec![LlmResponse::Text("No data needed.".into())]);
        let envelope = planner.run("hi", &identity()).await.unwrap();
        assert_eq!(envelope.rounds_used, 1);
        assert!(envelope.citations.is_empty());
        assert_eq!(envelope.answer, "No data needed.");
    }

    #[tokio::test]
    async fn test_one_round_then_answer_carries_citations() {
        let planner = planning_loop(vec![
            LlmResponse::ToolCalls(vec![query_call()]),
            LlmResponse::Text("Found one opportunity.".into()),
        ]);
        let envelope = planner.run("what's open?", &identity()).await.unwrap();
        assert_eq!(envelope.rounds_used, 2);
        assert_eq!(envelope.citations.len(), 1);
        assert_eq!(envelope.citations[0].locator, "acct-1");
        assert!(envelope.answer.contains("Sources:"));
    }

    #[tokio::test]
    async fn test_round_budget_exhaustion_is_structured() {
        // Always proposes another invocation; must terminate, not hang.
        let proposals: Vec<LlmResponse> = (0..10)
            .map(|_| LlmResponse::ToolCalls(vec![query_call()]))
            .collect();
        let planner = planning_loop(proposals);
        let err = planner.run("loop forever", &identity()).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::RoundBudgetExceeded { rounds: 6 }
        ));
    }

    #[tokio::test]
    async fn test_schema_violation_rerequested_once() {
        let bad_call = ToolCall {
            name: "structured_data_query".to_string(),
            arguments: json!({"query": "missing mentions"}),
        };
        // First proposal malformed, corrected on the re-request.
        let planner = planning_loop(vec![
            LlmResponse::ToolCalls(vec![bad_call.clone()]),
            LlmResponse::ToolCalls(vec![query_call()]),
            LlmResponse::Text("Done.".into()),
        ]);
        let envelope = planner.run("q", &identity()).await.unwrap();
        assert_eq!(envelope.rounds_used, 2);
    }

    /// Reasoning double that never answers within any sane deadline
    struct StallingLlm;

    #[async_trait]
    impl LlmClient for StallingLlm {
        async fn chat_with_tools(
            &self,
            _system: &str,
            _transcript: &str,
            _tools: &[crate::llm::ToolDefinition],
            _choice: ToolChoice,
        ) -> anyhow::Result<LlmResponse> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(LlmResponse::Text("too late".into()))
        }

        fn model_name(&self) -> &str {
            "stalling"
        }

        fn provider_name(&self) -> &str {
            "test"
        }
    }

    #[tokio::test]
    async fn test_request_deadline_bounds_reasoning_call() {
        let config = OrchestratorConfig {
            request_deadline: std::time::Duration::from_millis(50),
            ..OrchestratorConfig::default()
        };
        let planner = planning_loop_with(Arc::new(StallingLlm), config);
        let err = planner.run("q", &identity()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn test_schema_violation_twice_fails_round() {
        let bad_call = ToolCall {
            name: "structured_data_query".to_string(),
            arguments: json!({"query": "missing mentions"}),
        };
        let planner = planning_loop(vec![
            LlmResponse::ToolCalls(vec![bad_call.clone()]),
            LlmResponse::ToolCalls(vec![bad_call]),
        ]);
        let err = planner.run("q", &identity()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::SchemaViolation { .. }));
    }
}
