//! Account Copilot - agentic question answering over business accounts
//!
//! Orchestrates two external retrieval capabilities (structured data and
//! relationship graph) behind a run-until-done planning loop:
//!
//! ```text
//! Caller request
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  AccessControlContext (built once)      │
//! └─────────────────────────────────────────┘
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  PlanningLoop round N                   │
//! │  transcript + schemas → LLM             │
//! │  → final answer | proposed invocations  │
//! └─────────────────────────────────────────┘
//!       │ invocations
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  DependencyAwareExecutor                │
//! │  independents concurrent, dependents    │
//! │  sequential; AccountResolver as needed  │
//! └─────────────────────────────────────────┘
//!       │ results folded as one turn
//!       ▼
//!   ... repeat until final answer ...
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  Citation Composer → AnswerEnvelope     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The retrieval back ends, the embedding model, and persistence are
//! external collaborators behind the [`capability::CapabilityExecutor`],
//! [`resolver::Embedder`], and [`resolver::CandidateSource`] seams.

pub mod capability;
pub mod citations;
pub mod config;
pub mod conversation;
pub mod error;
pub mod executor;
pub mod invocation;
pub mod llm;
pub mod planner;
pub mod registry;
pub mod resolver;
pub mod scope;

pub use capability::CapabilityExecutor;
pub use citations::{compose, Citation};
pub use config::{OrchestratorConfig, ResolverConfig};
pub use conversation::{ConversationState, Role, Turn, WorkingContext};
pub use error::{OrchestratorError, Result};
pub use executor::{classify, DependencyAwareExecutor, ExecutionPlan};
pub use invocation::{
    CapabilityInvocation, ExecutionError, ExecutionErrorKind, ExecutionResult, MAX_SAMPLE_ROWS,
};
pub use llm::{AnthropicClient, LlmClient, LlmResponse, ToolCall, ToolChoice, ToolDefinition};
pub use planner::{AnswerEnvelope, OrchestratorBuilder, PlannerStep, PlanningLoop};
pub use registry::{CapabilityRegistry, CapabilitySchema};
pub use resolver::{
    AccountRef, AccountResolver, CandidateSource, Embedder, EntityCandidate, ResolutionOutcome,
};
pub use scope::{AccessControlContext, CallerIdentity, RowFilter};
