//! Error taxonomy for the orchestration core
//!
//! This module provides idiomatic Rust error types using thiserror for
//! better error messages and proper error chain handling.
//!
//! The split matters operationally: capability failures are recovered into
//! the execution batch and surfaced narratively, while schema violations,
//! resolution failures, round-budget exhaustion, and access-control
//! violations abort the current request with a structured error.

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A proposed invocation did not match the declared capability contract,
    /// or mixed caller-asserted mentions with system-discovered identifiers.
    /// Recoverable by a single re-request to the reasoning capability, then
    /// fatal for the round.
    #[error("schema violation: {message}")]
    SchemaViolation { message: String },

    /// Candidate fetch or embedding computation failed inside the entity
    /// resolver. Low confidence is NOT this error; it yields a
    /// disambiguation outcome instead.
    #[error("resolution failure during {stage}: {message}")]
    Resolution { stage: String, message: String },

    /// The planning loop exhausted its round budget without a terminal
    /// answer. Surfaced to the caller as a structured incomplete-answer
    /// response, never a crash.
    #[error("round budget exceeded after {rounds} rounds without a final answer")]
    RoundBudgetExceeded { rounds: usize },

    /// The whole-request deadline expired while awaiting the reasoning
    /// capability. Capability work cut short by the same deadline folds as
    /// cancelled partial results instead of reaching this variant.
    #[error("request deadline of {deadline_ms}ms expired while awaiting the reasoning capability")]
    DeadlineExceeded { deadline_ms: u128 },

    /// A capability result referenced an entity outside the caller's allowed
    /// set. The offending result is discarded before folding.
    #[error("access control violation: capability '{capability}' returned entity '{entity_id}' outside the allowed set")]
    AccessControlViolation {
        capability: String,
        entity_id: String,
    },

    /// The external reasoning capability could not be reached or returned an
    /// unusable response.
    #[error("reasoning capability error: {0}")]
    Llm(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Schema violation from any displayable message
    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            message: message.into(),
        }
    }

    /// Resolution failure tagged with the pipeline stage that failed
    pub fn resolution(stage: &str, message: impl std::fmt::Display) -> Self {
        Self::Resolution {
            stage: stage.to_string(),
            message: message.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, OrchestratorError>;
