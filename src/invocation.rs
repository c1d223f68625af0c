//! Invocation and result contracts
//!
//! Wire shapes shared between the planning loop, the executor, and the
//! external capability implementations. Caller-asserted mentions
//! (`accounts_mentioned`) and system-discovered identifiers
//! (`accounts_filter`) live in separate fields and are never conflated;
//! construction enforces that separation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::WorkingContext;
use crate::error::{OrchestratorError, Result};
use crate::llm::ToolCall;

/// Hard cap on rows carried in a result summary, keeping folded context
/// bounded across rounds
pub const MAX_SAMPLE_ROWS: usize = 10;

/// A single proposed capability invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInvocation {
    /// Capability name from the registry; carried by the tool-call name, so
    /// absent from the arguments object
    #[serde(default)]
    pub capability: String,
    /// Free-text instruction for the capability
    pub query: String,
    /// Named parameters; values of the form "$key" reference WorkingContext
    #[serde(default)]
    pub bindings: serde_json::Map<String, Value>,
    /// Literal text spans from the user's current turn; None when unscoped
    pub accounts_mentioned: Option<Vec<String>>,
    /// Identifiers discovered in a prior round
    #[serde(default)]
    pub accounts_filter: Vec<String>,
}

impl CapabilityInvocation {
    /// Build an invocation from a validated tool call
    ///
    /// Enforces the hard contract on the reasoning capability's output:
    /// `accounts_mentioned` must be present (null allowed), and it must not
    /// contain identifiers the system discovered in a prior round.
    pub fn from_tool_call(call: &ToolCall, working: &WorkingContext) -> Result<Self> {
        let args = call.arguments.as_object().ok_or_else(|| {
            OrchestratorError::schema(format!(
                "capability '{}' arguments must be a JSON object",
                call.name
            ))
        })?;

        if !args.contains_key("accounts_mentioned") {
            return Err(OrchestratorError::schema(format!(
                "capability '{}' invocation missing 'accounts_mentioned'",
                call.name
            )));
        }

        let mut invocation: CapabilityInvocation =
            serde_json::from_value(Value::Object(args.clone())).map_err(|e| {
                OrchestratorError::schema(format!(
                    "capability '{}' arguments malformed: {}",
                    call.name, e
                ))
            })?;
        invocation.capability = call.name.clone();

        if let Some(mentions) = &invocation.accounts_mentioned {
            let discovered = working.discovered_account_ids();
            if let Some(mixed) = mentions.iter().find(|m| discovered.contains(m.as_str())) {
                return Err(OrchestratorError::schema(format!(
                    "capability '{}' mixed discovered identifier '{}' into accounts_mentioned; use accounts_filter",
                    call.name, mixed
                )));
            }
        }

        Ok(invocation)
    }

    /// WorkingContext keys this invocation's bindings reference as "$key",
    /// at any nesting depth
    pub fn binding_references(&self) -> Vec<&str> {
        let mut references = Vec::new();
        for value in self.bindings.values() {
            collect_references(value, &mut references);
        }
        references
    }
}

fn collect_references<'a>(value: &'a Value, references: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => {
            if let Some(key) = s.strip_prefix('$') {
                references.push(key);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, references);
            }
        }
        Value::Object(map) => {
            for nested in map.values() {
                collect_references(nested, references);
            }
        }
        _ => {}
    }
}

impl Default for CapabilityInvocation {
    fn default() -> Self {
        Self {
            capability: String::new(),
            query: String::new(),
            bindings: serde_json::Map::new(),
            accounts_mentioned: None,
            accounts_filter: Vec::new(),
        }
    }
}

/// Failure classification for an executed invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The invocation exceeded its per-invocation timeout
    Timeout,
    /// The external capability reported a failure
    Upstream,
    /// The request deadline cancelled the invocation before completion
    Cancelled,
    /// The result was discarded by the access-control check
    AccessDenied,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Upstream => "upstream",
            Self::Cancelled => "cancelled",
            Self::AccessDenied => "access_denied",
        };
        f.write_str(s)
    }
}

/// Error payload carried inside a failed result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

/// Outcome of one capability invocation
///
/// Carries a bounded sample of rows, never the full result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub row_count: usize,
    pub error: Option<ExecutionError>,
    pub columns: Vec<String>,
    pub sample_rows: Vec<Value>,
    /// Name of the capability that produced this result
    pub source: String,
}

impl ExecutionResult {
    /// Successful result; the sample is truncated here, row_count keeps the
    /// full count
    pub fn ok(source: impl Into<String>, columns: Vec<String>, rows: Vec<Value>) -> Self {
        let row_count = rows.len();
        let mut sample_rows = rows;
        sample_rows.truncate(MAX_SAMPLE_ROWS);
        Self {
            success: true,
            row_count,
            error: None,
            columns,
            sample_rows,
            source: source.into(),
        }
    }

    /// Failed result with zero rows
    pub fn failed(
        source: impl Into<String>,
        kind: ExecutionErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            row_count: 0,
            error: Some(ExecutionError {
                kind,
                message: message.into(),
            }),
            columns: Vec::new(),
            sample_rows: Vec::new(),
            source: source.into(),
        }
    }
}
