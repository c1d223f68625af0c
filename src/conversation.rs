//! Conversation state
//!
//! The append-only turn transcript plus the WorkingContext accumulator of
//! system-discovered values. Owned exclusively by the planning loop for the
//! duration of one request; worker tasks only produce results, they never
//! write here. Each dispatch/fold cycle appends exactly one synthetic turn,
//! keeping the transcript replayable.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::invocation::{CapabilityInvocation, ExecutionResult};

/// WorkingContext key under which discovered account identifiers accumulate
pub const DISCOVERED_ACCOUNTS_KEY: &str = "discovered_accounts";

/// Speaker role for a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Serialized summary of one executed invocation, retained in the transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub capability: String,
    pub query: String,
    pub success: bool,
    pub row_count: usize,
    pub error: Option<String>,
}

impl InvocationRecord {
    pub fn from_parts(invocation: &CapabilityInvocation, result: &ExecutionResult) -> Self {
        Self {
            capability: invocation.capability.clone(),
            query: invocation.query.clone(),
            success: result.success,
            row_count: result.row_count,
            error: result.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// One turn in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocations: Vec<InvocationRecord>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            invocations: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Round-to-round accumulator of system-discovered values
///
/// Never merged with caller-supplied entity mentions; the separation is what
/// the invocation mixing check enforces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingContext {
    values: BTreeMap<String, Value>,
}

impl WorkingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge account identifiers from an executed result
    ///
    /// Pulls `account_id` fields out of the bounded sample rows and appends
    /// them, deduplicated, under [`DISCOVERED_ACCOUNTS_KEY`].
    pub fn absorb_result(&mut self, result: &ExecutionResult) {
        if !result.success {
            return;
        }
        let ids: Vec<String> = result
            .sample_rows
            .iter()
            .filter_map(|row| row.get("account_id"))
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect();
        if !ids.is_empty() {
            self.push_discovered_accounts(&ids);
        }
    }

    /// Append identifiers under the discovered-accounts key, deduplicated,
    /// preserving first-seen order
    pub fn push_discovered_accounts(&mut self, ids: &[String]) {
        let entry = self
            .values
            .entry(DISCOVERED_ACCOUNTS_KEY.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(existing) = entry {
            for id in ids {
                let already = existing.iter().any(|v| v.as_str() == Some(id.as_str()));
                if !already {
                    existing.push(Value::String(id.clone()));
                }
            }
        }
    }

    /// Account identifiers discovered so far in this request
    pub fn discovered_account_ids(&self) -> BTreeSet<String> {
        self.get(DISCOVERED_ACCOUNTS_KEY)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The full conversation for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub request_id: Uuid,
    turns: Vec<Turn>,
    working: WorkingContext,
}

impl ConversationState {
    /// Start a conversation from the caller's request text
    pub fn new(user_request: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            turns: vec![Turn::user(user_request)],
            working: WorkingContext::new(),
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn working(&self) -> &WorkingContext {
        &self.working
    }

    pub fn working_mut(&mut self) -> &mut WorkingContext {
        &mut self.working
    }

    /// Append a system note (e.g. a schema-violation re-request)
    pub fn push_system_note(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::system(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::assistant(content));
    }

    /// Fold one round of execution back into the transcript
    ///
    /// Appends exactly one synthetic turn summarizing what was invoked and
    /// what came back. Sample rows are already bounded at construction, so
    /// the transcript stays bounded across rounds.
    pub fn fold_round(
        &mut self,
        invocations: &[CapabilityInvocation],
        results: &[ExecutionResult],
    ) {
        let records: Vec<InvocationRecord> = invocations
            .iter()
            .zip(results.iter())
            .map(|(inv, res)| InvocationRecord::from_parts(inv, res))
            .collect();

        let summaries: Vec<Value> = invocations
            .iter()
            .zip(results.iter())
            .map(|(inv, res)| {
                serde_json::json!({
                    "capability": inv.capability,
                    "query": inv.query,
                    "success": res.success,
                    "row_count": res.row_count,
                    "error": res.error.as_ref().map(|e| format!("{}: {}", e.kind, e.message)),
                    "columns": res.columns,
                    "sample_rows": res.sample_rows,
                })
            })
            .collect();

        let content = serde_json::to_string(&Value::Array(summaries))
            .unwrap_or_else(|_| "[]".to_string());

        let mut turn = Turn::system(format!("Execution results: {content}"));
        turn.invocations = records;
        self.turns.push(turn);
    }

    /// Render the transcript for the reasoning capability
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            let role = match turn.role {
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
                Role::System => "SYSTEM",
            };
            out.push_str(role);
            out.push_str(": ");
            out.push_str(&turn.content);
            out.push('\n');
        }
        out
    }
}
