//! Access-Control Context Propagator
//!
//! Builds an immutable scoping object per request from the caller's resolved
//! identity and injects it into every downstream invocation. Scoping is
//! applied identically regardless of which capability is targeted; the one
//! allowed exception is the explicitly configured unscoped capability, which
//! is logged every time it is exercised.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::invocation::{CapabilityInvocation, ExecutionResult};

/// Row fields that carry account identifiers subject to the allowed set.
/// Document locators (`locator`, `document_id`) are not account ids; those
/// are scoped at fetch time by the capability back ends.
const ENTITY_ID_FIELDS: &[&str] = &["account_id", "id"];

/// Caller identity as resolved from the authentication boundary
///
/// Token validation itself is external; this is its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub caller_id: String,
    pub allowed_account_ids: Vec<String>,
    #[serde(default)]
    pub row_filters: Vec<RowFilter>,
}

/// Serializable row-level predicate injected into scoped queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub op: String,
    pub value: Value,
}

/// Immutable per-request scoping object
///
/// Built once per request, shared read-only by every downstream call, never
/// mutated mid-request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessControlContext {
    pub caller_id: String,
    allowed_account_ids: BTreeSet<String>,
    row_filters: Vec<RowFilter>,
}

impl AccessControlContext {
    /// Build the scoping context from caller identity
    pub fn build(identity: &CallerIdentity) -> Self {
        Self {
            caller_id: identity.caller_id.clone(),
            allowed_account_ids: identity.allowed_account_ids.iter().cloned().collect(),
            row_filters: identity.row_filters.clone(),
        }
    }

    pub fn is_allowed(&self, account_id: &str) -> bool {
        self.allowed_account_ids.contains(account_id)
    }

    pub fn allowed_account_ids(&self) -> impl Iterator<Item = &str> {
        self.allowed_account_ids.iter().map(|s| s.as_str())
    }

    pub fn row_filters(&self) -> &[RowFilter] {
        &self.row_filters
    }

    /// Return an invocation augmented with the caller's allowed-identifier
    /// set and row filters
    ///
    /// When the targeted capability is the configured unscoped exception,
    /// the invocation passes through untouched and the bypass is logged.
    pub fn scope_invocation(
        &self,
        invocation: &CapabilityInvocation,
        unscoped_capability: Option<&str>,
    ) -> CapabilityInvocation {
        if unscoped_capability == Some(invocation.capability.as_str()) {
            warn!(
                capability = %invocation.capability,
                caller = %self.caller_id,
                "access-control scoping bypassed for configured unscoped capability"
            );
            return invocation.clone();
        }

        let mut scoped = invocation.clone();
        let allowed: Vec<Value> = self
            .allowed_account_ids
            .iter()
            .map(|id| Value::String(id.clone()))
            .collect();
        scoped
            .bindings
            .insert("allowed_account_ids".to_string(), Value::Array(allowed));
        scoped.bindings.insert(
            "row_filters".to_string(),
            serde_json::to_value(&self.row_filters).unwrap_or(Value::Array(Vec::new())),
        );
        scoped
    }

    /// RBAC invariant check on an executed result
    ///
    /// Every entity identifier appearing in the sample rows, whichever field
    /// carries it, must be in the caller's allowed set. A violating result is
    /// discarded by the executor before folding; the caller never sees it.
    pub fn check_result(&self, result: &ExecutionResult) -> Result<()> {
        for row in &result.sample_rows {
            for field in ENTITY_ID_FIELDS {
                if let Some(id) = row.get(*field).and_then(|v| v.as_str()) {
                    if !self.is_allowed(id) {
                        return Err(OrchestratorError::AccessControlViolation {
                            capability: result.source.clone(),
                            entity_id: id.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
