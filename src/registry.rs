//! Capability Registry
//!
//! Declarative schemas for every invocable capability. Pure lookup, no
//! state. The registry renders the tool definitions the reasoning
//! capability sees, and validates proposed calls against the declared
//! parameter shape before anything is dispatched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{OrchestratorError, Result};
use crate::llm::{ToolCall, ToolDefinition};

/// Declared schema for one capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySchema {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the capability's parameters
    pub parameters: serde_json::Value,
}

/// Registry of invocable capabilities
///
/// BTreeMap keeps schema listing order deterministic for the transcript.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    schemas: BTreeMap<String, CapabilitySchema>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the two retrieval capabilities
    pub fn with_default_capabilities() -> Self {
        let mut registry = Self::new();
        registry.register(structured_data_schema());
        registry.register(relationship_graph_schema());
        registry
    }

    pub fn register(&mut self, schema: CapabilitySchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    pub fn get(&self, name: &str) -> Option<&CapabilitySchema> {
        self.schemas.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.schemas.keys().map(|k| k.as_str()).collect()
    }

    /// Render the declared schemas as tool definitions for the LLM
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.schemas
            .values()
            .map(|s| ToolDefinition {
                name: s.name.clone(),
                description: s.description.clone(),
                parameters: s.parameters.clone(),
            })
            .collect()
    }

    /// Validate a proposed call against the declared contract
    ///
    /// Checks the capability is known, the arguments form a JSON object, and
    /// every field the schema marks required is present. A call failing any
    /// of these is never executed.
    pub fn validate_call(&self, call: &ToolCall) -> Result<()> {
        let schema = self.get(&call.name).ok_or_else(|| {
            OrchestratorError::schema(format!("unknown capability '{}'", call.name))
        })?;

        let args = call.arguments.as_object().ok_or_else(|| {
            OrchestratorError::schema(format!(
                "capability '{}' arguments must be a JSON object",
                call.name
            ))
        })?;

        if let Some(required) = schema.parameters.get("required").and_then(|r| r.as_array()) {
            for field in required.iter().filter_map(|f| f.as_str()) {
                if !args.contains_key(field) {
                    return Err(OrchestratorError::schema(format!(
                        "capability '{}' call missing required field '{}'",
                        call.name, field
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Shared parameter shape for both retrieval capabilities
///
/// `accounts_mentioned` is a hard contract: literal text spans from the
/// user's current turn, null only when the request is unscoped.
/// `accounts_filter` carries identifiers discovered in a prior round and is
/// never mixed with mentions.
fn invocation_parameters(query_description: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": query_description
            },
            "bindings": {
                "type": "object",
                "description": "Named parameters for the query. Reference a value discovered in a prior round as \"$key\". Never interpolate raw values into the query text."
            },
            "accounts_mentioned": {
                "type": ["array", "null"],
                "items": {"type": "string"},
                "description": "Account names exactly as the user wrote them in the current turn. Null if the request is unscoped (e.g. 'across all accounts'). Never put discovered identifiers here."
            },
            "accounts_filter": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Account identifiers discovered in a prior round, used to scope this query."
            }
        },
        "required": ["query", "accounts_mentioned"]
    })
}

fn structured_data_schema() -> CapabilitySchema {
    CapabilitySchema {
        name: "structured_data_query".to_string(),
        description: "Query structured account data: fields, metrics, contacts, opportunities. Returns rows with columns.".to_string(),
        parameters: invocation_parameters(
            "Natural-language instruction describing the structured data to retrieve",
        ),
    }
}

fn relationship_graph_schema() -> CapabilitySchema {
    CapabilitySchema {
        name: "relationship_graph_query".to_string(),
        description: "Traverse the account relationship graph: similar accounts, ownership, shared contacts. Returns related entities with identifiers.".to_string(),
        parameters: invocation_parameters(
            "Natural-language instruction describing the graph traversal to perform",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capabilities_registered() {
        let registry = CapabilityRegistry::with_default_capabilities();
        assert_eq!(
            registry.names(),
            vec!["relationship_graph_query", "structured_data_query"]
        );
        assert!(registry.get("structured_data_query").is_some());
        assert_eq!(registry.tool_definitions().len(), 2);
    }

    #[test]
    fn test_validate_unknown_capability() {
        let registry = CapabilityRegistry::with_default_capabilities();
        let call = ToolCall {
            name: "delete_everything".to_string(),
            arguments: json!({}),
        };
        assert!(registry.validate_call(&call).is_err());
    }

    #[test]
    fn test_validate_missing_required_field() {
        let registry = CapabilityRegistry::with_default_capabilities();
        let call = ToolCall {
            name: "structured_data_query".to_string(),
            arguments: json!({"query": "list open opportunities"}),
        };
        let err = registry.validate_call(&call).unwrap_err();
        assert!(err.to_string().contains("accounts_mentioned"));
    }

    #[test]
    fn test_validate_accepts_null_mentions() {
        let registry = CapabilityRegistry::with_default_capabilities();
        let call = ToolCall {
            name: "structured_data_query".to_string(),
            arguments: json!({
                "query": "total revenue across all accounts",
                "accounts_mentioned": null
            }),
        };
        assert!(registry.validate_call(&call).is_ok());
    }
}
