//! Citation Composer
//!
//! Walks executed results in the order they were folded, extracts row and
//! document identifiers, deduplicates by locator, and appends a citation
//! list to the final answer. An answer synthesized with zero non-empty
//! results carries an empty list; the composer never rewrites the answer's
//! claims, it only attaches provenance.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::invocation::ExecutionResult;

/// Row-level identifier fields recognized as locators, in priority order
const LOCATOR_FIELDS: &[&str] = &["locator", "document_id", "account_id", "id"];

/// One provenance entry attached to an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Capability that produced the cited row
    pub source: String,
    /// Row key or document locator
    pub locator: String,
}

/// Compose the final answer with its citation list
///
/// Returns the answer text (with a sources section appended when any
/// citations exist) and the deduplicated citations in fold order.
pub fn compose(draft: &str, results: &[ExecutionResult]) -> (String, Vec<Citation>) {
    let mut citations: Vec<Citation> = Vec::new();

    for result in results.iter().filter(|r| r.success && r.row_count > 0) {
        for row in &result.sample_rows {
            if let Some(locator) = extract_locator(row) {
                let citation = Citation {
                    source: result.source.clone(),
                    locator,
                };
                if !citations.contains(&citation) {
                    citations.push(citation);
                }
            }
        }
    }

    if citations.is_empty() {
        return (draft.to_string(), citations);
    }

    let mut answer = String::from(draft);
    answer.push_str("\n\nSources:\n");
    for citation in &citations {
        answer.push_str(&format!("- {} ({})\n", citation.locator, citation.source));
    }

    (answer, citations)
}

fn extract_locator(row: &Value) -> Option<String> {
    LOCATOR_FIELDS
        .iter()
        .filter_map(|field| row.get(field))
        .find_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::ExecutionErrorKind;
    use serde_json::json;

    #[test]
    fn test_compose_collects_and_dedupes_locators() {
        let results = vec![
            ExecutionResult::ok(
                "relationship_graph_query",
                vec!["account_id".into()],
                vec![
                    json!({"account_id": "acct-1"}),
                    json!({"account_id": "acct-2"}),
                    json!({"account_id": "acct-1"}),
                ],
            ),
            ExecutionResult::ok(
                "structured_data_query",
                vec!["document_id".into()],
                vec![json!({"document_id": "doc-9"})],
            ),
        ];

        let (answer, citations) = compose("Two related accounts found.", &results);
        assert_eq!(citations.len(), 3);
        assert_eq!(citations[0].locator, "acct-1");
        assert_eq!(citations[1].locator, "acct-2");
        assert_eq!(citations[2].source, "structured_data_query");
        assert!(answer.contains("Sources:"));
        assert!(answer.contains("doc-9"));
    }

    #[test]
    fn test_zero_results_means_zero_citations() {
        let (answer, citations) = compose("I could not retrieve any data.", &[]);
        assert!(citations.is_empty());
        assert!(!answer.contains("Sources:"));
    }

    #[test]
    fn test_failed_and_empty_results_not_cited() {
        let results = vec![
            ExecutionResult::failed(
                "structured_data_query",
                ExecutionErrorKind::Timeout,
                "deadline exceeded",
            ),
            ExecutionResult::ok("relationship_graph_query", vec!["account_id".into()], vec![]),
        ];
        let (_, citations) = compose("Nothing came back.", &results);
        assert!(citations.is_empty());
    }

    #[test]
    fn test_locator_field_priority() {
        let row = json!({"id": "row-1", "document_id": "doc-1"});
        assert_eq!(extract_locator(&row), Some("doc-1".to_string()));
    }
}
