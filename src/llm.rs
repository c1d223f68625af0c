//! LLM Client
//!
//! Unified interface for the external reasoning capability, plus the
//! Anthropic implementation. The contract is fixed within one request: the
//! client receives the full transcript and the declared capability schemas,
//! and answers either with assistant text (terminal) or with named tool
//! calls carrying JSON arguments (non-terminal).

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tool/function definition for structured output
///
/// Rendered from the capability registry's declared schemas; this is exactly
/// what the reasoning capability sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Capability name (e.g., "structured_data_query")
    pub name: String,
    /// Description of what the capability does
    pub description: String,
    /// JSON Schema for the capability's parameters
    pub parameters: serde_json::Value,
}

/// Tool-selection mode for a reasoning call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// Model decides whether to call tools or answer directly
    Auto,
    /// Model must call the named tool
    Forced(String),
    /// Model must answer with plain text
    None,
}

/// A single proposed tool call from the reasoning capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Name of the capability being invoked
    pub name: String,
    /// Structured arguments as JSON
    pub arguments: serde_json::Value,
}

/// Classified reasoning response
#[derive(Debug, Clone)]
pub enum LlmResponse {
    /// Terminal: assistant text forming the final answer draft
    Text(String),
    /// Non-terminal: one or more proposed capability invocations
    ToolCalls(Vec<ToolCall>),
}

/// Unified reasoning-capability interface
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Submit the transcript plus declared tools and classify the response
    async fn chat_with_tools(
        &self,
        system_prompt: &str,
        transcript: &str,
        tools: &[ToolDefinition],
        choice: ToolChoice,
    ) -> Result<LlmResponse>;

    /// Get the model name for logging
    fn model_name(&self) -> &str;

    /// Get the provider name for logging
    fn provider_name(&self) -> &str;
}

/// Default Anthropic model
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Outer bound on one provider round trip; the planning loop applies the
/// whole-request deadline on top of this.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Anthropic Claude API client
#[derive(Clone)]
pub struct AnthropicClient {
    api_key: String,
    client: reqwest::Client,
    model: String,
}

impl AnthropicClient {
    /// Create a new Anthropic client with the given API key
    pub fn new(api_key: String) -> Self {
        let model = std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self {
            api_key,
            client: http_client(),
            model,
        }
    }

    /// Create with a specific model
    pub fn with_model(api_key: String, model: &str) -> Self {
        Self {
            api_key,
            client: http_client(),
            model: model.to_string(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key))
    }

    fn tool_choice_json(choice: &ToolChoice) -> serde_json::Value {
        match choice {
            ToolChoice::Auto => serde_json::json!({"type": "auto"}),
            ToolChoice::Forced(name) => serde_json::json!({"type": "tool", "name": name}),
            ToolChoice::None => serde_json::json!({"type": "none"}),
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn chat_with_tools(
        &self,
        system_prompt: &str,
        transcript: &str,
        tools: &[ToolDefinition],
        choice: ToolChoice,
    ) -> Result<LlmResponse> {
        let tools_json: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&serde_json::json!({
                "model": &self.model,
                "max_tokens": 4096,
                "system": system_prompt,
                "tools": tools_json,
                "tool_choice": Self::tool_choice_json(&choice),
                "messages": [{"role": "user", "content": transcript}]
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Anthropic API error {}: {}", status, body));
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            #[serde(rename = "type")]
            block_type: String,
            text: Option<String>,
            name: Option<String>,
            input: Option<serde_json::Value>,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            content: Vec<ContentBlock>,
        }

        let api_response: ApiResponse = response.json().await?;

        let calls: Vec<ToolCall> = api_response
            .content
            .iter()
            .filter(|b| b.block_type == "tool_use")
            .filter_map(|b| {
                Some(ToolCall {
                    name: b.name.clone()?,
                    arguments: b.input.clone()?,
                })
            })
            .collect();

        if !calls.is_empty() {
            return Ok(LlmResponse::ToolCalls(calls));
        }

        let text = api_response
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.clone())
            .collect::<Vec<_>>()
            .join("\n");

        if text.is_empty() {
            return Err(anyhow!("Empty response from Anthropic"));
        }

        Ok(LlmResponse::Text(text))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "Anthropic"
    }
}
