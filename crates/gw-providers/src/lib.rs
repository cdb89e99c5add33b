//! Direct completion path (C7): a process-wide, persistently-initialized
//! HTTP client to the upstream provider. No tool/agent/skill semantics —
//! that capability lives only on the subprocess path (gw-pool/gw-orchestrator).

use async_trait::async_trait;
use gw_types::{ModelAlias, Usage};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectPathError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream response missing expected field: {0}")]
    MalformedResponse(String),
    #[error("no direct-path client configured")]
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Maps a provider-agnostic alias to the concrete upstream model identifier.
pub fn resolve_model_name(alias: ModelAlias) -> &'static str {
    match alias {
        ModelAlias::Haiku => "claude-haiku-4-5",
        ModelAlias::Sonnet => "claude-sonnet-4-5",
        ModelAlias::Opus => "claude-opus-4-1",
    }
}

#[async_trait]
pub trait DirectProvider: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        model: ModelAlias,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<Completion, DirectPathError>;
}

/// Production implementation: one `reqwest::Client` built once at startup
/// and shared across every request on this path (no per-request client
/// construction, no connection-pool churn).
pub struct MessagesApiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl MessagesApiProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl DirectProvider for MessagesApiProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        model: ModelAlias,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<Completion, DirectPathError> {
        let model_name = resolve_model_name(model);
        let mut body = json!({
            "model": model_name,
            "max_tokens": max_tokens.unwrap_or(1024),
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
        });
        if let Some(temperature) = temperature {
            body["temperature"] = json!(temperature);
        }

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", "2023-06-01")
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let value: serde_json::Value = response.json().await?;

        let text = value
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|block| block.get("text"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| DirectPathError::MalformedResponse("content[0].text".to_string()))?
            .to_string();

        let usage = value
            .get("usage")
            .map(|u| Usage {
                input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(Completion {
            text,
            model: model_name.to_string(),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_alias_maps_to_stable_names() {
        assert_eq!(resolve_model_name(ModelAlias::Haiku), "claude-haiku-4-5");
        assert_eq!(resolve_model_name(ModelAlias::Sonnet), "claude-sonnet-4-5");
        assert_eq!(resolve_model_name(ModelAlias::Opus), "claude-opus-4-1");
    }

    struct EchoProvider;

    #[async_trait]
    impl DirectProvider for EchoProvider {
        async fn complete(
            &self,
            messages: Vec<ChatMessage>,
            model: ModelAlias,
            _max_tokens: Option<u32>,
            _temperature: Option<f32>,
        ) -> Result<Completion, DirectPathError> {
            Ok(Completion {
                text: messages.last().map(|m| m.content.clone()).unwrap_or_default(),
                model: resolve_model_name(model).to_string(),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }
    }

    #[tokio::test]
    async fn trait_object_dispatch_works_for_a_fake_provider() {
        let provider: Box<dyn DirectProvider> = Box::new(EchoProvider);
        let out = provider
            .complete(
                vec![ChatMessage {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                }],
                ModelAlias::Sonnet,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.text, "hi");
        assert_eq!(out.usage.input_tokens, 10);
    }
}
