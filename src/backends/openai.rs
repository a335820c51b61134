//! OpenAI-compatible chat completions backend.
//!
//! Speaks `POST {base}/chat/completions` and probes `GET {base}/models`.
//! The API key is optional (local endpoints like Ollama run without one)
//! and is held as a [`SecretString`] so it never appears in debug output.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::{Completion, CompletionRequest, InvokeError, Provider, ProviderSpec};

pub struct OpenAiCompatible {
    spec: ProviderSpec,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    client: Client,
}

impl OpenAiCompatible {
    pub fn new(
        spec: ProviderSpec,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
        client: Client,
    ) -> Self {
        Self {
            spec,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            client,
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    fn upstream_error(&self, message: impl Into<String>) -> InvokeError {
        InvokeError::Upstream {
            provider: self.spec.name.clone(),
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl Provider for OpenAiCompatible {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    async fn invoke(&self, request: &CompletionRequest) -> Result<Completion, InvokeError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.upstream_error(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(self.upstream_error(format!(
                "status {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| InvokeError::InvalidResponse {
                provider: self.spec.name.clone(),
                message: format!("malformed completion payload: {e}"),
            })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InvokeError::InvalidResponse {
                provider: self.spec.name.clone(),
                message: "response contained no choices".into(),
            })?;

        let usage = parsed.usage.unwrap_or_default();
        Ok(Completion {
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        match self.authorized(self.client.get(&url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = %self.spec.name, error = %e, "health probe failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for OpenAiCompatible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatible")
            .field("name", &self.spec.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}
