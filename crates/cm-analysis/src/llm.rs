use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use cm_core::config::optional_env;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Model,
}

impl TurnRole {
    fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmTurn {
    pub role: TurnRole,
    pub text: String,
}

impl LlmTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Model,
            text: text.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm provider is disabled")]
    Disabled,
    #[error("llm request timed out after {0:?}")]
    Timeout(Duration),
    #[error("llm provider returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("llm response contained no text")]
    EmptyResponse,
    #[error(transparent)]
    Transport(reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: String,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl LlmSettings {
    pub fn from_env() -> Self {
        let api_key = optional_env("GEMINI_API_KEY");
        let provider = optional_env("LLM_PROVIDER").unwrap_or_else(|| {
            if api_key.is_some() {
                "gemini".to_string()
            } else {
                "disabled".to_string()
            }
        });
        Self {
            provider,
            api_key,
            model: optional_env("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            base_url: optional_env("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }

    async fn generate(&self, turns: &[LlmTurn], timeout: Duration) -> Result<String, LlmError> {
        let contents: Vec<Value> = turns
            .iter()
            .map(|turn| json!({ "role": turn.role.as_str(), "parts": [{ "text": turn.text }] }))
            .collect();
        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .timeout(timeout)
            .json(&json!({ "contents": contents }))
            .send()
            .await
            .map_err(|err| transport_error(err, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                message: upstream_message(&raw),
            });
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| transport_error(err, timeout))?;
        candidate_text(&body).ok_or(LlmError::EmptyResponse)
    }
}

/// Gateways in front of the model answer errors with HTML or plain text as
/// often as with the JSON error envelope.
fn upstream_message(raw: &str) -> String {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|body| {
            body.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                "request failed".to_string()
            } else {
                trimmed.chars().take(200).collect()
            }
        })
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(timeout)
    } else {
        LlmError::Transport(err)
    }
}

fn candidate_text(body: &Value) -> Option<String> {
    let parts = body.pointer("/candidates/0/content/parts")?.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[derive(Clone)]
pub enum LlmProviderKind {
    Disabled,
    Gemini(GeminiClient),
}

impl LlmProviderKind {
    pub fn source(&self) -> &'static str {
        match self {
            LlmProviderKind::Disabled => "disabled",
            LlmProviderKind::Gemini(_) => "gemini",
        }
    }

    pub async fn generate(&self, turns: &[LlmTurn], timeout: Duration) -> Result<String, LlmError> {
        match self {
            LlmProviderKind::Disabled => Err(LlmError::Disabled),
            LlmProviderKind::Gemini(client) => client.generate(turns, timeout).await,
        }
    }
}

pub fn build_provider(settings: &LlmSettings) -> Result<LlmProviderKind> {
    match settings.provider.as_str() {
        "gemini" => {
            let api_key = settings
                .api_key
                .clone()
                .ok_or_else(|| anyhow!("GEMINI_API_KEY is required for the gemini provider"))?;
            Ok(LlmProviderKind::Gemini(GeminiClient {
                http: reqwest::Client::builder().build()?,
                api_key,
                model: settings.model.clone(),
                base_url: settings.base_url.clone(),
            }))
        }
        "disabled" => Ok(LlmProviderKind::Disabled),
        other => Err(anyhow!("unsupported LLM_PROVIDER: {other}")),
    }
}
