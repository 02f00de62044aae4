use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::config::Config;
use crate::error::AccessError;

/// Supported upstream providers. Model names resolve to a provider through
/// the explicit prefix table below rather than ad-hoc string tests at call
/// sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
}

const MODEL_PREFIXES: &[(&str, Provider)] = &[
    ("gpt", Provider::OpenAi),
    ("o1", Provider::OpenAi),
    ("claude", Provider::Anthropic),
    ("models/gemini", Provider::Gemini),
    ("gemini", Provider::Gemini),
];

impl Provider {
    pub fn for_model(model: &str) -> Option<Provider> {
        MODEL_PREFIXES
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix))
            .map(|(_, provider)| *provider)
    }

    fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Anthropic => "Anthropic",
            Provider::Gemini => "Gemini",
        }
    }

    /// A slow upstream must not pin a worker; each provider gets an explicit
    /// per-request deadline.
    fn timeout(&self) -> Duration {
        match self {
            Provider::OpenAi => Duration::from_secs(30),
            Provider::Anthropic => Duration::from_secs(15),
            Provider::Gemini => Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub token_count: i64,
}

pub struct ProviderRegistry {
    client: reqwest::Client,
    openai_key: Option<String>,
    anthropic_key: Option<String>,
    gemini_key: Option<String>,
}

impl ProviderRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            openai_key: config.openai_api_key.clone(),
            anthropic_key: config.anthropic_api_key.clone(),
            gemini_key: config.gemini_api_key.clone(),
        }
    }

    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatReply, AccessError> {
        let provider = Provider::for_model(model)
            .ok_or_else(|| AccessError::Validation(format!("Unknown model: {}", model)))?;

        match provider {
            Provider::OpenAi => self.complete_openai(model, messages).await,
            Provider::Anthropic => self.complete_anthropic(model, messages).await,
            Provider::Gemini => self.complete_gemini(model, messages).await,
        }
    }

    fn key_for(&self, provider: Provider) -> Result<&str, AccessError> {
        let key = match provider {
            Provider::OpenAi => &self.openai_key,
            Provider::Anthropic => &self.anthropic_key,
            Provider::Gemini => &self.gemini_key,
        };
        key.as_deref().ok_or_else(|| {
            AccessError::Provider(format!("{} API key not configured", provider.name()))
        })
    }

    async fn complete_openai(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatReply, AccessError> {
        let provider = Provider::OpenAi;
        let key = self.key_for(provider)?;

        let body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": 4000,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(key)
            .json(&body)
            .timeout(provider.timeout())
            .send()
            .await
            .map_err(|e| AccessError::Provider(format!("OpenAI request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AccessError::Provider(format!(
                "OpenAI API HTTP {}",
                response.status()
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AccessError::Provider(e.to_string()))?;

        let content = data
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AccessError::Provider("OpenAI response missing content".to_string()))?
            .to_string();
        let token_count = data
            .pointer("/usage/total_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        Ok(ChatReply {
            content,
            token_count,
        })
    }

    async fn complete_anthropic(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatReply, AccessError> {
        let provider = Provider::Anthropic;
        let key = self.key_for(provider)?;

        let body = json!({
            "model": model,
            "max_tokens": 4000,
            "messages": messages,
        });

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .timeout(provider.timeout())
            .send()
            .await
            .map_err(|e| AccessError::Provider(format!("Anthropic request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AccessError::Provider(format!(
                "Anthropic API HTTP {}",
                response.status()
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AccessError::Provider(e.to_string()))?;

        let content = data
            .pointer("/content/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AccessError::Provider("Anthropic response missing content".to_string())
            })?
            .to_string();
        let input_tokens = data
            .pointer("/usage/input_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let output_tokens = data
            .pointer("/usage/output_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        Ok(ChatReply {
            content,
            token_count: input_tokens + output_tokens,
        })
    }

    async fn complete_gemini(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatReply, AccessError> {
        let provider = Provider::Gemini;
        let key = self.key_for(provider)?;

        let contents: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                let role = if m.role == "assistant" { "model" } else { "user" };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let model_path = model.strip_prefix("models/").unwrap_or(model);
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            model_path
        );

        let response = self
            .client
            .post(&url)
            .query(&[("key", key)])
            .json(&json!({ "contents": contents }))
            .timeout(provider.timeout())
            .send()
            .await
            .map_err(|e| AccessError::Provider(format!("Gemini request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AccessError::Provider(format!(
                "Gemini API HTTP {}",
                response.status()
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AccessError::Provider(e.to_string()))?;

        let content = data
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AccessError::Provider("Gemini response missing content".to_string()))?
            .to_string();
        let token_count = data
            .pointer("/usageMetadata/totalTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        Ok(ChatReply {
            content,
            token_count,
        })
    }
}
