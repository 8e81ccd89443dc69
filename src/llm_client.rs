//! OpenAI-compatible chat-completions client behind the `Generator` seam.
//!
//! Failures never cross this boundary as errors: configuration and
//! transport problems come back as short diagnostic reply text, so the
//! pipeline above only ever sees strings.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::prompting::ReplyMode;

#[derive(Debug, Clone, Copy)]
pub struct GenerationMeta {
    pub is_direct: bool,
    pub reply_mode: ReplyMode,
}

/// The single generation entry point the agent loop and router depend on.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a reply for `content` under `system_prompt`. Failures are
    /// surfaced as diagnostic text, never as an error.
    async fn generate(&self, system_prompt: &str, content: &str, meta: &GenerationMeta) -> String;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Clone)]
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    async fn try_generate(&self, system_prompt: &str, content: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'));

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: content.to_string(),
                },
            ],
            temperature: 0.7,
        };

        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

#[async_trait]
impl Generator for LlmClient {
    async fn generate(&self, system_prompt: &str, content: &str, _meta: &GenerationMeta) -> String {
        if content.trim().is_empty() {
            return "输入不能为空。".to_string();
        }
        if self.config.api_url.trim().is_empty() {
            return "未配置 LLM API 地址（PERK_LLM_API_URL）。".to_string();
        }

        match self.try_generate(system_prompt, content).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("LLM generation failed: {:#}", e);
                format!("LLM API 请求失败: {}", e)
            }
        }
    }
}
