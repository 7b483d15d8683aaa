//! Translation and summarization of crawled article text.

use marketfeed_core::data::FetchError;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::TranslationConfig;

/// Environment variable holding the chat-completions API key.
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";

const SYSTEM_PROMPT: &str = "You are a professional financial news translator. \
Always respond with a single valid JSON object and nothing else: no code fences, no commentary.";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Translation {
    /// Korean Markdown rendering of the full article.
    pub translated_content: String,
    /// Three to five plain-text Korean sentences.
    pub summary: String,
}

pub trait Translator: Send + Sync {
    fn translate(&self, title: &str, content: &str) -> Result<Translation, FetchError>;
}

/// Chat-completions backed translator.
pub struct OpenAiTranslator {
    client: reqwest::blocking::Client,
    config: TranslationConfig,
    api_key: String,
}

impl OpenAiTranslator {
    pub fn new(config: TranslationConfig, api_key: String) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FetchError::Translation(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Reads the key from `OPENAI_API_KEY`.
    pub fn from_env(config: TranslationConfig) -> Result<Self, FetchError> {
        let key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| FetchError::Translation(format!("{API_KEY_VAR} is not set")))?;
        Self::new(config, key)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

impl Translator for OpenAiTranslator {
    fn translate(&self, title: &str, content: &str) -> Result<Translation, FetchError> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_prompt(title, content)},
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(format!("translation: {e}"))
                } else {
                    FetchError::NetworkUnreachable(format!("translation: {e}"))
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited { retry_after_secs: None });
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                context: "translation endpoint".into(),
            });
        }

        let chat: ChatResponse = resp
            .json()
            .map_err(|e| FetchError::Translation(format!("unexpected response shape: {e}")))?;
        let text = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| FetchError::Translation("empty completion".into()))?;
        debug!(chars = text.len(), "translation received");
        parse_reply(&text)
    }
}

fn build_prompt(title: &str, content: &str) -> String {
    format!(
        "Process the following English news article.\n\n\
         **Title**: {title}\n\n\
         **Content**:\n{content}\n\n---\n\n\
         Return a JSON object with two fields:\n\
         1. \"translated_content\": the entire article translated into natural Korean, \
         formatted as Markdown (## subheadings, **bold** for key facts, bullet lists for key points, \
         > blockquotes for quotations, numbers kept exact).\n\
         2. \"summary\": a 3-5 sentence plain-text Korean summary.\n"
    )
}

/// Parse the model's JSON reply, tolerating a surrounding code fence.
pub fn parse_reply(text: &str) -> Result<Translation, FetchError> {
    let trimmed = text.trim();
    let json = if trimmed.starts_with("```") {
        let lines: Vec<&str> = trimmed.lines().collect();
        let end = if lines.len() > 1 && lines[lines.len() - 1].trim_start().starts_with("```") {
            lines.len() - 1
        } else {
            lines.len()
        };
        lines[1..end].join("\n")
    } else {
        trimmed.to_string()
    };
    serde_json::from_str(&json).map_err(|e| FetchError::Translation(format!("reply is not valid JSON: {e}")))
}
