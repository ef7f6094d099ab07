use std::future::Future;
use std::pin::Pin;

use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::agent::history::{Speaker, Turn};

/// Language-model collaborator: produces one reply given the conversation so
/// far. Failures propagate to the caller of the message-handling loop; the
/// core does not retry.
pub trait ChatModel: Send + Sync {
    fn prompt_conversation<'a>(
        &'a self,
        history: Vec<Turn>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;
}

/// Minimal config for an Ollama-style `POST /api/generate` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Full endpoint URL, e.g. `http://127.0.0.1:11434/api/generate`.
    pub endpoint: String,
    pub model: String,
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

pub struct OllamaChat {
    cfg: OllamaConfig,
    client: Client,
}

impl OllamaChat {
    pub fn new(cfg: OllamaConfig) -> Self {
        Self {
            cfg,
            client: Client::new(),
        }
    }
}

/// Flattens the conversation into a single prompt. The heavier prompt
/// formatting (persona, examples) lives outside the core.
pub fn flatten_history(history: &[Turn]) -> String {
    let mut out = String::new();
    for turn in history {
        let who = match &turn.speaker {
            Speaker::System => "[system]",
            Speaker::Agent => "[you]",
            Speaker::Player(name) => name.as_str(),
        };
        out.push_str(who);
        out.push_str(": ");
        out.push_str(&turn.content);
        out.push('\n');
    }
    out.push_str("[you]: ");
    out
}

impl ChatModel for OllamaChat {
    fn prompt_conversation<'a>(
        &'a self,
        history: Vec<Turn>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let request = OllamaRequest {
                model: self.cfg.model.clone(),
                prompt: flatten_history(&history),
                stream: false,
            };

            let res = self
                .client
                .post(&self.cfg.endpoint)
                .json(&request)
                .send()
                .await
                .context("llm request failed")?
                .error_for_status()
                .context("llm non-2xx response")?
                .json::<OllamaResponse>()
                .await
                .context("llm response decode failed")?;

            Ok(res.response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_labels_speakers() {
        let history = vec![
            Turn::new(Speaker::Player("steve".into()), "hello"),
            Turn::new(Speaker::Agent, "hi"),
            Turn::system("note"),
        ];
        let flat = flatten_history(&history);
        assert!(flat.contains("steve: hello"));
        assert!(flat.contains("[you]: hi"));
        assert!(flat.contains("[system]: note"));
        assert!(flat.ends_with("[you]: "));
    }
}
