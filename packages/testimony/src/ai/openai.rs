//! OpenAI implementation of the [`Reasoner`] trait.
//!
//! Each exploration step and drafting attempt is one chat completion with
//! `response_format: json_object`; replies are parsed by
//! [`crate::pipeline::prompts`].
//!
//! # Example
//!
//! ```rust,ignore
//! use testimony::ai::OpenAiReasoner;
//!
//! let reasoner = OpenAiReasoner::from_env()?.with_model("gpt-4o");
//! let stage = ExtractionStage::new(reasoner, raw, records, ExtractConfig::default())?;
//! ```

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ReasonError, ReasonResult};
use crate::pipeline::prompts::{
    draft_prompt, explore_prompt, parse_action, parse_drafts, DRAFT_SYSTEM, EXPLORE_SYSTEM,
};
use crate::security::ServiceCredentials;
use crate::traits::reasoner::{Action, DraftRequest, ExploreRequest, Reasoner};
use crate::types::record::Draft;

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// OpenAI-backed reasoner.
#[derive(Clone)]
pub struct OpenAiReasoner {
    client: Client,
    credentials: ServiceCredentials,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
    refusal: Option<String>,
}

impl OpenAiReasoner {
    pub fn new(credentials: ServiceCredentials) -> ReasonResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| ReasonError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            credentials,
            model: "gpt-4o".to_string(),
            temperature: 0.0,
        })
    }

    /// Create from environment variable `OPENAI_API_KEY`.
    pub fn from_env() -> crate::error::Result<Self> {
        let credentials = ServiceCredentials::from_env("OPENAI_API_KEY")?;
        Ok(Self::new(credentials)?)
    }

    /// Set the chat model (default: gpt-4o).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, system: &str, user: &str) -> ReasonResult<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let url = format!(
            "{}/chat/completions",
            self.credentials.base_url_or(OPENAI_API_URL)
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.credentials.api_key.expose())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReasonError::Timeout
                } else {
                    ReasonError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(api_error(status, text));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReasonError::Transport(format!("invalid response body: {e}")))?;
        into_reply(chat)
    }
}

/// Map a non-success answer from the API.
fn api_error(status: StatusCode, text: String) -> ReasonError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ReasonError::Unauthorized(format!("OpenAI API {status}: {text}"))
        }
        StatusCode::TOO_MANY_REQUESTS => ReasonError::RateLimited,
        s if s.is_server_error() => ReasonError::Transport(format!("OpenAI API {status}")),
        // A request the API will never accept, such as a prompt over the context window
        _ => ReasonError::Refusal(format!("OpenAI API {status}: {text}")),
    }
}

/// Pull the reply text out of a completion, or say why there is none.
fn into_reply(response: ChatResponse) -> ReasonResult<String> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ReasonError::Transport("no choices returned".to_string()))?;

    if let Some(refusal) = choice.message.refusal {
        return Err(ReasonError::Refusal(refusal));
    }
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(ReasonError::Refusal("content filtered".to_string()));
    }
    match choice.message.content {
        Some(content) if !content.trim().is_empty() => Ok(content),
        _ => Err(ReasonError::Malformed("empty reply".to_string())),
    }
}

#[async_trait]
impl Reasoner for OpenAiReasoner {
    async fn next_action(&self, request: &ExploreRequest<'_>) -> ReasonResult<Action> {
        let reply = self.chat(EXPLORE_SYSTEM, &explore_prompt(request)).await?;
        let action = parse_action(&reply)?;
        tracing::debug!(round = request.round, ?action, "Reasoner chose action");
        Ok(action)
    }

    async fn draft(&self, request: &DraftRequest<'_>) -> ReasonResult<Vec<Draft>> {
        let reply = self.chat(DRAFT_SYSTEM, &draft_prompt(request)).await?;
        parse_drafts(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;

    fn parse(json: &str) -> ChatResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_reply_content() {
        let reply = into_reply(parse(
            r#"{"choices": [{"message": {"role": "assistant", "content": "{\"action\": \"finish\"}"}, "finish_reason": "stop"}]}"#,
        ))
        .unwrap();
        assert_eq!(parse_action(&reply).unwrap(), Action::Finish);
    }

    #[test]
    fn test_refusal_and_empty_reply() {
        let err = into_reply(parse(
            r#"{"choices": [{"message": {"content": null, "refusal": "I can't help with that."}}]}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ReasonError::Refusal(_)));

        let err = into_reply(parse(
            r#"{"choices": [{"message": {"content": ""}, "finish_reason": "stop"}]}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ReasonError::Malformed(_)));

        let err = into_reply(parse(r#"{"choices": []}"#)).unwrap_err();
        assert_eq!(err.class(), FailureClass::Transient);
    }

    #[test]
    fn test_api_status_mapping() {
        assert_eq!(
            api_error(StatusCode::UNAUTHORIZED, String::new()).class(),
            FailureClass::Fatal
        );
        assert!(matches!(
            api_error(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ReasonError::RateLimited
        ));
        assert_eq!(
            api_error(StatusCode::SERVICE_UNAVAILABLE, String::new()).class(),
            FailureClass::Transient
        );
        assert!(matches!(
            api_error(StatusCode::BAD_REQUEST, "context_length_exceeded".into()),
            ReasonError::Refusal(_)
        ));
    }

    #[test]
    fn test_request_shape() {
        let request = ChatRequest {
            model: "gpt-4o",
            messages: [
                ChatMessage {
                    role: "system",
                    content: "s",
                },
                ChatMessage {
                    role: "user",
                    content: "u",
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][1]["role"], "user");
    }
}
