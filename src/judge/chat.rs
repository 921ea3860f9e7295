//! OpenAI-compatible chat-completions judge (OpenRouter by default).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{Judge, JudgeError};
use crate::config::{Credentials, JudgeProviderConfig};

const SYSTEM_PROMPT: &str =
    "You evaluate retrieval quality. Follow the requested output format exactly.";

/// Maximum accepted response body, in bytes of message content.
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

#[derive(Debug, Clone)]
pub struct ChatJudge {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: [ApiMessage<'a>; 2],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: Option<String>,
}

impl ChatJudge {
    pub fn new(
        api_key: &str,
        base_url: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
        max_tokens: Option<u32>,
        timeout: Duration,
    ) -> Result<Self, JudgeError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| JudgeError::Config("invalid API key format".to_string()))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| JudgeError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature,
            max_tokens,
            timeout,
        })
    }

    pub fn from_config(
        config: &JudgeProviderConfig,
        credentials: &Credentials<'_>,
    ) -> Result<Self, JudgeError> {
        let api_key = credentials.resolve(&config.api_key_env).ok_or_else(|| {
            JudgeError::Config(format!("{} is not set", config.api_key_env))
        })?;

        Self::new(
            &api_key,
            config.base_url.clone(),
            config.model.clone(),
            config.temperature,
            config.max_tokens,
            Duration::from_secs(config.request_timeout_secs.max(1)),
        )
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> JudgeError {
        if err.is_timeout() {
            JudgeError::Timeout(self.timeout)
        } else {
            JudgeError::Transport(err.to_string())
        }
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|seconds| !seconds.is_nan() && *seconds >= 0.0)
        .map(|seconds| Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
}

fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> JudgeError {
    let message = serde_json::from_str::<ChatApiResponse>(body)
        .ok()
        .and_then(|response| response.error)
        .and_then(|error| error.message)
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status.as_u16() {
        401 | 403 => JudgeError::Auth(message),
        429 => JudgeError::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        408 => JudgeError::Transport(format!("request timeout: {message}")),
        400 | 404 | 413 | 422 => JudgeError::InvalidRequest(message),
        code => JudgeError::Provider {
            status: code,
            message,
            retryable: code >= 500,
        },
    }
}

#[async_trait]
impl Judge for ChatJudge {
    async fn complete(&self, prompt: &str) -> Result<String, JudgeError> {
        let request = ChatApiRequest {
            model: &self.model,
            messages: [
                ApiMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ApiMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(self.chat_url())
            .json(&request)
            .send()
            .await
            .map_err(|err| self.map_transport_error(err))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|err| self.map_transport_error(err))?;

        if !status.is_success() {
            return Err(status_error(status, &headers, &body));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|err| {
            JudgeError::Provider {
                status: status.as_u16(),
                message: format!("malformed completion payload: {err}"),
                retryable: false,
            }
        })?;

        if let Some(message) = parsed.error.and_then(|error| error.message) {
            return Err(JudgeError::Provider {
                status: status.as_u16(),
                message,
                retryable: true,
            });
        }

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(JudgeError::EmptyResponse);
        }
        if content.len() > MAX_RESPONSE_LEN {
            return Err(JudgeError::Provider {
                status: status.as_u16(),
                message: format!("response too large: {} bytes", content.len()),
                retryable: false,
            });
        }

        Ok(content)
    }
}
