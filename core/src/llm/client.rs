//! HTTP chat client
//!
//! Talks to an OpenAI-compatible chat endpoint. Retries with jittered
//! exponential backoff, honors Retry-After on 429, and observes a
//! cancellation token during waits.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use rand::Rng;
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use super::{ChatModel, ChatRequest, ChatResponse, LlmFailure, StreamEvent};
use crate::config::{ModelConfig, RetryPolicy};

pub struct HttpChatModel {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
    cancellation: CancellationToken,
}

impl HttpChatModel {
    pub fn new(config: &ModelConfig, retry: RetryPolicy) -> Result<Self, LlmFailure> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(300))
            .user_agent("colony/0.2")
            .build()
            .map_err(|e| LlmFailure::ServerDown {
                message: e.to_string(),
            })?;

        let api_key = config
            .api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok());

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            retry,
            cancellation: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self.http.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request.send().await
    }

    /// Issue the request with jittered exponential backoff. 429 waits honor
    /// Retry-After; 5xx and transport errors back off; other statuses return
    /// immediately for classification.
    async fn send_with_backoff(&self, body: &Value) -> Result<reqwest::Response, LlmFailure> {
        let mut attempt = 0;
        let mut delay = self.retry.delay_for_attempt(1).max(Duration::from_millis(100));

        loop {
            if self.cancellation.is_cancelled() {
                return Err(LlmFailure::Timeout);
            }

            match self.post(body).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs);

                        if attempt >= self.retry.max_retries {
                            return Err(LlmFailure::RateLimited { retry_after });
                        }

                        let wait = retry_after.unwrap_or(delay);
                        tracing::warn!(?wait, attempt, "rate limited (429), backing off");
                        self.cancellable_sleep(wait).await?;
                    } else if status.is_server_error() && attempt < self.retry.max_retries {
                        tracing::warn!(%status, attempt, "provider error, retrying");
                        self.cancellable_sleep(delay).await?;
                    } else {
                        let message = response.text().await.unwrap_or_default();
                        return Err(LlmFailure::from_status(status.as_u16(), message));
                    }
                }
                Err(e) => {
                    if e.is_timeout() {
                        return Err(LlmFailure::Timeout);
                    }
                    if attempt >= self.retry.max_retries {
                        return Err(LlmFailure::ServerDown {
                            message: e.to_string(),
                        });
                    }
                    tracing::warn!(error = %e, attempt, "transport error, retrying");
                    self.cancellable_sleep(delay).await?;
                }
            }

            attempt += 1;
            // Jitter: +/- 25% around the doubled delay
            let next = (delay.as_millis() as u64).saturating_mul(2);
            let jitter = rand::thread_rng().gen_range(0..=next / 2);
            delay = Duration::from_millis((next - next / 4 + jitter).min(self.retry.max_delay_ms));
        }
    }

    async fn cancellable_sleep(&self, wait: Duration) -> Result<(), LlmFailure> {
        tokio::select! {
            _ = sleep(wait) => Ok(()),
            _ = self.cancellation.cancelled() => Err(LlmFailure::Timeout),
        }
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            messages.push(serde_json::json!({
                "role": message.role,
                "content": message.content,
            }));
        }

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        body
    }

    /// Streaming chat: parses SSE frames of the form
    /// `{type: "text"|"text_delta", text}` / `{type: "tool_use", tool_use}`
    /// until the `[DONE]` sentinel.
    pub fn chat_stream<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmFailure>> + Send + 'a>> {
        let body = self.build_body(request, true);

        Box::pin(async_stream::stream! {
            let response = match self.send_with_backoff(&body).await {
                Ok(response) => response,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(LlmFailure::ServerDown { message: e.to_string() });
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if data == "[DONE]" {
                        yield Ok(StreamEvent::Done);
                        return;
                    }

                    if let Some(event) = parse_frame(data) {
                        yield Ok(event);
                    }
                }
            }

            // Stream ended without the sentinel; treat as done
            yield Ok(StreamEvent::Done);
        })
    }
}

fn parse_frame(data: &str) -> Option<StreamEvent> {
    let frame: Value = serde_json::from_str(data).ok()?;
    match frame.get("type").and_then(Value::as_str) {
        Some("text") | Some("text_delta") => frame
            .get("text")
            .and_then(Value::as_str)
            .map(|t| StreamEvent::Text(t.to_string())),
        Some("tool_use") => frame.get("tool_use").cloned().map(StreamEvent::ToolUse),
        _ => None,
    }
}

#[async_trait::async_trait]
impl ChatModel for HttpChatModel {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmFailure> {
        let body = self.build_body(request, false);
        let response = self.send_with_backoff(&body).await?;

        let payload: Value = response.json().await.map_err(|e| LlmFailure::ServerDown {
            message: e.to_string(),
        })?;

        // OpenAI-compatible shape first, then the flat contract shape
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                payload
                    .get("content")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string);
        let usage = payload
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok());

        Ok(ChatResponse {
            content,
            text,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frames() {
        assert!(matches!(
            parse_frame(r#"{"type":"text_delta","text":"hi"}"#),
            Some(StreamEvent::Text(t)) if t == "hi"
        ));
        assert!(matches!(
            parse_frame(r#"{"type":"tool_use","tool_use":{"name":"search"}}"#),
            Some(StreamEvent::ToolUse(_))
        ));
        assert!(parse_frame("not json").is_none());
    }

    #[test]
    fn test_body_includes_system_prompt() {
        let config = ModelConfig::default();
        let client = HttpChatModel::new(&config, RetryPolicy::no_retry()).unwrap();
        let request = ChatRequest::new("m", vec![super::super::ChatMessage::user("hello")])
            .with_system("be brief");

        let body = client.build_body(&request, false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["stream"], false);
    }
}
