//! Streaming language-model providers.
//!
//! Implementations of [`ragtutor_core::llm::LanguageModel`]:
//!
//! | `chat.provider` | Endpoint | Wire format |
//! |-----------------|----------|-------------|
//! | `gemini` | `models/{model}:streamGenerateContent?alt=sse` | SSE, one `GenerateContentResponse` per event |
//! | `openai` | `{url}/chat/completions` with `"stream": true` | SSE, `choices[0].delta.content`, ends with `[DONE]` |
//! | `ollama` | `{url}/api/chat` | NDJSON, `message.content`, ends with `"done": true` |
//!
//! Every provider sends the request, then hands the response body to a
//! spawned task that decodes it line by line and forwards text fragments
//! through a bounded channel. Dropping the returned stream closes the
//! channel; the task notices on its next send and stops reading, which
//! drops the HTTP response.
//!
//! A body that ends without the provider's completion marker is reported as
//! an error, so a cut connection never looks like a finished answer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use ragtutor_core::llm::{LanguageModel, TextStream};
use ragtutor_core::prompt::{Prompt, PromptRole};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::{ChatConfig, Secrets};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Fragments buffered between the decoder task and the consumer.
const STREAM_BUFFER: usize = 32;

/// How one line of a response body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    OpenAiSse,
    GeminiSse,
    OllamaNdjson,
}

/// Result of decoding one line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LineEvent {
    pub text: Option<String>,
    /// The provider signalled a complete answer.
    pub done: bool,
}

/// Splits a byte stream into `\n`-terminated lines.
///
/// Bytes are buffered until a newline arrives, so multi-byte characters
/// split across network chunks are decoded intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&line)
                    .trim_end_matches(['\n', '\r'])
                    .to_string(),
            );
        }
        lines
    }

    /// Whatever is left after the body ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Decode one line of a response body.
pub fn decode_line(format: WireFormat, line: &str) -> Result<LineEvent> {
    if line.trim().is_empty() {
        return Ok(LineEvent::default());
    }
    match format {
        WireFormat::OpenAiSse => {
            let Some(data) = sse_data(line) else {
                return Ok(LineEvent::default());
            };
            if data.trim() == "[DONE]" {
                return Ok(LineEvent {
                    text: None,
                    done: true,
                });
            }
            let value: Value = serde_json::from_str(data)?;
            if let Some(err) = value.get("error") {
                bail!("OpenAI stream error: {}", err);
            }
            let text = value
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(LineEvent { text, done: false })
        }
        WireFormat::GeminiSse => {
            let Some(data) = sse_data(line) else {
                return Ok(LineEvent::default());
            };
            let value: Value = serde_json::from_str(data)?;
            if let Some(err) = value.get("error") {
                bail!("Gemini stream error: {}", err);
            }
            let candidate = value.pointer("/candidates/0");
            let text = candidate
                .and_then(|c| c.pointer("/content/parts"))
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<String>()
                })
                .filter(|t| !t.is_empty());
            let finish = candidate
                .and_then(|c| c.get("finishReason"))
                .and_then(Value::as_str);
            match finish {
                Some("STOP") | Some("MAX_TOKENS") | None => Ok(LineEvent {
                    text,
                    done: finish.is_some(),
                }),
                Some(reason) => bail!("Gemini stopped generating: {}", reason),
            }
        }
        WireFormat::OllamaNdjson => {
            let value: Value = serde_json::from_str(line)?;
            if let Some(err) = value.get("error").and_then(Value::as_str) {
                bail!("Ollama stream error: {}", err);
            }
            let text = value
                .pointer("/message/content")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
            Ok(LineEvent { text, done })
        }
    }
}

/// Decode `response` on a background task and expose the fragments as a
/// [`TextStream`].
fn spawn_decoder(response: reqwest::Response, format: WireFormat) -> TextStream {
    let (tx, rx) = mpsc::channel::<Result<String>>(STREAM_BUFFER);

    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::default();

        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    let _ = tx.send(Err(anyhow!("response stream failed: {}", e))).await;
                    return;
                }
            };
            for line in lines.push(&bytes) {
                match decode_line(format, &line) {
                    Ok(event) => {
                        if let Some(text) = event.text {
                            if tx.send(Ok(text)).await.is_err() {
                                debug!("answer stream dropped, stopping generation");
                                return;
                            }
                        }
                        if event.done {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        }

        if let Some(line) = lines.finish() {
            match decode_line(format, &line) {
                Ok(event) => {
                    if let Some(text) = event.text {
                        if tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    if event.done {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        let _ = tx
            .send(Err(anyhow!("model stream ended before the answer was complete")))
            .await;
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Send the initial request, retrying 429/5xx and network errors with
/// exponential backoff. Only the request is retried, never a stream.
async fn send_with_retry(
    request: reqwest::RequestBuilder,
    max_retries: u32,
    label: &str,
) -> Result<reqwest::Response> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }
        let Some(req) = request.try_clone() else {
            bail!("{} request body cannot be retried", label);
        };

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(%status, attempt, "{} API transient error", label);
                    last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} connection error: {}", label, e));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} request failed after retries", label)))
}

fn http_client(config: &ChatConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn role_name(role: PromptRole) -> &'static str {
    match role {
        PromptRole::System => "system",
        PromptRole::User => "user",
        PromptRole::Assistant => "assistant",
    }
}

fn chat_messages(prompt: &Prompt) -> Vec<Value> {
    prompt
        .to_messages()
        .into_iter()
        .map(|m| json!({ "role": role_name(m.role), "content": m.content }))
        .collect()
}

// ============ Gemini ============

pub struct GeminiChatModel {
    model: String,
    api_key: String,
    base_url: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl GeminiChatModel {
    pub fn new(config: &ChatConfig, secrets: &Secrets) -> Result<Self> {
        let api_key = secrets
            .google_api_key
            .clone()
            .ok_or_else(|| anyhow!("GOOGLE_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config.model.clone(),
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

/// `generateContent` body. Gemini conversations must open with a user
/// turn, so leading assistant messages (the greeting) are left out.
pub fn gemini_request_body(prompt: &Prompt, temperature: f32) -> Value {
    let contents: Vec<Value> = prompt
        .messages
        .iter()
        .skip_while(|m| m.role == PromptRole::Assistant)
        .map(|m| {
            let role = if m.role == PromptRole::Assistant {
                "model"
            } else {
                "user"
            };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();

    json!({
        "systemInstruction": { "parts": [{ "text": prompt.system }] },
        "contents": contents,
        "generationConfig": { "temperature": temperature },
    })
}

#[async_trait]
impl LanguageModel for GeminiChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TextStream> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let request = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&gemini_request_body(prompt, self.temperature));
        let response = send_with_retry(request, self.max_retries, "Gemini").await?;
        Ok(spawn_decoder(response, WireFormat::GeminiSse))
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAIChatModel {
    model: String,
    api_key: Option<String>,
    base_url: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChatModel {
    pub fn new(config: &ChatConfig, secrets: &Secrets) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            api_key: secrets.openai_api_key.clone(),
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

pub fn openai_request_body(model: &str, prompt: &Prompt, temperature: f32) -> Value {
    json!({
        "model": model,
        "messages": chat_messages(prompt),
        "temperature": temperature,
        "stream": true,
    })
}

#[async_trait]
impl LanguageModel for OpenAIChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TextStream> {
        let mut request = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .json(&openai_request_body(&self.model, prompt, self.temperature));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = send_with_retry(request, self.max_retries, "OpenAI").await?;
        Ok(spawn_decoder(response, WireFormat::OpenAiSse))
    }
}

// ============ Ollama ============

pub struct OllamaChatModel {
    model: String,
    url: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChatModel {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_BASE_URL.to_string()),
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TextStream> {
        let body = json!({
            "model": self.model,
            "messages": chat_messages(prompt),
            "stream": true,
            "options": { "temperature": self.temperature },
        });
        let request = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&body);
        let response = send_with_retry(request, self.max_retries, "Ollama")
            .await
            .map_err(|e| anyhow!("{} (is Ollama running at {}?)", e, self.url))?;
        Ok(spawn_decoder(response, WireFormat::OllamaNdjson))
    }
}

/// Create the configured language model.
pub fn create_language_model(
    config: &ChatConfig,
    secrets: &Secrets,
) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiChatModel::new(config, secrets)?)),
        "openai" => Ok(Arc::new(OpenAIChatModel::new(config, secrets)?)),
        "ollama" => Ok(Arc::new(OllamaChatModel::new(config)?)),
        other => bail!("Unknown chat provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragtutor_core::prompt::PromptMessage;

    fn prompt() -> Prompt {
        Prompt {
            system: "sys".to_string(),
            messages: vec![
                PromptMessage {
                    role: PromptRole::Assistant,
                    content: "How can I help you?".to_string(),
                },
                PromptMessage {
                    role: PromptRole::User,
                    content: "What is a trie?".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_line_buffer_handles_split_multibyte() {
        let mut buf = LineBuffer::default();
        let text = "data: λ\n".as_bytes();
        // split inside the two-byte 'λ'
        assert!(buf.push(&text[..7]).is_empty());
        assert_eq!(buf.push(&text[7..]), vec!["data: λ".to_string()]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_line_buffer_crlf_and_tail() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.push(b"a\r\nb\n{\"x\""), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(buf.finish(), Some("{\"x\"".to_string()));
    }

    #[test]
    fn test_decode_openai() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        let event = decode_line(WireFormat::OpenAiSse, line).unwrap();
        assert_eq!(event.text.as_deref(), Some("Hel"));
        assert!(!event.done);
        assert!(decode_line(WireFormat::OpenAiSse, "data: [DONE]").unwrap().done);
        assert_eq!(
            decode_line(WireFormat::OpenAiSse, ": keep-alive").unwrap(),
            LineEvent::default()
        );
    }

    #[test]
    fn test_decode_gemini() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"A "},{"text":"trie"}],"role":"model"}}]}"#;
        let event = decode_line(WireFormat::GeminiSse, line).unwrap();
        assert_eq!(event.text.as_deref(), Some("A trie"));
        assert!(!event.done);

        let last = r#"data: {"candidates":[{"content":{"parts":[{"text":"."}]},"finishReason":"STOP"}]}"#;
        let event = decode_line(WireFormat::GeminiSse, last).unwrap();
        assert_eq!(event.text.as_deref(), Some("."));
        assert!(event.done);

        let blocked = r#"data: {"candidates":[{"finishReason":"SAFETY"}]}"#;
        assert!(decode_line(WireFormat::GeminiSse, blocked).is_err());
    }

    #[test]
    fn test_decode_ollama() {
        let event = decode_line(
            WireFormat::OllamaNdjson,
            r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#,
        )
        .unwrap();
        assert_eq!(event.text.as_deref(), Some("Hi"));
        let end = decode_line(
            WireFormat::OllamaNdjson,
            r#"{"message":{"role":"assistant","content":""},"done":true}"#,
        )
        .unwrap();
        assert_eq!(end, LineEvent { text: None, done: true });
        assert!(decode_line(WireFormat::OllamaNdjson, r#"{"error":"model not found"}"#).is_err());
    }

    #[test]
    fn test_gemini_body_starts_with_user() {
        let body = gemini_request_body(&prompt(), 0.0);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
    }

    #[test]
    fn test_openai_body_has_system_first() {
        let body = openai_request_body("gpt-4o-mini", &prompt(), 0.2);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], "What is a trie?");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_gemini_requires_key() {
        let err = create_language_model(&ChatConfig::default(), &Secrets::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("GOOGLE_API_KEY"));
    }
}
