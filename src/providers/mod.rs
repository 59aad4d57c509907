pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod registry;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream};
use futures_util::{StreamExt, future};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("config: {0}")]
    Config(String),
    #[error("other: {0}")]
    Other(String),
}

impl ProviderError {
    /// Turns a non-2xx response into `Status`, keeping the body for classification.
    pub(crate) async fn from_response(resp: reqwest::Response) -> Result<reqwest::Response, Self> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One completion request: system message, ordered turns, sampling settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Ordered text fragments of one streamed completion.
pub type ChatStream = BoxStream<'static, Result<String, ProviderError>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;
    /// Opens a streaming completion. Implementations stop yielding once `cancel` fires.
    async fn chat_stream(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ProviderError>;
}

/// Reassembles newline-delimited records that may be split across network chunks.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// The unterminated last record, if any, once the body has ended.
    pub(crate) fn finish(&mut self) -> Vec<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() { vec![] } else { vec![line] }
    }
}

/// Complete lines of a chunked response body, flushing a last record that
/// lacks a trailing newline when the body ends.
pub(crate) fn body_lines<S, B, E>(chunks: S) -> impl Stream<Item = Result<Vec<String>, ProviderError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    ProviderError: From<E>,
{
    let mut buf = LineBuffer::default();
    chunks
        .map(Some)
        .chain(stream::once(future::ready(None)))
        .map(move |chunk| match chunk {
            Some(bytes) => Ok(buf.push(bytes?.as_ref())),
            None => Ok(buf.finish()),
        })
}

/// Payload of an SSE `data:` line, skipping the `[DONE]` sentinel.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        None
    } else {
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_joins_split_records() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let lines = buf.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: [DONE]"]);
        assert_eq!(sse_data(&lines[0]), Some("{\"a\":1}"));
        assert_eq!(sse_data(&lines[1]), None);
        assert_eq!(sse_data("event: ping"), None);
    }

    #[tokio::test]
    async fn body_lines_flushes_unterminated_last_record() {
        let chunks = stream::iter(vec![
            Ok::<_, ProviderError>(&b"{\"a\":1}\n{\"b\""[..]),
            Ok(&b":2}"[..]),
        ]);
        let lines: Vec<Vec<String>> = body_lines(chunks)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            lines,
            vec![vec![r#"{"a":1}"#.to_string()], vec![], vec![r#"{"b":2}"#.to_string()]]
        );
    }

    #[test]
    fn line_buffer_finish_is_empty_after_full_lines() {
        let mut buf = LineBuffer::default();
        buf.push(b"done\n");
        assert!(buf.finish().is_empty());
        buf.push(b"  tail ");
        assert_eq!(buf.finish(), vec!["tail"]);
        assert!(buf.finish().is_empty());
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
