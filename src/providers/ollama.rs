use super::{ChatRequest, ChatStream, LlmProvider, ProviderError, body_lines};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    default_model: String,
}

impl OllamaProvider {
    pub fn new(base_url: String, default_model: String) -> Result<Self, ProviderError> {
        let client = Client::builder().build()?;
        Ok(Self { client, base_url, default_model })
    }
}

#[derive(Serialize)]
struct Msg<'a> { role: &'a str, content: &'a str }

#[derive(Serialize)]
struct Body<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    stream: bool,
    options: Options,
}

#[derive(Serialize, Default)]
struct Options { temperature: Option<f32>, num_predict: Option<u32> }

#[derive(Deserialize)]
struct ChunkMsg { content: String }

#[derive(Deserialize)]
struct Chunk {
    message: Option<ChunkMsg>,
    #[serde(default)]
    error: Option<String>,
}

// Ollama streams NDJSON lines
fn chunks_text(lines: &[String]) -> Result<String, ProviderError> {
    let mut acc = String::new();
    for l in lines {
        let chunk: Chunk = serde_json::from_str(l)?;
        if let Some(err) = chunk.error {
            return Err(ProviderError::Other(err));
        }
        if let Some(msg) = chunk.message { acc.push_str(&msg.content); }
    }
    Ok(acc)
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str { "ollama" }
    fn default_model(&self) -> &str { &self.default_model }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        #[derive(Deserialize)]
        struct Model { name: String }
        #[derive(Deserialize)]
        struct Resp { models: Vec<Model> }
        let url = format!("{}/api/tags", self.base_url.trim_end_matches('/'));
        let resp = self.client.get(url).send().await?;
        let resp: Resp = ProviderError::from_response(resp).await?.json().await?;
        Ok(resp.models.into_iter().map(|m| m.name).collect())
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ProviderError> {
        let mut messages: Vec<Msg> = Vec::new();
        if let Some(sys) = &req.system { messages.push(Msg { role: "system", content: sys }); }
        for m in &req.messages { messages.push(Msg { role: m.role.as_str(), content: &m.content }); }

        let body = Body {
            model: &req.model,
            messages,
            stream: true,
            options: Options { temperature: req.temperature, num_predict: req.max_tokens },
        };

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let resp = self.client.post(url).json(&body).send().await?;
        let resp = ProviderError::from_response(resp).await?;

        let stream = body_lines(resp.bytes_stream())
            .map(|lines| lines.and_then(|lines| chunks_text(&lines)))
            .take_until(cancel.cancelled_owned())
            .filter(|res| futures_util::future::ready(!matches!(res, Ok(t) if t.is_empty())))
            .boxed();

        Ok(stream)
    }
}
