use super::{
    ChatRequest, ChatStream, LlmProvider, ProviderError, Role, body_lines, sse_data,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// OpenAI-compatible chat completions backend (also serves gateways with the same API).
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl OpenAiProvider {
    pub fn new(
        base_url: String,
        api_key: String,
        default_model: String,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            default_model,
        })
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Body<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct DeltaMsg {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    delta: DeltaMsg,
}

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
}

fn body(req: &ChatRequest) -> Body<'_> {
    let mut messages: Vec<Msg> = Vec::with_capacity(req.messages.len() + 1);
    if let Some(sys) = &req.system {
        messages.push(Msg { role: "system", content: sys });
    }
    for m in &req.messages {
        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(Msg { role, content: &m.content });
    }
    Body {
        model: &req.model,
        messages,
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        stream: true,
    }
}

/// Concatenated delta text of every complete `data:` record in `lines`.
fn delta_text(lines: &[String]) -> Result<String, ProviderError> {
    let mut out = String::new();
    for data in lines.iter().filter_map(|l| sse_data(l)) {
        let chunk: Chunk = serde_json::from_str(data)?;
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                out.push_str(&content);
            }
        }
    }
    Ok(out)
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }
    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        #[derive(Deserialize)]
        struct Model {
            id: String,
        }
        #[derive(Deserialize)]
        struct Resp {
            data: Vec<Model>,
        }
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let resp = self.client.get(url).bearer_auth(&self.api_key).send().await?;
        let resp: Resp = ProviderError::from_response(resp).await?.json().await?;
        Ok(resp.data.into_iter().map(|m| m.id).collect())
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body(&req))
            .send()
            .await?;
        let resp = ProviderError::from_response(resp).await?;

        let stream = body_lines(resp.bytes_stream())
            .map(|lines| lines.and_then(|lines| delta_text(&lines)))
            .take_until(cancel.cancelled_owned())
            .filter(|res| futures_util::future::ready(!matches!(res, Ok(t) if t.is_empty())))
            .boxed();

        Ok(stream)
    }
}
