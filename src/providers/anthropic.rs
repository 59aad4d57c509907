use super::{ChatRequest, ChatStream, LlmProvider, ProviderError, body_lines, sse_data};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    version: String,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(
        base_url: String,
        api_key: String,
        version: String,
        default_model: String,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().build()?;
        Ok(Self { client, base_url, api_key, version, default_model })
    }
}

#[derive(Serialize)]
struct ReqMsg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Body<'a> {
    model: &'a str,
    messages: Vec<ReqMsg<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Deserialize)]
struct Event {
    r#type: String,
    #[serde(default)]
    delta: Option<TextDelta>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct TextDelta {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    r#type: String,
    #[serde(default)]
    message: String,
}

fn events_text(lines: &[String]) -> Result<String, ProviderError> {
    let mut out = String::new();
    for data in lines.iter().filter_map(|l| sse_data(l)) {
        let Ok(ev) = serde_json::from_str::<Event>(data) else { continue };
        match ev.r#type.as_str() {
            "content_block_delta" => {
                if let Some(d) = ev.delta {
                    out.push_str(&d.text);
                }
            }
            // Errors can arrive mid-stream after a 200 response.
            "error" => {
                let e = ev.error.unwrap_or_default();
                return Err(ProviderError::Other(format!("{}: {}", e.r#type, e.message)));
            }
            _ => {}
        }
    }
    Ok(out)
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str { "anthropic" }
    fn default_model(&self) -> &str { &self.default_model }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec![self.default_model.clone()])
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ProviderError> {
        let messages = req
            .messages
            .iter()
            .map(|m| ReqMsg { role: m.role.as_str(), content: &m.content })
            .collect();
        let body = Body {
            model: &req.model,
            messages,
            system: req.system.as_deref(),
            max_tokens: req.max_tokens.unwrap_or(1024),
            temperature: req.temperature,
            stream: true,
        };

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let resp = self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(&body)
            .send().await?;
        let resp = ProviderError::from_response(resp).await?;

        let stream = body_lines(resp.bytes_stream())
            .map(|lines| lines.and_then(|lines| events_text(&lines)))
            .take_until(cancel.cancelled_owned())
            .filter(|res| futures_util::future::ready(!matches!(res, Ok(t) if t.is_empty())))
            .boxed();

        Ok(stream)
    }
}
