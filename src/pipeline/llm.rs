//! Language-model seam: one request/response shape for every model call.
//!
//! Stages talk to a [`LanguageModel`]; they never see a provider SDK. Two
//! implementations ship:
//!
//! * [`HttpChatModel`]: any OpenAI-compatible `/chat/completions` endpoint,
//!   used whenever `base_url` is configured (DeepSeek, vLLM-served OCR
//!   models, …). HTTP status codes map onto [`StageError`] so the retry
//!   policy can tell a 503 from a 401.
//! * [`ProviderModel`]: wraps an `edgequake_llm` provider resolved by name
//!   or from the environment.
//!
//! Retries are not done here; the caller wraps each call in
//! [`crate::pipeline::executor::retry`].

use crate::config::ProviderConfig;
use crate::error::{retry_after_secs, DigestError, StageError};
use crate::pipeline::encode::EncodedImage;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Which pipeline call a request belongs to. Used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Classify,
    Ocr,
    Analyze,
    Synthesize,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestKind::Classify => "classify",
            RequestKind::Ocr => "ocr",
            RequestKind::Analyze => "analyze",
            RequestKind::Synthesize => "synthesize",
        };
        f.write_str(s)
    }
}

/// A single-turn chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub kind: RequestKind,
    pub system: Option<String>,
    pub prompt: String,
    pub images: Vec<EncodedImage>,
    /// Ask for a JSON object reply where the endpoint supports it.
    pub json: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
}

impl ChatRequest {
    pub fn new(kind: RequestKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            system: None,
            prompt: prompt.into(),
            images: Vec::new(),
            json: false,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn image(mut self, image: EncodedImage) -> Self {
        self.images.push(image);
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Apply temperature and token budget from a provider config.
    pub fn tuned(mut self, config: &ProviderConfig) -> Self {
        self.temperature = Some(config.temperature);
        self.max_tokens = Some(config.max_tokens);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Anything that can answer a [`ChatRequest`].
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Short name for logs and error messages.
    fn name(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, StageError>;
}

/// Build the model for one provider config.
///
/// `base_url` selects [`HttpChatModel`]; otherwise an `edgequake_llm`
/// provider is created by name, or auto-detected from the environment.
pub fn build_model(role: &str, config: &ProviderConfig) -> Result<Arc<dyn LanguageModel>, DigestError> {
    if let Some(base_url) = &config.base_url {
        let api_key = config.api_key.clone().ok_or_else(|| DigestError::ProviderNotConfigured {
            provider: role.to_string(),
            hint: format!("{role}.base_url is set but {role}.api_key is missing."),
        })?;
        let model = HttpChatModel::new(role, base_url, api_key, &config.model, config.timeout())?;
        return Ok(Arc::new(model));
    }

    let provider = match &config.provider {
        Some(name) => ProviderFactory::create_llm_provider(name, &config.model).map_err(|e| {
            DigestError::ProviderNotConfigured {
                provider: name.clone(),
                hint: format!("{e}"),
            }
        })?,
        None => {
            let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| DigestError::ProviderNotConfigured {
                provider: role.to_string(),
                hint: format!(
                    "No provider configured for '{role}' and none could be auto-detected.\n\
                    Set {role}.base_url + api_key, {role}.provider, or OPENAI_API_KEY.\n\
                    Error: {e}"
                ),
            })?;
            llm
        }
    };
    Ok(Arc::new(ProviderModel::new(role, provider, config.timeout())))
}

// ── OpenAI-compatible HTTP ───────────────────────────────────────────────

/// `/chat/completions` over `reqwest`.
pub struct HttpChatModel {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl HttpChatModel {
    pub fn new(
        name: &str,
        base_url: &str,
        api_key: String,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, DigestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DigestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.to_string(),
            timeout,
        })
    }

    fn body(&self, request: &ChatRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        if request.images.is_empty() {
            messages.push(json!({ "role": "user", "content": request.prompt }));
        } else {
            let mut parts: Vec<serde_json::Value> = request
                .images
                .iter()
                .map(|img| json!({ "type": "image_url", "image_url": { "url": img.data_uri(), "detail": "high" } }))
                .collect();
            parts.push(json!({ "type": "text", "text": request.prompt }));
            messages.push(json!({ "role": "user", "content": parts }));
        }

        let mut body = json!({ "model": self.model, "messages": messages });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = request.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if request.json {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

#[async_trait]
impl LanguageModel for HttpChatModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, StageError> {
        let start = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| StageError::from_reqwest(&self.name, &e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(StageError::from_status(&self.name, status, retry_after, &body));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| StageError::from_reqwest(&self.name, &e, self.timeout))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| StageError::MalformedResponse(format!("{}: reply has no content", self.name)))?;
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        debug!(
            "{} {}: {} input tokens, {} output tokens, {:?}",
            self.name,
            request.kind,
            input_tokens,
            output_tokens,
            start.elapsed()
        );
        Ok(ChatReply {
            content,
            input_tokens,
            output_tokens,
        })
    }
}

// ── edgequake-llm ────────────────────────────────────────────────────────

/// Adapter over an `edgequake_llm` provider.
pub struct ProviderModel {
    name: String,
    provider: Arc<dyn LLMProvider>,
    timeout: Duration,
}

impl ProviderModel {
    pub fn new(name: &str, provider: Arc<dyn LLMProvider>, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            provider,
            timeout,
        }
    }
}

#[async_trait]
impl LanguageModel for ProviderModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, StageError> {
        let start = Instant::now();
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatMessage::system(system.as_str()));
        }
        let images: Vec<ImageData> = request
            .images
            .iter()
            .map(|img| ImageData::new(img.base64.clone(), img.mime_type.clone()).with_detail("high"))
            .collect();
        messages.push(ChatMessage::user_with_images(request.prompt.as_str(), images));
        let options = CompletionOptions {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            ..Default::default()
        };

        let response = tokio::time::timeout(self.timeout, self.provider.chat(&messages, Some(&options)))
            .await
            .map_err(|_| StageError::Timeout {
                provider: self.name.clone(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| StageError::Transient {
                provider: self.name.clone(),
                detail: e.to_string(),
            })?;

        debug!(
            "{} {}: {} input tokens, {} output tokens, {:?}",
            self.name,
            request.kind,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(ChatReply {
            content: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

// ── Reply parsing ────────────────────────────────────────────────────────

/// Parse a JSON object out of a model reply.
///
/// Tolerates markdown fences and prose around the object; anything that
/// still does not deserialize is [`StageError::MalformedResponse`].
pub fn parse_json_reply<T: DeserializeOwned>(content: &str) -> Result<T, StageError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let candidate = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => {
            return Err(StageError::MalformedResponse(format!(
                "no JSON object in reply: {}",
                preview(content)
            )))
        }
    };
    serde_json::from_str(candidate)
        .map_err(|e| StageError::MalformedResponse(format!("{e}; reply: {}", preview(content))))
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        interested: bool,
        category: String,
    }

    #[test]
    fn parses_fenced_json() {
        let reply = "```json\n{\"interested\": true, \"category\": \"Robotics\"}\n```";
        let r: Reply = parse_json_reply(reply).unwrap();
        assert!(r.interested);
        assert_eq!(r.category, "Robotics");
    }

    #[test]
    fn parses_json_with_prose() {
        let reply = "Sure! Here is the result: {\"interested\": false, \"category\": \"\"} Hope it helps.";
        let r: Reply = parse_json_reply(reply).unwrap();
        assert!(!r.interested);
    }

    #[test]
    fn malformed_reply_is_terminal() {
        let err = parse_json_reply::<Reply>("I cannot answer that.").unwrap_err();
        assert!(matches!(err, StageError::MalformedResponse(_)));
        assert!(!err.is_transient());

        let err = parse_json_reply::<Reply>("{\"interested\": \"maybe\"}").unwrap_err();
        assert!(matches!(err, StageError::MalformedResponse(_)));
    }

    #[test]
    fn request_builder_sets_fields() {
        let cfg = ProviderConfig::default();
        let req = ChatRequest::new(RequestKind::Classify, "hello").system("sys").json().tuned(&cfg);
        assert_eq!(req.system.as_deref(), Some("sys"));
        assert!(req.json);
        assert_eq!(req.max_tokens, Some(4096));
    }

    #[test]
    fn http_body_carries_images_and_json_mode() {
        let model = HttpChatModel::new(
            "ocr",
            "https://ocr.example.com/v1/",
            "k".into(),
            "deepseek-ocr",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(model.endpoint, "https://ocr.example.com/v1/chat/completions");

        let req = ChatRequest::new(RequestKind::Ocr, "read this")
            .image(EncodedImage {
                base64: "AAAA".into(),
                mime_type: "image/png".into(),
            })
            .json();
        let body = model.body(&req);
        assert_eq!(body["model"], "deepseek-ocr");
        assert_eq!(body["response_format"]["type"], "json_object");
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "image_url");
        assert_eq!(parts[1]["text"], "read this");
    }

    #[test]
    fn base_url_without_key_fails_to_build() {
        let cfg = ProviderConfig {
            base_url: Some("https://x/v1".into()),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            build_model("llm", &cfg),
            Err(DigestError::ProviderNotConfigured { .. })
        ));
    }
}
