use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Fuse};
use futures_util::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    10
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;

    /// Streams the response in chunks. Providers without streaming yield the
    /// whole response as one chunk.
    fn chat_stream(&self, system: &str, user: &str) -> BoxStream<'_, Result<String>> {
        let system = system.to_string();
        let user = user.to_string();
        stream::once(async move { self.chat(&system, &user).await }).boxed()
    }
}

pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    let inner: Box<dyn LlmClient> = match config.provider.as_str() {
        "gemini" => {
            let cfg = config.gemini.as_ref().context("Gemini config missing")?;
            Box::new(GeminiClient::new(&cfg.api_key, &cfg.model))
        }
        "ollama" => {
            let cfg = config.ollama.as_ref().context("Ollama config missing")?;
            Box::new(OllamaClient::new(&cfg.base_url, &cfg.model))
        }
        "openai" => {
            let cfg = config.openai.as_ref().context("OpenAI config missing")?;
            Box::new(OpenAIClient::new(&cfg.api_key, &cfg.model, cfg.base_url.as_deref()))
        }
        _ => return Err(anyhow!("Unknown LLM provider: {}", config.provider)),
    };
    Ok(Arc::new(RetryingLlm::new(
        inner,
        config.retry_count,
        Duration::from_secs(config.retry_delay_seconds),
    )))
}

/// Retries failed `chat` calls a fixed number of times.
#[derive(Debug)]
pub struct RetryingLlm {
    inner: Box<dyn LlmClient>,
    retry_count: usize,
    retry_delay: Duration,
}

impl RetryingLlm {
    pub fn new(inner: Box<dyn LlmClient>, retry_count: usize, retry_delay: Duration) -> Self {
        Self {
            inner,
            retry_count,
            retry_delay,
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlm {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.inner.chat(system, user).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retry_count => {
                    attempt += 1;
                    warn!(
                        "LLM call failed (attempt {}/{}): {:#}. Retrying in {:?}",
                        attempt,
                        self.retry_count + 1,
                        e,
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e.context(format!("LLM call failed after {} attempts", attempt + 1))),
            }
        }
    }

    /// Retries until the first chunk arrives. A stream that fails after that
    /// is passed through as is.
    fn chat_stream(&self, system: &str, user: &str) -> BoxStream<'_, Result<String>> {
        let system = system.to_string();
        let user = user.to_string();
        let opened = async move {
            let mut attempt = 0;
            loop {
                let mut chunks = self.inner.chat_stream(&system, &user);
                match chunks.next().await {
                    Some(Ok(first)) => return Ok((Some(first), chunks)),
                    None => return Ok((None, chunks)),
                    Some(Err(e)) if attempt < self.retry_count => {
                        attempt += 1;
                        warn!(
                            "LLM stream failed to open (attempt {}/{}): {:#}. Retrying in {:?}",
                            attempt,
                            self.retry_count + 1,
                            e,
                            self.retry_delay
                        );
                        tokio::time::sleep(self.retry_delay).await;
                    }
                    Some(Err(e)) => {
                        return Err(e.context(format!("LLM stream failed after {} attempts", attempt + 1)))
                    }
                }
            }
        };

        stream::once(opened)
            .map(|opened| match opened {
                Ok((first, rest)) => stream::iter(first.map(Ok)).chain(rest).boxed(),
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            })
            .flatten()
            .boxed()
    }
}

/// Reads a streamed reply to the end.
pub async fn collect_stream(mut chunks: BoxStream<'_, Result<String>>) -> Result<String> {
    let mut reply = String::new();
    let mut count = 0usize;
    while let Some(chunk) = chunks.next().await {
        reply.push_str(&chunk?);
        count += 1;
    }
    debug!("Model reply: {} chunks, {} bytes", count, reply.len());
    Ok(reply)
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

impl GeminiResponse {
    fn into_text(self) -> Result<String> {
        if let Some(err) = self.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }
        let first = self
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| anyhow!("Gemini response has no candidates"))?;

        let text: String = first
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.is_empty() {
            let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
            return Err(anyhow!("Gemini response empty. Finish reason: {}", reason));
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: user.to_string() }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart { text: system.to_string() }],
            }),
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = serde_json::from_str(&response_text).map_err(|e| {
            anyhow!("Failed to parse Gemini response: {}. Body: {}", e, response_text)
        })?;
        result.into_text()
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, system: &str, user: &str, stream: bool) -> OllamaRequest {
        OllamaRequest {
            model: self.model.clone(),
            messages: vec![
                OllamaMessage { role: "system".to_string(), content: system.to_string() },
                OllamaMessage { role: "user".to_string(), content: user.to_string() },
            ],
            stream,
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

/// One line of Ollama's NDJSON streaming output.
#[derive(Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaMessageResponse>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

type ByteStream = Fuse<BoxStream<'static, Result<Vec<u8>>>>;

fn parse_ollama_line(line: &[u8]) -> Result<Option<OllamaStreamChunk>> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: OllamaStreamChunk =
        serde_json::from_str(line).with_context(|| format!("Bad Ollama stream line: {}", line))?;
    if let Some(err) = chunk.error {
        return Err(anyhow!("Ollama stream error: {}", err));
    }
    Ok(Some(chunk))
}

/// Turns raw NDJSON bytes into message-content chunks.
fn ndjson_stream(bytes: BoxStream<'static, Result<Vec<u8>>>) -> BoxStream<'static, Result<String>> {
    let state: Option<(ByteStream, Vec<u8>)> = Some((bytes.fuse(), Vec::new()));
    stream::unfold(state, |state| async move {
        let (mut bytes, mut buf) = state?;
        loop {
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                match parse_ollama_line(&line) {
                    Ok(Some(chunk)) => {
                        let text = chunk.message.map(|m| m.content).unwrap_or_default();
                        if chunk.done {
                            return if text.is_empty() { None } else { Some((Ok(text), None)) };
                        }
                        if !text.is_empty() {
                            return Some((Ok(text), Some((bytes, buf))));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), None)),
                }
                continue;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Some((Err(e), None)),
                None if buf.iter().all(u8::is_ascii_whitespace) => return None,
                // Final line without a trailing newline.
                None => buf.push(b'\n'),
            }
        }
    })
    .boxed()
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let resp = self
            .client
            .post(&url)
            .json(&self.request(system, user, false))
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Ollama API error: {}", error_text));
        }

        let result: OllamaResponse = resp.json().await?;
        Ok(result.message.content)
    }

    fn chat_stream(&self, system: &str, user: &str) -> BoxStream<'_, Result<String>> {
        let url = format!("{}/api/chat", self.base_url);
        let request = self.client.post(&url).json(&self.request(system, user, true));

        let connect = async move {
            let resp = request.send().await?;
            if !resp.status().is_success() {
                let error_text = resp.text().await?;
                return Err(anyhow!("Ollama API error: {}", error_text));
            }
            debug!("Ollama stream opened");
            let bytes = resp
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()).map_err(anyhow::Error::from))
                .boxed();
            Ok(ndjson_stream(bytes))
        };

        stream::once(connect)
            .map(|opened| match opened {
                Ok(chunks) => chunks,
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            })
            .flatten()
            .boxed()
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage { role: "system".to_string(), content: system.to_string() },
                OpenAIMessage { role: "user".to_string(), content: user.to_string() },
            ],
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI API error: {}", error_text));
        }

        let result: OpenAIResponse = resp.json().await?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("OpenAI response empty or missing content"))
    }
}
