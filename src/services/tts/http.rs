use super::{Synthesizer, VoiceProfile};
use crate::core::state::AudioArtifact;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpTtsConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_path() -> String {
    "tts".to_string()
}
fn default_timeout() -> u64 {
    60
}

/// Speaks through a JSON-over-HTTP TTS server: `POST {text, voice, format,
/// params}` and the response body is the encoded audio.
pub struct HttpSynthesizer {
    endpoint: Url,
    api_key: Option<String>,
    format: String,
    client: Client,
}

impl HttpSynthesizer {
    pub fn new(config: HttpTtsConfig, format: &str) -> Result<Self> {
        // A trailing slash keeps the last base path segment when joining.
        let base = if config.base_url.ends_with('/') {
            config.base_url.clone()
        } else {
            format!("{}/", config.base_url)
        };
        let endpoint = Url::parse(&base)
            .with_context(|| format!("Invalid TTS base_url: {}", config.base_url))?
            .join(config.path.trim_start_matches('/'))
            .context("Invalid TTS path")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            endpoint,
            api_key: config.api_key,
            format: format.to_string(),
            client,
        })
    }

    fn request_body(&self, text: &str, voice: &VoiceProfile) -> Value {
        json!({
            "text": text,
            "voice": voice.voice,
            "format": self.format,
            "params": Value::Object(voice.params.clone()),
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<AudioArtifact> {
        debug!("Requesting speech ({} chars) with voice {}", text.chars().count(), voice.voice);

        let mut request = self.client.post(self.endpoint.clone()).json(&self.request_body(text, voice));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.context("Failed to send TTS request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("TTS server error {}: {}", status, error_text));
        }

        let bytes = resp.bytes().await.context("Failed to read TTS response body")?;
        if bytes.is_empty() {
            return Err(anyhow!("TTS server returned empty audio"));
        }
        Ok(AudioArtifact::new(bytes.to_vec()))
    }
}

impl Default for HttpTtsConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            path: default_path(),
            api_key: None,
            timeout_seconds: default_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() -> Result<()> {
        let synth = HttpSynthesizer::new(
            HttpTtsConfig {
                base_url: "http://localhost:9000/api".to_string(),
                path: "/v1/speech".to_string(),
                ..Default::default()
            },
            "wav",
        )?;
        assert_eq!(synth.endpoint.as_str(), "http://localhost:9000/api/v1/speech");
        Ok(())
    }

    #[test]
    fn test_request_body() -> Result<()> {
        let synth = HttpSynthesizer::new(HttpTtsConfig::default(), "mp3")?;
        let mut voice = VoiceProfile::new("fox");
        voice.params.insert("speed".to_string(), Value::from(1.5));

        let body = synth.request_body("Hello.", &voice);
        assert_eq!(body["voice"], "fox");
        assert_eq!(body["format"], "mp3");
        assert_eq!(body["params"]["speed"], 1.5);
        Ok(())
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpSynthesizer::new(
            HttpTtsConfig {
                base_url: "not a url".to_string(),
                ..Default::default()
            },
            "mp3",
        );
        assert!(result.is_err());
    }
}
