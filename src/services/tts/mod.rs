use crate::core::state::{AudioArtifact, Gender};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub mod http;

/// A concrete voice the synthesis backend can speak with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    #[serde(default)]
    pub name: String,
    pub voice: String,
    #[serde(default)]
    pub gender: Option<Gender>,
    /// Extra backend parameters (speed, pitch, reference audio, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

impl VoiceProfile {
    pub fn new(voice: &str) -> Self {
        Self {
            name: voice.to_string(),
            voice: voice.to_string(),
            gender: None,
            params: Map::new(),
        }
    }

    pub fn with_gender(mut self, gender: Gender) -> Self {
        self.gender = Some(gender);
        self
    }

    /// Two profiles sound the same when voice and parameters match.
    pub fn unique_id(&self) -> String {
        if self.params.is_empty() {
            self.voice.clone()
        } else {
            format!("{}#{}", self.voice, Value::Object(self.params.clone()))
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String,
    #[serde(default = "default_format")]
    pub format: String,
    /// Maximum synthesis requests in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_voice")]
    pub default_voice: VoiceProfile,
    #[serde(default)]
    pub narrators: Vec<VoiceProfile>,
    #[serde(default)]
    pub characters: Vec<VoiceProfile>,
    pub http: Option<http::HttpTtsConfig>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            format: default_format(),
            concurrency: default_concurrency(),
            default_voice: default_voice(),
            narrators: Vec::new(),
            characters: Vec::new(),
            http: None,
        }
    }
}

fn default_tts_provider() -> String {
    "http".to_string()
}
fn default_format() -> String {
    "mp3".to_string()
}
fn default_concurrency() -> usize {
    5
}
fn default_voice() -> VoiceProfile {
    VoiceProfile::new("default")
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<AudioArtifact>;
}

/// Produces empty audio. Useful offline and as the last-resort fallback.
#[derive(Debug, Default)]
pub struct SilentSynthesizer;

#[async_trait]
impl Synthesizer for SilentSynthesizer {
    async fn synthesize(&self, _text: &str, _voice: &VoiceProfile) -> Result<AudioArtifact> {
        Ok(AudioArtifact::new(Vec::new()))
    }
}

pub fn create_synthesizer(config: &AudioConfig) -> Result<Arc<dyn Synthesizer>> {
    info!("Initializing synthesizer for provider: {}", config.provider);
    match config.provider.as_str() {
        "http" => {
            let http_config = config
                .http
                .clone()
                .ok_or_else(|| anyhow!("HTTP TTS config missing"))?;
            Ok(Arc::new(http::HttpSynthesizer::new(http_config, &config.format)?))
        }
        "silent" => Ok(Arc::new(SilentSynthesizer)),
        _ => Err(anyhow!("Unknown TTS provider: {}", config.provider)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_includes_params() {
        let plain = VoiceProfile::new("alloy");
        let mut tuned = VoiceProfile::new("alloy");
        tuned.params.insert("speed".to_string(), Value::from(1.2));

        assert_eq!(plain.unique_id(), "alloy");
        assert_ne!(plain.unique_id(), tuned.unique_id());
    }

    #[test]
    fn test_audio_config_yaml() -> Result<()> {
        let yaml = r#"
provider: silent
narrators:
  - { voice: narrator-a }
characters:
  - { name: Deep, voice: char-m, gender: male }
  - { voice: char-f, gender: Female, params: { speed: 1.1 } }
"#;
        let config: AudioConfig = serde_yaml_ng::from_str(yaml)?;
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.format, "mp3");
        assert_eq!(config.default_voice.voice, "default");
        assert_eq!(config.characters[0].gender, Some(Gender::Male));
        assert_eq!(config.characters[1].gender, Some(Gender::Female));
        assert!(create_synthesizer(&config).is_ok());
        Ok(())
    }

    #[test]
    fn test_unknown_provider() {
        let config = AudioConfig {
            provider: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        assert!(create_synthesizer(&config).is_err());
    }
}
