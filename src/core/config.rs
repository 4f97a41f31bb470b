use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::llm::LlmConfig;
use crate::services::trigger::default_triggers;
use crate::services::tts::AudioConfig;

const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    pub llm: LlmConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub story: StoryConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoryConfig {
    #[serde(default = "default_triggers")]
    pub triggers: Vec<String>,
    /// Spoken while the theme is being worked out.
    #[serde(default)]
    pub intro_text: Option<String>,
    #[serde(default = "default_apology")]
    pub apology_text: String,
    /// Model calls allowed in flight at once.
    #[serde(default = "default_model_concurrency")]
    pub model_concurrency: usize,
    #[serde(default = "default_max_continuations")]
    pub max_continuations: usize,
    /// Force-complete a phase whose segment count has not arrived after this
    /// long. `None` waits forever.
    #[serde(default = "default_phase_deadline")]
    pub phase_deadline_seconds: Option<u64>,
    #[serde(default)]
    pub prompts_file: Option<String>,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            triggers: default_triggers(),
            intro_text: None,
            apology_text: default_apology(),
            model_concurrency: default_model_concurrency(),
            max_continuations: default_max_continuations(),
            phase_deadline_seconds: default_phase_deadline(),
            prompts_file: None,
        }
    }
}

fn default_output() -> String {
    "output".to_string()
}
fn default_apology() -> String {
    "I'm sorry, something went wrong while telling the story. Let's try again another time."
        .to_string()
}
fn default_model_concurrency() -> usize {
    2
}
fn default_max_continuations() -> usize {
    20
}
fn default_phase_deadline() -> Option<u64> {
    Some(300)
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", CONFIG_FILE);
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }
}
