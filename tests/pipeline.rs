use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storyteller::core::config::StoryConfig;
use storyteller::core::io::{NativeStorage, Storage};
use storyteller::core::state::{AudioArtifact, StoryStage};
use storyteller::services::controller::StoryController;
use storyteller::services::llm::LlmClient;
use storyteller::services::playback::{write_playback, ChannelSink, PlaybackSink};
use storyteller::services::prompts::PromptLibrary;
use storyteller::services::tts::{AudioConfig, Synthesizer, VoiceProfile};
use storyteller::utils::audio::merge_audio_files;

/// Writes a numbered story: each continuation has `lines` character and
/// narration lines, and the story ends after `rounds` continuations.
#[derive(Debug)]
struct StoryLlm {
    rounds: usize,
    lines: usize,
    served: Mutex<usize>,
}

impl StoryLlm {
    fn continuation(&self, round: usize) -> String {
        let segments: Vec<String> = (0..self.lines)
            .map(|i| {
                if i % 2 == 0 {
                    format!(r#"{{"is_role": false, "content": "r{} l{}"}}"#, round, i)
                } else {
                    format!(
                        r#"{{"is_role": true, "role_name": "Fox", "role_gender": "male", "content": "r{} l{}"}}"#,
                        round, i
                    )
                }
            })
            .collect();
        format!(
            r#"Part {}: {{"story_seg": [{}], "ended": {}}}"#,
            round,
            segments.join(", "),
            round + 1 == self.rounds
        )
    }
}

#[async_trait]
impl LlmClient for StoryLlm {
    async fn chat(&self, _system: &str, user: &str) -> Result<String> {
        let input: Value = serde_json::from_str(user)?;
        let delay = rand::random_range(1..10);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        if input.get("text").is_some() {
            Ok(r#"{"theme": "foxes", "has_explicit_theme": true}"#.to_string())
        } else if input.get("theme").is_some() {
            Ok(r#"{"title": "Fox Tales", "roles": ["Fox"]}"#.to_string())
        } else if input.get("outline").is_some() {
            let round = {
                let mut served = self.served.lock().unwrap();
                *served += 1;
                *served - 1
            };
            Ok(self.continuation(round))
        } else {
            Err(anyhow!("unexpected prompt: {}", user))
        }
    }
}

/// Echoes the text back as audio after a random delay; fails for one voice.
struct JitterSynth;

#[async_trait]
impl Synthesizer for JitterSynth {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<AudioArtifact> {
        let delay = rand::random_range(0..25);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if voice.voice == "broken" {
            return Err(anyhow!("voice offline"));
        }
        Ok(AudioArtifact::new(format!("{}\n", text).into_bytes()))
    }
}

fn audio_config() -> AudioConfig {
    AudioConfig {
        provider: "silent".to_string(),
        format: "txt".to_string(),
        concurrency: 4,
        default_voice: VoiceProfile::new("default"),
        narrators: vec![VoiceProfile::new("narrator")],
        characters: vec![VoiceProfile::new("broken")],
        http: None,
    }
}

#[tokio::test]
async fn test_story_plays_in_generation_order() -> Result<()> {
    let rounds = 4;
    let lines = 6;
    let llm = Arc::new(StoryLlm {
        rounds,
        lines,
        served: Mutex::new(0),
    });
    let story = StoryConfig {
        intro_text: Some("intro".to_string()),
        model_concurrency: 2,
        ..Default::default()
    };
    let controller = StoryController::new(
        llm,
        Arc::new(JitterSynth),
        PromptLibrary::default(),
        audio_config(),
        story,
    );

    let temp_dir = tempfile::tempdir()?;
    let folder = temp_dir.path().to_string_lossy().to_string();
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());

    let (sink, rx) = ChannelSink::channel();
    let writer = {
        let storage = Arc::clone(&storage);
        let folder = folder.clone();
        tokio::spawn(async move { write_playback(rx, storage, &folder, "txt").await })
    };

    let session = controller.start("tell me a story about foxes", sink.clone());
    tokio::time::timeout(Duration::from_secs(10), session.wait_finished()).await?;
    assert_eq!(session.stage(), StoryStage::Ended);
    sink.close();

    let chunks = writer.await??;
    let output = format!("{}/story.txt", folder);
    merge_audio_files(storage.as_ref(), &chunks, &output, "txt").await?;
    let merged = String::from_utf8(storage.read(&output).await?)?;

    let mut expected = vec![
        "intro".to_string(),
        "Our story is called: Fox Tales".to_string(),
        "In this story you will meet: Fox".to_string(),
    ];
    for round in 0..rounds {
        for i in 0..lines {
            if i % 2 == 0 {
                expected.push(format!("r{} l{}", round, i));
            } else {
                expected.push(format!("Fox says: r{} l{}", round, i));
            }
        }
    }
    let heard: Vec<&str> = merged.lines().collect();
    assert_eq!(heard, expected);

    // Theme, outline, then one phase per continuation round.
    let phases: Vec<u64> = session.phases().iter().map(|p| p.index).collect();
    assert_eq!(phases, (0..(2 + rounds as u64)).collect::<Vec<u64>>());
    Ok(())
}
