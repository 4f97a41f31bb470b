use anyhow::Result;
use inquire::{InquireError, Text};
use log::{error, info};
use std::sync::Arc;
use tokio::task::JoinHandle;

use storyteller::core::config::Config;
use storyteller::core::io::{NativeStorage, Storage};
use storyteller::services::controller::{InterruptDecision, StoryController, StorySession};
use storyteller::services::llm::create_llm;
use storyteller::services::playback::{write_playback, ChannelSink, PlaybackSink};
use storyteller::services::prompts::PromptLibrary;
use storyteller::services::tts::create_synthesizer;
use storyteller::utils::audio::merge_audio_files;

struct ActiveStory {
    session: Arc<StorySession>,
    sink: Arc<ChannelSink>,
    writer: JoinHandle<Result<Vec<String>>>,
    folder: String,
}

impl ActiveStory {
    /// Stops accepting audio and merges what was written into one file.
    async fn finalize(self, storage: &dyn Storage, format: &str) -> Result<()> {
        self.sink.close();
        let chunks = self.writer.await??;
        if chunks.is_empty() {
            info!("No audio was produced for {}", self.folder);
            return Ok(());
        }
        let output = format!("{}/story.{}", self.folder, format);
        merge_audio_files(storage, &chunks, &output, format).await?;
        println!("Story saved to {}", output);
        Ok(())
    }
}

async fn read_line() -> Result<Option<String>> {
    let answer = tokio::task::spawn_blocking(|| Text::new(">").prompt()).await?;
    match answer {
        Ok(line) => Ok(Some(line)),
        Err(InquireError::OperationCanceled) | Err(InquireError::OperationInterrupted) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let llm = create_llm(&config.llm)?;
    let synthesizer = create_synthesizer(&config.audio)?;
    let prompts = PromptLibrary::load(config.story.prompts_file.as_deref())?;
    let controller = StoryController::new(
        llm,
        synthesizer,
        prompts,
        config.audio.clone(),
        config.story.clone(),
    );
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let format = config.audio.format.clone();

    println!("Ask for a story (e.g. \"tell me a story about a fox\"). Ctrl-C to quit.");

    let mut active: Option<ActiveStory> = None;
    let mut story_number = 0u32;

    while let Some(line) = read_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        if let Some(story) = active.take() {
            if story.session.stage().is_ended() {
                story.finalize(storage.as_ref(), &format).await?;
            } else {
                let decision = story.session.interrupt(&line).await;
                if decision == InterruptDecision::Exit {
                    story.finalize(storage.as_ref(), &format).await?;
                } else {
                    active = Some(story);
                }
                continue;
            }
        }

        if !controller.triggers().is_trigger(&line) {
            println!("I only tell stories here. Try \"tell me a story\".");
            continue;
        }

        // Earlier runs keep their folders.
        let folder = loop {
            story_number += 1;
            let folder = format!("{}/{:03}", config.output_folder, story_number);
            if !storage.exists(&folder).await? {
                break folder;
            }
        };
        let (sink, rx) = ChannelSink::channel();
        let writer = {
            let storage = Arc::clone(&storage);
            let folder = folder.clone();
            let format = format.clone();
            tokio::spawn(async move { write_playback(rx, storage, &folder, &format).await })
        };
        let session = controller.start(&line, sink.clone());
        info!("Story #{} started", story_number);
        active = Some(ActiveStory {
            session,
            sink,
            writer,
            folder,
        });
    }

    if let Some(story) = active {
        if !story.session.stage().is_ended() {
            println!("Waiting for the story to finish...");
            story.session.wait_finished().await;
        }
        if let Err(e) = story.finalize(storage.as_ref(), &format).await {
            error!("Failed to save story: {:#}", e);
        }
    }
    Ok(())
}
