use crate::core::error::PipelineError;
use crate::core::state::{AudioArtifact, Segment, SynthesisResult};
use crate::services::sequencer::Sequencer;
use crate::services::tts::{Synthesizer, VoiceProfile};
use crate::services::voice::VoiceAssigner;
use anyhow::{anyhow, Result};
use futures_util::FutureExt;
use log::{debug, error, warn};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Fans segments out to parallel synthesis tasks and reports every one of
/// them to the sequencer exactly once.
pub struct Dispatcher {
    synthesizer: Arc<dyn Synthesizer>,
    sequencer: Arc<Sequencer>,
    voices: Arc<VoiceAssigner>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        sequencer: Arc<Sequencer>,
        voices: Arc<VoiceAssigner>,
        concurrency: usize,
    ) -> Self {
        Self {
            synthesizer,
            sequencer,
            voices,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Announces the phase length, then dispatches each segment.
    pub fn dispatch_phase(&self, phase_index: u64, segments: Vec<Segment>) -> Vec<JoinHandle<()>> {
        self.sequencer.report_segment_count(phase_index, segments.len());
        segments
            .into_iter()
            .map(|segment| self.dispatch(segment))
            .collect()
    }

    /// Starts synthesis of one segment. The returned handle may be ignored.
    pub fn dispatch(&self, segment: Segment) -> JoinHandle<()> {
        let voice = self.voices.assign(&segment.speaker);
        let fallback_voice = self.voices.default_voice().clone();
        let synthesizer = Arc::clone(&self.synthesizer);
        let sequencer = Arc::clone(&self.sequencer);
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => Some(p),
                Err(_) => {
                    warn!("Synthesis pool closed, running phase={} segment={} unbounded", segment.phase_index, segment.index);
                    None
                }
            };

            let audio = synthesize_with_fallback(
                synthesizer.as_ref(),
                &segment,
                &voice,
                &fallback_voice,
            )
            .await;

            sequencer.report_segment(SynthesisResult {
                phase_index: segment.phase_index,
                segment_index: segment.index,
                audio,
                text: segment.text,
            });
        })
    }
}

async fn guarded_synthesize(
    synthesizer: &dyn Synthesizer,
    text: &str,
    voice: &VoiceProfile,
) -> Result<AudioArtifact> {
    match AssertUnwindSafe(synthesizer.synthesize(text, voice))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow!("synthesizer panicked")),
    }
}

/// Never fails: assigned voice, then the default voice, then silence.
async fn synthesize_with_fallback(
    synthesizer: &dyn Synthesizer,
    segment: &Segment,
    voice: &VoiceProfile,
    fallback_voice: &VoiceProfile,
) -> AudioArtifact {
    debug!(
        "Synthesizing phase={} segment={} as {} with {}",
        segment.phase_index, segment.index, segment.speaker, voice.voice
    );
    let source = match guarded_synthesize(synthesizer, &segment.text, voice).await {
        Ok(audio) => return audio,
        Err(e) => e,
    };
    error!(
        "{:#}",
        anyhow::Error::from(PipelineError::Synthesis {
            phase: segment.phase_index,
            segment: segment.index,
            source,
        })
    );

    match guarded_synthesize(synthesizer, &segment.text, fallback_voice).await {
        Ok(mut audio) => {
            audio.degraded = true;
            audio
        }
        Err(e) => {
            error!(
                "Fallback synthesis failed for phase={} segment={}, emitting silence: {:#}",
                segment.phase_index, segment.index, e
            );
            AudioArtifact::silence()
        }
    }
}
