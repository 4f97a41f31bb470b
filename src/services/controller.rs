use crate::core::config::StoryConfig;
use crate::core::error::PipelineError;
use crate::core::state::{Phase, PhaseKind, Segment, StoryStage};
use crate::services::dispatcher::Dispatcher;
use crate::services::llm::{collect_stream, LlmClient};
use crate::services::parser::{fallback_segments, parse, ParsedResponse};
use crate::services::playback::PlaybackSink;
use crate::services::prompts::{PromptLibrary, RELEVANCE_CHECK};
use crate::services::sequencer::Sequencer;
use crate::services::trigger::TriggerSet;
use crate::services::tts::{AudioConfig, Synthesizer};
use crate::services::voice::VoiceAssigner;
use crate::utils::text::trim_punctuation;
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptDecision {
    Continue,
    Restart,
    Exit,
}

impl InterruptDecision {
    /// Maps a classifier label; anything but an exact label means continue.
    pub fn from_label(label: &str) -> Self {
        match trim_punctuation(label).to_lowercase().as_str() {
            "exit" | "退出" => InterruptDecision::Exit,
            "restart" | "重新开始" => InterruptDecision::Restart,
            _ => InterruptDecision::Continue,
        }
    }
}

pub struct StoryController {
    llm: Arc<dyn LlmClient>,
    synthesizer: Arc<dyn Synthesizer>,
    prompts: Arc<PromptLibrary>,
    audio: AudioConfig,
    story: StoryConfig,
    triggers: TriggerSet,
    model_permits: Arc<Semaphore>,
    phase_deadline: Option<Duration>,
}

impl StoryController {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        synthesizer: Arc<dyn Synthesizer>,
        prompts: PromptLibrary,
        audio: AudioConfig,
        story: StoryConfig,
    ) -> Self {
        let triggers = TriggerSet::new(&story.triggers);
        let model_permits = Arc::new(Semaphore::new(story.model_concurrency.max(1)));
        let phase_deadline = story.phase_deadline_seconds.map(Duration::from_secs);
        Self {
            llm,
            synthesizer,
            prompts: Arc::new(prompts),
            audio,
            story,
            triggers,
            model_permits,
            phase_deadline,
        }
    }

    pub fn triggers(&self) -> &TriggerSet {
        &self.triggers
    }

    /// Creates an idle session writing to `sink`.
    pub fn session(&self, sink: Arc<dyn PlaybackSink>) -> Arc<StorySession> {
        let sequencer = Arc::new(Sequencer::new(Arc::clone(&sink)));
        let voices = Arc::new(VoiceAssigner::from_config(&self.audio));
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.synthesizer),
            Arc::clone(&sequencer),
            voices,
            self.audio.concurrency,
        );
        let (stage, _) = watch::channel(StoryStage::Idle);

        Arc::new(StorySession {
            llm: Arc::clone(&self.llm),
            prompts: Arc::clone(&self.prompts),
            story: self.story.clone(),
            model_permits: Arc::clone(&self.model_permits),
            phase_deadline: self.phase_deadline,
            sink,
            sequencer,
            dispatcher,
            stage,
            state: Mutex::new(SessionState::default()),
            driver: Mutex::new(None),
            interrupting: tokio::sync::Mutex::new(()),
        })
    }

    pub fn start(&self, utterance: &str, sink: Arc<dyn PlaybackSink>) -> Arc<StorySession> {
        let session = self.session(sink);
        session.begin(utterance, self.triggers.is_bare(utterance));
        session
    }
}

#[derive(Debug, Default)]
struct SessionState {
    next_phase: u64,
    phases: Vec<Phase>,
    interrupted: bool,
    outline: Option<String>,
    /// Text of the latest continuation, fed back as context.
    before: String,
    continuations: usize,
}

type PhaseFailure = (u64, PipelineError);

pub struct StorySession {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    story: StoryConfig,
    model_permits: Arc<Semaphore>,
    phase_deadline: Option<Duration>,
    sink: Arc<dyn PlaybackSink>,
    sequencer: Arc<Sequencer>,
    dispatcher: Dispatcher,
    stage: watch::Sender<StoryStage>,
    state: Mutex<SessionState>,
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Held for a whole `interrupt` call so only one driver is ever running.
    interrupting: tokio::sync::Mutex<()>,
}

impl StorySession {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stage(&self) -> StoryStage {
        *self.stage.borrow()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.lock().phases.clone()
    }

    pub fn outline(&self) -> Option<String> {
        self.lock().outline.clone()
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    /// Resolves once the session has ended and its last phase has drained.
    pub async fn wait_finished(&self) {
        let mut rx = self.stage.subscribe();
        let _ = rx.wait_for(|stage| stage.is_ended()).await;
    }

    fn set_stage(&self, next: StoryStage) -> bool {
        let mut from = None;
        self.stage.send_if_modified(|stage| {
            if stage.can_transition_to(next) {
                from = Some(*stage);
                *stage = next;
                true
            } else {
                false
            }
        });
        match from {
            Some(prev) => {
                info!("Story stage {:?} -> {:?}", prev, next);
                true
            }
            None => {
                debug!("Ignoring stage change {:?} -> {:?}", self.stage(), next);
                false
            }
        }
    }

    fn set_driver(&self, handle: JoinHandle<()>) {
        *self.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn begin(self: &Arc<Self>, utterance: &str, bare_trigger: bool) {
        let session = Arc::clone(self);
        let utterance = utterance.to_string();
        self.set_driver(tokio::spawn(async move {
            session.run(utterance, bare_trigger).await;
        }));
    }

    fn allocate_phase(&self, kind: PhaseKind) -> u64 {
        let index = {
            let mut state = self.lock();
            let index = state.next_phase;
            state.next_phase += 1;
            state.phases.push(Phase::new(index, kind));
            index
        };
        debug!("Allocated phase={} ({})", index, kind);
        index
    }

    /// Bounds the time between the model reply for `phase` and its segment
    /// count.
    fn arm_deadline(&self, phase: u64) {
        let Some(deadline) = self.phase_deadline else {
            return;
        };
        let sequencer = Arc::clone(&self.sequencer);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    if sequencer.expire_phase(phase) {
                        error!("phase={} missed its {:?} deadline", phase, deadline);
                    }
                }
                _ = sequencer.wait_retired(phase) => {}
            }
        });
    }

    fn phase(&self, index: u64) -> Option<Phase> {
        self.lock().phases.iter().find(|p| p.index == index).cloned()
    }

    /// Fixes the phase length and hands its segments to synthesis.
    fn finish_phase(&self, phase: u64, segments: Vec<Segment>, ended: bool) {
        {
            let mut state = self.lock();
            if let Some(p) = state.phases.iter_mut().find(|p| p.index == phase) {
                p.segment_count = Some(segments.len());
                p.ended = ended;
            }
        }
        info!("phase={} produced {} segments", phase, segments.len());
        // Synthesis is fire-and-forget; the sequencer tracks completion.
        drop(self.dispatcher.dispatch_phase(phase, segments));
    }

    async fn call_model(&self, template_name: &str, input: &Value) -> Result<String> {
        let template = self.prompts.get(template_name)?;
        let system = template.formatted_prompt();
        let user = template.input_prompt(input)?;

        let _permit = self
            .model_permits
            .acquire()
            .await
            .map_err(|_| anyhow!("model pool closed"))?;
        debug!("Calling model for {}", template_name);
        collect_stream(self.llm.chat_stream(&system, &user)).await
    }

    fn parse_response(&self, phase: u64, template_name: &str, raw: &str) -> ParsedResponse {
        let schema = self
            .prompts
            .get(template_name)
            .ok()
            .and_then(|t| t.output.as_ref());
        let Some(schema) = schema else {
            return fallback_segments(raw);
        };
        match parse(raw, schema, true) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    "phase={} {}; reading response as prose",
                    phase,
                    PipelineError::Parse(e)
                );
                fallback_segments(raw)
            }
        }
    }

    async fn run(self: Arc<Self>, utterance: String, bare_trigger: bool) {
        if !self.set_stage(StoryStage::ThemeExtraction) {
            return;
        }
        match self.theme_phase(&utterance, bare_trigger).await {
            Ok(theme) => self.tell_from_theme(theme).await,
            Err((phase, e)) => self.fail(phase, e).await,
        }
    }

    async fn theme_phase(&self, utterance: &str, bare_trigger: bool) -> Result<Value, PhaseFailure> {
        let kind = PhaseKind::ThemeExtraction;
        let phase = self.allocate_phase(kind);
        let intro = self
            .story
            .intro_text
            .iter()
            .map(|text| Segment::narration(phase, 0, text.clone()))
            .collect();
        self.finish_phase(phase, intro, false);

        if bare_trigger {
            info!("Bare story request, skipping theme extraction");
            return Ok(Value::Null);
        }

        let raw = self
            .call_model(kind.template_name(), &json!({ "text": utterance }))
            .await
            .map_err(|source| (phase, PipelineError::ModelCall { phase, source }))?;

        let parsed = self.parse_response(phase, kind.template_name(), &raw);
        if parsed.document.is_null() {
            // Unstructured theme; the outline prompt can still use it.
            return Ok(Value::String(raw.trim().to_string()));
        }
        info!("Story theme: {}", parsed.document);
        Ok(parsed.document)
    }

    fn enter_outline(&self) -> bool {
        self.stage() == StoryStage::OutlineGeneration || self.set_stage(StoryStage::OutlineGeneration)
    }

    async fn tell_from_theme(self: &Arc<Self>, theme: Value) {
        if !self.enter_outline() {
            return;
        }
        match self.outline_phase(theme).await {
            Ok(()) => self.continue_story().await,
            Err((phase, e)) => self.fail(phase, e).await,
        }
    }

    async fn outline_phase(&self, theme: Value) -> Result<(), PhaseFailure> {
        let kind = PhaseKind::OutlineGeneration;
        let phase = self.allocate_phase(kind);
        let raw = self
            .call_model(kind.template_name(), &json!({ "theme": theme }))
            .await
            .map_err(|source| (phase, PipelineError::ModelCall { phase, source }))?;
        self.arm_deadline(phase);

        let parsed = self.parse_response(phase, kind.template_name(), &raw);
        let outline = if parsed.document.is_null() {
            raw.trim().to_string()
        } else {
            parsed.document.to_string()
        };
        {
            let mut state = self.lock();
            state.outline = Some(outline);
            state.before.clear();
            state.continuations = 0;
        }
        self.finish_phase(phase, parsed.into_segments(phase), false);
        Ok(())
    }

    async fn continuation_phase(&self) -> Result<(u64, bool), PhaseFailure> {
        let kind = PhaseKind::Continuation;
        let phase = self.allocate_phase(kind);
        let input = {
            let state = self.lock();
            json!({
                "outline": state.outline.clone().unwrap_or_default(),
                "before": state.before,
            })
        };
        let raw = self
            .call_model(kind.template_name(), &input)
            .await
            .map_err(|source| (phase, PipelineError::ModelCall { phase, source }))?;
        self.arm_deadline(phase);

        let parsed = self.parse_response(phase, kind.template_name(), &raw);
        let ended = parsed.ended;
        let segments = parsed.into_segments(phase);
        {
            let mut state = self.lock();
            state.before = segments
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
        }
        self.finish_phase(phase, segments, ended);
        Ok((phase, ended))
    }

    /// Schedules continuation phases one after another until one ends the
    /// story or scheduling is stopped.
    async fn continue_story(self: &Arc<Self>) {
        let mut last_phase = None;
        loop {
            {
                let mut state = self.lock();
                if state.interrupted {
                    info!("Story interrupted, not scheduling further phases");
                    return;
                }
                if state.continuations >= self.story.max_continuations {
                    info!("Reached {} continuation rounds, ending story", state.continuations);
                    break;
                }
                state.continuations += 1;
            }
            if self.stage().is_ended() || !self.set_stage(StoryStage::Continuation) {
                return;
            }

            let session = Arc::clone(self);
            let step = tokio::spawn(async move { session.continuation_phase().await });
            match step.await {
                Ok(Ok((phase, ended))) => {
                    last_phase = Some(phase);
                    if ended {
                        info!("phase={} concluded the story", phase);
                        break;
                    }
                }
                Ok(Err((phase, e))) => return self.fail(phase, e).await,
                Err(join_error) => {
                    let phase = self.lock().next_phase.saturating_sub(1);
                    let source = anyhow!("continuation task failed: {}", join_error);
                    return self.fail(phase, PipelineError::ModelCall { phase, source }).await;
                }
            }
        }
        let last = last_phase.unwrap_or_else(|| self.lock().next_phase.saturating_sub(1));
        self.finish(last).await;
    }

    /// Speaks the apology and stops scheduling.
    async fn fail(&self, phase: u64, err: PipelineError) {
        error!("{:#}", anyhow::Error::from(err));
        // A phase whose count is already announced cannot grow.
        let target = match self.phase(phase) {
            Some(p) if p.segment_count.is_some() => self.allocate_phase(p.kind),
            _ => phase,
        };
        let apology = Segment::narration(target, 0, self.story.apology_text.clone());
        self.finish_phase(target, vec![apology], true);
        self.finish(target).await;
    }

    async fn finish(&self, last_phase: u64) {
        self.sequencer.wait_retired(last_phase).await;
        self.set_stage(StoryStage::Ended);
    }

    async fn classify(&self, input: &str) -> InterruptDecision {
        let outline = self.outline().unwrap_or_default();
        let raw = match self
            .call_model(RELEVANCE_CHECK, &json!({ "input": input, "outline": outline }))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Relevance check failed, continuing story: {:#}", e);
                return InterruptDecision::Continue;
            }
        };

        let label = self
            .prompts
            .get(RELEVANCE_CHECK)
            .ok()
            .and_then(|t| t.output.as_ref())
            .and_then(|schema| parse(&raw, schema, true).ok())
            .and_then(|parsed| parsed.document.get("decision").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(raw);
        InterruptDecision::from_label(&label)
    }

    /// Handles new listener input while the story is running. The phase in
    /// flight always finishes first.
    pub async fn interrupt(self: &Arc<Self>, input: &str) -> InterruptDecision {
        let _turn = self.interrupting.lock().await;
        if self.stage().is_ended() {
            return InterruptDecision::Exit;
        }
        self.lock().interrupted = true;
        info!("Story interrupted by: {}", input);

        let prior = self.take_driver();
        let (decision, _) = tokio::join!(self.classify(input), async {
            if let Some(handle) = prior {
                if let Err(e) = handle.await {
                    error!("Story driver failed: {}", e);
                }
            }
        });
        info!("Interruption decision: {:?}", decision);

        if self.stage().is_ended() {
            return InterruptDecision::Exit;
        }
        self.lock().interrupted = false;

        match decision {
            InterruptDecision::Continue => {
                let session = Arc::clone(self);
                self.set_driver(tokio::spawn(async move { session.continue_story().await }));
            }
            InterruptDecision::Restart => {
                let session = Arc::clone(self);
                let theme = Value::String(input.to_string());
                self.set_driver(tokio::spawn(async move { session.tell_from_theme(theme).await }));
            }
            InterruptDecision::Exit => {
                self.set_stage(StoryStage::Ended);
                self.sink.close();
            }
        }
        decision
    }
}
