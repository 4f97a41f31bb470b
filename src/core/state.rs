use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    ThemeExtraction,
    OutlineGeneration,
    Continuation,
}

impl PhaseKind {
    /// Name of the prompt template driving this phase.
    pub const fn template_name(self) -> &'static str {
        match self {
            PhaseKind::ThemeExtraction => "theme_extraction",
            PhaseKind::OutlineGeneration => "outline_generation",
            PhaseKind::Continuation => "story_continuation",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.template_name())
    }
}

/// One round of narrative generation.
///
/// `segment_count` stays `None` until the response has been parsed and is never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub index: u64,
    pub kind: PhaseKind,
    pub segment_count: Option<usize>,
    pub ended: bool,
}

impl Phase {
    pub fn new(index: u64, kind: PhaseKind) -> Self {
        Self {
            index,
            kind,
            segment_count: None,
            ended: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    #[serde(alias = "male")]
    Male,
    #[serde(alias = "female")]
    Female,
}

impl Gender {
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim().to_lowercase();
        match s.as_str() {
            "male" | "m" | "man" | "boy" | "男" | "男性" => Some(Gender::Male),
            "female" | "f" | "woman" | "girl" | "女" | "女性" => Some(Gender::Female),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Speaker {
    Narrator,
    Character {
        name: String,
        gender: Option<Gender>,
    },
}

impl Speaker {
    pub fn character(name: impl Into<String>, gender: Option<Gender>) -> Self {
        Speaker::Character {
            name: name.into(),
            gender,
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Narrator => f.write_str("narrator"),
            Speaker::Character { name, .. } => f.write_str(name),
        }
    }
}

/// One spoken unit of a phase. `index` is dense and assigned in parse order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub phase_index: u64,
    pub index: usize,
    pub speaker: Speaker,
    pub text: String,
}

impl Segment {
    pub fn narration(phase_index: u64, index: usize, text: impl Into<String>) -> Self {
        Self {
            phase_index,
            index,
            speaker: Speaker::Narrator,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioArtifact {
    pub data: Vec<u8>,
    /// Set when the artifact came from the fallback path rather than the
    /// segment's assigned voice.
    pub degraded: bool,
}

impl AudioArtifact {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            degraded: false,
        }
    }

    pub fn silence() -> Self {
        Self {
            data: Vec::new(),
            degraded: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisResult {
    pub phase_index: u64,
    pub segment_index: usize,
    pub audio: AudioArtifact,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoryStage {
    Idle,
    ThemeExtraction,
    OutlineGeneration,
    Continuation,
    Ended,
}

impl StoryStage {
    pub fn can_transition_to(self, next: StoryStage) -> bool {
        use StoryStage::*;
        matches!(
            (self, next),
            (Idle, ThemeExtraction)
                | (Idle, Ended)
                | (ThemeExtraction, OutlineGeneration)
                | (ThemeExtraction, Ended)
                | (OutlineGeneration, Continuation)
                | (OutlineGeneration, Ended)
                | (Continuation, Continuation)
                | (Continuation, OutlineGeneration)
                | (Continuation, Ended)
        )
    }

    pub fn is_ended(self) -> bool {
        self == StoryStage::Ended
    }
}
