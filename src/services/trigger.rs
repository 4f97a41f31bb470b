use crate::utils::text::trim_punctuation;

/// Phrases that switch the assistant into story mode.
pub fn default_triggers() -> Vec<String> {
    [
        "讲个故事",
        "开始故事",
        "故事模式",
        "讲故事",
        "讲一个故事",
        "说个故事",
        "故事时间",
        "开启故事模式",
        "tell me a story",
        "tell a story",
        "story time",
        "story mode",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone)]
pub struct TriggerSet {
    phrases: Vec<String>,
}

impl TriggerSet {
    pub fn new(phrases: &[String]) -> Self {
        let mut phrases: Vec<String> = phrases
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        // Longest first so "开启故事模式" is stripped before "故事模式".
        phrases.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then_with(|| a.cmp(b)));
        phrases.dedup();
        Self { phrases }
    }

    /// First trigger phrase contained in `utterance`.
    pub fn matched(&self, utterance: &str) -> Option<&str> {
        let lowered = utterance.to_lowercase();
        self.phrases
            .iter()
            .find(|p| lowered.contains(p.as_str()))
            .map(String::as_str)
    }

    pub fn is_trigger(&self, utterance: &str) -> bool {
        self.matched(utterance).is_some()
    }

    /// True when the utterance is nothing but a trigger phrase, so there is no
    /// theme to extract.
    pub fn is_bare(&self, utterance: &str) -> bool {
        let mut rest = utterance.to_lowercase();
        let mut found = false;
        for phrase in &self.phrases {
            if rest.contains(phrase.as_str()) {
                rest = rest.replace(phrase.as_str(), " ");
                found = true;
            }
        }
        found && trim_punctuation(&rest).is_empty()
    }
}

impl Default for TriggerSet {
    fn default() -> Self {
        Self::new(&default_triggers())
    }
}
