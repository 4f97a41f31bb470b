use crate::core::error::ParseError;
use crate::core::state::{Gender, Segment, Speaker};
use crate::services::schema::{Schema, SegmentLayout};
use crate::utils::text::{split_sentences, strip_code_blocks, trim_punctuation};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpokenLine {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub document: Value,
    pub lines: Vec<SpokenLine>,
    pub ended: bool,
}

impl ParsedResponse {
    /// Assigns dense segment indices in parse order.
    pub fn into_segments(self, phase_index: u64) -> Vec<Segment> {
        self.lines
            .into_iter()
            .enumerate()
            .map(|(index, line)| Segment {
                phase_index,
                index,
                speaker: line.speaker,
                text: line.text,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Default)]
struct SegmentItem {
    #[serde(default)]
    is_role: bool,
    #[serde(default)]
    role_name: Option<String>,
    #[serde(default)]
    role_gender: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    mood: Option<String>,
    #[serde(default)]
    mood_location: Option<i64>,
}

impl SegmentItem {
    fn into_line(self) -> Option<SpokenLine> {
        let content = self.content.trim();
        if trim_punctuation(content).is_empty() {
            return None;
        }

        let name = self.role_name.as_deref().map(str::trim).unwrap_or("");
        if !self.is_role || name.is_empty() {
            return Some(SpokenLine {
                speaker: Speaker::Narrator,
                text: content.to_string(),
            });
        }

        let mood = self.mood.as_deref().map(str::trim).filter(|m| !m.is_empty());
        let text = match (mood, self.mood_location) {
            (Some(mood), Some(1)) => format!("{}, {}, says: {}", name, mood, content),
            (Some(mood), _) => format!("{} says: {} {}", name, content, mood),
            (None, _) => format!("{} says: {}", name, content),
        };
        Some(SpokenLine {
            speaker: Speaker::character(name, self.role_gender.as_deref().and_then(Gender::parse)),
            text,
        })
    }
}

/// Every balanced `{...}` substring of `text`, nested ones included, longest
/// first. Braces inside JSON string literals are ignored.
pub fn json_candidates(text: &str) -> Vec<&str> {
    let mut candidates: Vec<&str> = text
        .match_indices('{')
        .filter_map(|(start, _)| balanced_object(text, start))
        .collect();

    // stable: equal lengths keep their textual order
    candidates.sort_by(|a, b| b.len().cmp(&a.len()));
    candidates
}

/// The object opening at `start`, if its braces close before the text ends.
fn balanced_object(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn decode_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

pub fn extract_json(raw_text: &str) -> Result<Value, ParseError> {
    let cleaned = strip_code_blocks(raw_text);
    if let Some(value) = decode_object(&cleaned) {
        return Ok(value);
    }

    for (attempt, candidate) in json_candidates(&cleaned).into_iter().enumerate() {
        match decode_object(candidate) {
            Some(value) => {
                debug!("Decoded JSON candidate #{} ({} bytes)", attempt, candidate.len());
                return Ok(value);
            }
            None => debug!("JSON candidate #{} failed to decode", attempt),
        }
    }
    Err(ParseError::NoJsonObject)
}

/// Parses a model response against `schema`.
///
/// With `require_fields`, a missing required field is an error; otherwise the
/// response is shaped best-effort and missing optional fields are defaulted.
pub fn parse(raw_text: &str, schema: &Schema, require_fields: bool) -> Result<ParsedResponse, ParseError> {
    let value = extract_json(raw_text)?;

    let problems = schema.validate(&value);
    if !problems.is_empty() {
        if require_fields {
            return Err(ParseError::MissingFields { fields: problems });
        }
        warn!("Response does not satisfy schema '{}': {}", schema.title, problems.join(", "));
    }

    let document = schema.shape(&value);
    let lines = extract_lines(&document, &schema.segments);
    let ended = schema
        .ended_field
        .as_ref()
        .and_then(|field| document.get(field))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(ParsedResponse {
        document,
        lines,
        ended,
    })
}

fn extract_lines(document: &Value, layout: &SegmentLayout) -> Vec<SpokenLine> {
    match layout {
        SegmentLayout::None => Vec::new(),
        SegmentLayout::Items { field } => document
            .get(field)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value::<SegmentItem>(item.clone()).ok())
                    .filter_map(SegmentItem::into_line)
                    .collect()
            })
            .unwrap_or_default(),
        SegmentLayout::Summary { fields } => fields
            .iter()
            .filter_map(|summary| {
                let rendered = match document.get(&summary.field)? {
                    Value::String(s) => s.trim().to_string(),
                    Value::Array(items) => items
                        .iter()
                        .filter_map(|item| match item {
                            Value::String(s) => Some(s.trim().to_string()),
                            Value::Null => None,
                            other => Some(other.to_string()),
                        })
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join(", "),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                if rendered.is_empty() {
                    return None;
                }
                Some(SpokenLine {
                    speaker: Speaker::Narrator,
                    text: format!("{}{}", summary.label, rendered),
                })
            })
            .collect(),
    }
}

/// Treats `raw_text` as plain prose: one narration line per sentence.
pub fn fallback_segments(raw_text: &str) -> ParsedResponse {
    let lines = split_sentences(&strip_code_blocks(raw_text))
        .into_iter()
        .map(|text| SpokenLine {
            speaker: Speaker::Narrator,
            text,
        })
        .collect();
    ParsedResponse {
        document: Value::Null,
        lines,
        ended: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::prompts::{PromptLibrary, OUTLINE_GENERATION, STORY_CONTINUATION};
    use serde_json::json;

    fn continuation_schema() -> Schema {
        PromptLibrary::default()
            .get(STORY_CONTINUATION)
            .ok()
            .and_then(|t| t.output.clone())
            .unwrap()
    }

    #[test]
    fn test_candidates_nested_and_strings() {
        let text = r#"noise {"a": {"b": 1}, "s": "brace } in string"} tail {"c": 2}"#;
        let candidates = json_candidates(text);
        assert_eq!(candidates[0], r#"{"a": {"b": 1}, "s": "brace } in string"}"#);
        assert!(candidates.contains(&r#"{"b": 1}"#));
        assert!(candidates.contains(&r#"{"c": 2}"#));
    }

    #[test]
    fn test_stray_quote_in_prose_keeps_later_objects() -> anyhow::Result<()> {
        let text = r#"He said "{" twice. {"a":1}"#;
        assert!(json_candidates(text).contains(&r#"{"a":1}"#));
        assert_eq!(extract_json(text)?, json!({ "a": 1 }));

        let text = r#"The sign read "{oops. Then: {"story_seg": [], "ended": true}"#;
        assert_eq!(extract_json(text)?["ended"], json!(true));
        Ok(())
    }

    #[test]
    fn test_unclosed_brace_yields_no_candidate() {
        assert!(json_candidates(r#"{"a": {"b": 1}"#).contains(&r#"{"b": 1}"#));
        assert_eq!(json_candidates(r#"{"a": {"b": 1}"#).len(), 1);
        assert!(json_candidates("no braces here").is_empty());
    }

    #[test]
    fn test_extract_prefers_longest_then_falls_back() -> anyhow::Result<()> {
        // The longest candidate is broken JSON; the next one decodes.
        let text = r#"Here: {"story_seg": [ {"content": "x",} ], "junk": {"ended": true}}"#;
        let value = extract_json(text)?;
        assert_eq!(value, json!({ "ended": true }));
        Ok(())
    }

    #[test]
    fn test_extract_code_fence() -> anyhow::Result<()> {
        let value = extract_json("```json\n{\"title\": \"Fox\"}\n```")?;
        assert_eq!(value["title"], json!("Fox"));
        Ok(())
    }

    #[test]
    fn test_parse_continuation_segments_in_array_order() -> anyhow::Result<()> {
        let raw = r#"Sure! Here is the next part:
{
  "story_seg": [
    {"is_role": false, "content": "The moon rose over the hill."},
    {"is_role": true, "role_name": "Fox", "role_gender": "male", "content": "Who goes there?", "mood": "nervously", "mood_location": 1},
    {"is_role": true, "role_name": "Owl", "role_gender": "female", "content": "Only me.", "mood": "softly", "mood_location": 2},
    {"is_role": false, "content": "   "}
  ],
  "ended": true
}"#;
        let parsed = parse(raw, &continuation_schema(), true)?;
        assert!(parsed.ended);

        let segments = parsed.into_segments(4);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment::narration(4, 0, "The moon rose over the hill."));
        assert_eq!(segments[1].index, 1);
        assert_eq!(segments[1].speaker, Speaker::character("Fox", Some(Gender::Male)));
        assert_eq!(segments[1].text, "Fox, nervously, says: Who goes there?");
        assert_eq!(segments[2].text, "Owl says: Only me. softly");
        Ok(())
    }

    #[test]
    fn test_parse_missing_required_fields() {
        let err = parse(r#"{"ended": false}"#, &continuation_schema(), true).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingFields {
                fields: vec!["story_seg".to_string()]
            }
        );

        let parsed = parse(r#"{"ended": true}"#, &continuation_schema(), false).unwrap();
        assert!(parsed.lines.is_empty());
        assert!(parsed.ended);
    }

    #[test]
    fn test_ended_defaults_false() -> anyhow::Result<()> {
        let parsed = parse(
            r#"{"story_seg": [{"is_role": false, "content": "Hi."}]}"#,
            &continuation_schema(),
            true,
        )?;
        assert!(!parsed.ended);
        Ok(())
    }

    #[test]
    fn test_plain_prose_raises_then_falls_back() {
        let raw = "Once upon a time...";
        assert_eq!(
            parse(raw, &continuation_schema(), true).unwrap_err(),
            ParseError::NoJsonObject
        );

        let segments = fallback_segments(raw).into_segments(0);
        assert_eq!(segments, vec![Segment::narration(0, 0, "Once upon a time")]);
    }

    #[test]
    fn test_outline_summary_lines() -> anyhow::Result<()> {
        let schema = PromptLibrary::default()
            .get(OUTLINE_GENERATION)?
            .output
            .clone()
            .unwrap();
        let parsed = parse(
            r#"{"title": "The Brave Fox", "roles": ["Fox", "Owl"], "plot": ["a", "b"]}"#,
            &schema,
            true,
        )?;
        let texts: Vec<String> = parsed.lines.into_iter().map(|l| l.text).collect();
        assert_eq!(
            texts,
            vec![
                "Our story is called: The Brave Fox".to_string(),
                "In this story you will meet: Fox, Owl".to_string(),
            ]
        );
        Ok(())
    }
}
