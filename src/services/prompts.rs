use crate::core::state::PhaseKind;
use crate::services::schema::{FieldSchema, FieldType, Schema, SegmentLayout, SummaryField};
use anyhow::{anyhow, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const THEME_EXTRACTION: &str = PhaseKind::ThemeExtraction.template_name();
pub const OUTLINE_GENERATION: &str = PhaseKind::OutlineGeneration.template_name();
pub const STORY_CONTINUATION: &str = PhaseKind::Continuation.template_name();
pub const RELEVANCE_CHECK: &str = "relevance_check";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub min_tokens: Option<u32>,
    #[serde(default)]
    pub input: Option<Schema>,
    #[serde(default)]
    pub output: Option<Schema>,
}

impl PromptTemplate {
    /// System prompt: template text, token-limit note, then the output schema
    /// instruction.
    pub fn formatted_prompt(&self) -> String {
        let mut prompt = self.template.trim_end().to_string();

        let mut limits = Vec::new();
        if let Some(max) = self.max_tokens {
            limits.push(format!("at most {} tokens", max));
        }
        if let Some(min) = self.min_tokens {
            limits.push(format!("at least {} tokens", min));
        }
        if !limits.is_empty() {
            prompt.push_str(&format!("\n\nKeep this response to {}.", limits.join(" and ")));
            if self.output.is_some() && self.max_tokens.is_some() {
                prompt.push_str(
                    " If the limit would truncate the JSON, ignore it: a complete, parseable JSON object comes first.",
                );
            }
        }

        if let Some(schema) = &self.output {
            prompt.push_str("\n\n");
            prompt.push_str(&schema.instruction());
        }
        prompt
    }

    /// Serialises `values` as the user prompt after checking them against the
    /// input schema.
    pub fn input_prompt(&self, values: &Value) -> Result<String> {
        let shaped = match &self.input {
            Some(schema) => {
                let problems = schema.validate(values);
                if !problems.is_empty() {
                    return Err(anyhow!(
                        "Input for template '{}' is missing required fields: {}",
                        self.name,
                        problems.join(", ")
                    ));
                }
                schema.shape(values)
            }
            None => values.clone(),
        };
        Ok(serde_json::to_string(&shaped)?)
    }
}

/// Templates for every phase, keyed by name.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    templates: HashMap<String, PromptTemplate>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        let mut templates = HashMap::new();
        for template in default_templates() {
            templates.insert(template.name.clone(), template);
        }
        Self { templates }
    }
}

impl PromptLibrary {
    /// Defaults, with any templates in `path` replacing them by name.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut library = Self::default();
        if let Some(path) = path {
            let content = fs::read_to_string(Path::new(path))
                .with_context(|| format!("Failed to read prompt file {}", path))?;
            let count = library.merge_yaml(&content)?;
            info!("Loaded {} prompt templates from {}", count, path);
        }
        Ok(library)
    }

    pub fn merge_yaml(&mut self, content: &str) -> Result<usize> {
        let overrides: HashMap<String, PromptTemplate> =
            serde_yaml_ng::from_str(content).context("Failed to parse prompt templates")?;
        let count = overrides.len();
        for (name, mut template) in overrides {
            template.name = name.clone();
            self.templates.insert(name, template);
        }
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Result<&PromptTemplate> {
        self.templates
            .get(name)
            .ok_or_else(|| anyhow!("Prompt template '{}' not found", name))
    }
}

fn segment_item_schema() -> FieldSchema {
    FieldSchema::new(FieldType::Object)
        .property(
            "is_role",
            FieldSchema::new(FieldType::Boolean)
                .required()
                .describe("true for a character line, false for narration"),
        )
        .property(
            "content",
            FieldSchema::new(FieldType::String)
                .required()
                .describe("the words spoken"),
        )
        .property(
            "role_name",
            FieldSchema::new(FieldType::String).describe("speaking character, for character lines"),
        )
        .property(
            "role_gender",
            FieldSchema::new(FieldType::String).describe("male or female"),
        )
        .property(
            "mood",
            FieldSchema::new(FieldType::String).describe("how the line is delivered"),
        )
        .property(
            "mood_location",
            FieldSchema::new(FieldType::Integer)
                .describe("1 when the mood is spoken before the line, 2 after"),
        )
}

fn default_templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate {
            name: THEME_EXTRACTION.to_string(),
            template: "You help a storyteller understand what story the listener asked for. \
                       Read the listener's request and recent conversation and describe the theme, \
                       intended audience and style of the story."
                .to_string(),
            max_tokens: Some(200),
            min_tokens: None,
            input: Some(
                Schema::new("ThemeRequest")
                    .field("text", FieldSchema::new(FieldType::String).required())
                    .field("user_info", FieldSchema::new(FieldType::Object)),
            ),
            output: Some(
                Schema::new("StoryTheme")
                    .field("theme", FieldSchema::new(FieldType::String).required())
                    .field("age_group", FieldSchema::new(FieldType::String))
                    .field("style", FieldSchema::new(FieldType::String))
                    .field(
                        "has_explicit_theme",
                        FieldSchema::new(FieldType::Boolean)
                            .describe("false when the listener gave no concrete theme"),
                    ),
            ),
        },
        PromptTemplate {
            name: OUTLINE_GENERATION.to_string(),
            template: "You are a storyteller planning a story that will be read aloud. \
                       Given the theme, write a short outline: a title, the cast of characters \
                       and the main beats of the plot."
                .to_string(),
            max_tokens: Some(800),
            min_tokens: None,
            input: None,
            output: Some(
                Schema::new("StoryOutline")
                    .field("title", FieldSchema::new(FieldType::String).required())
                    .field(
                        "roles",
                        FieldSchema::new(FieldType::Array)
                            .required()
                            .items(FieldSchema::new(FieldType::String)),
                    )
                    .field(
                        "plot",
                        FieldSchema::new(FieldType::Array).items(FieldSchema::new(FieldType::String)),
                    )
                    .with_segments(SegmentLayout::Summary {
                        fields: vec![
                            SummaryField {
                                field: "title".to_string(),
                                label: "Our story is called: ".to_string(),
                            },
                            SummaryField {
                                field: "roles".to_string(),
                                label: "In this story you will meet: ".to_string(),
                            },
                        ],
                    }),
            ),
        },
        PromptTemplate {
            name: STORY_CONTINUATION.to_string(),
            template: "You are a storyteller reading a story aloud, one passage at a time. \
                       Follow the outline and continue from where the previous passage stopped. \
                       Split the passage into narration and character lines in speaking order. \
                       Set ended to true only when the story has reached its conclusion."
                .to_string(),
            max_tokens: Some(1200),
            min_tokens: Some(300),
            input: Some(
                Schema::new("ContinuationRequest")
                    .field("outline", FieldSchema::new(FieldType::String).required())
                    .field("before", FieldSchema::new(FieldType::String)),
            ),
            output: Some(
                Schema::new("StoryContinuation")
                    .field(
                        "story_seg",
                        FieldSchema::new(FieldType::Array)
                            .required()
                            .items(segment_item_schema()),
                    )
                    .field(
                        "ended",
                        FieldSchema::new(FieldType::Boolean).describe("true once the story is over"),
                    )
                    .with_segments(SegmentLayout::Items {
                        field: "story_seg".to_string(),
                    })
                    .with_ended_field("ended"),
            ),
        },
        PromptTemplate {
            name: RELEVANCE_CHECK.to_string(),
            template: "A listener interrupted a story that is being read aloud. Decide what they want: \
                       \"continue\" if the remark is about the current story or asks to go on, \
                       \"restart\" if they ask for a different story, \
                       \"exit\" if they want to stop listening."
                .to_string(),
            max_tokens: Some(50),
            min_tokens: None,
            input: Some(
                Schema::new("RelevanceRequest")
                    .field("input", FieldSchema::new(FieldType::String).required())
                    .field("outline", FieldSchema::new(FieldType::String)),
            ),
            output: Some(
                Schema::new("RelevanceDecision").field(
                    "decision",
                    FieldSchema::new(FieldType::String)
                        .required()
                        .describe("one of continue, restart, exit"),
                ),
            ),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_phase_kind_has_a_template() -> Result<()> {
        let library = PromptLibrary::default();
        for kind in [
            PhaseKind::ThemeExtraction,
            PhaseKind::OutlineGeneration,
            PhaseKind::Continuation,
        ] {
            assert_eq!(library.get(kind.template_name())?.name, kind.to_string());
        }
        Ok(())
    }

    #[test]
    fn test_defaults_present() -> Result<()> {
        let library = PromptLibrary::default();
        for name in [THEME_EXTRACTION, OUTLINE_GENERATION, STORY_CONTINUATION, RELEVANCE_CHECK] {
            assert_eq!(library.get(name)?.name, name);
        }
        assert!(library.get("nope").is_err());
        Ok(())
    }

    #[test]
    fn test_formatted_prompt_includes_limits_and_schema() -> Result<()> {
        let library = PromptLibrary::default();
        let prompt = library.get(STORY_CONTINUATION)?.formatted_prompt();
        assert!(prompt.contains("at most 1200 tokens and at least 300 tokens"));
        assert!(prompt.contains("story_seg"));
        assert!(prompt.contains("```json"));
        Ok(())
    }

    #[test]
    fn test_input_prompt_validates() -> Result<()> {
        let library = PromptLibrary::default();
        let template = library.get(STORY_CONTINUATION)?;

        let prompt = template.input_prompt(&json!({ "outline": "a fox and a crow" }))?;
        let decoded: Value = serde_json::from_str(&prompt)?;
        assert_eq!(decoded["before"], json!(""));

        assert!(template.input_prompt(&json!({ "before": "..." })).is_err());
        Ok(())
    }

    #[test]
    fn test_merge_yaml_overrides() -> Result<()> {
        let mut library = PromptLibrary::default();
        let count = library.merge_yaml(
            r#"
outline_generation:
  template: "Plan a bedtime story."
  max_tokens: 100
"#,
        )?;
        assert_eq!(count, 1);
        let template = library.get(OUTLINE_GENERATION)?;
        assert_eq!(template.name, OUTLINE_GENERATION);
        assert!(template.output.is_none());
        assert!(template.formatted_prompt().starts_with("Plan a bedtime story."));
        Ok(())
    }
}
