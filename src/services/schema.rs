use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    pub fn default_value(&self) -> Value {
        match self {
            FieldType::String => Value::String(String::new()),
            FieldType::Array => Value::Array(Vec::new()),
            FieldType::Object => Value::Object(Map::new()),
            FieldType::Boolean => Value::Bool(false),
            FieldType::Integer | FieldType::Number => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FieldSchema {
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSchema>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, FieldSchema>,
}

impl FieldSchema {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            ..Default::default()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn items(mut self, items: FieldSchema) -> Self {
        self.items = Some(Box::new(items));
        self
    }

    pub fn property(mut self, name: &str, field: FieldSchema) -> Self {
        self.properties.insert(name.to_string(), field);
        self
    }
}

/// How spoken segments are derived from a decoded response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentLayout {
    #[default]
    None,
    Items { field: String },
    /// Each listed field that is present becomes one narration line,
    /// rendered as `"<label><value>"`.
    Summary { fields: Vec<SummaryField> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryField {
    pub field: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Schema {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub properties: BTreeMap<String, FieldSchema>,
    #[serde(default)]
    pub segments: SegmentLayout,
    /// Boolean field signalling the narrative is over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_field: Option<String>,
}

impl Schema {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn field(mut self, name: &str, field: FieldSchema) -> Self {
        self.properties.insert(name.to_string(), field);
        self
    }

    pub fn with_segments(mut self, layout: SegmentLayout) -> Self {
        self.segments = layout;
        self
    }

    pub fn with_ended_field(mut self, name: &str) -> Self {
        self.ended_field = Some(name.to_string());
        self
    }

    /// Returns the required fields that are missing or mistyped, as dotted
    /// paths (`story_seg[2].content`). Empty means valid.
    pub fn validate(&self, value: &Value) -> Vec<String> {
        let mut problems = Vec::new();
        match value.as_object() {
            Some(obj) => validate_object(&self.properties, obj, "", &mut problems),
            None => problems.push("<root>".to_string()),
        }
        problems
    }

    /// Best-effort copy of `value` with absent optional fields defaulted and
    /// mistyped optional fields replaced by their default.
    pub fn shape(&self, value: &Value) -> Value {
        let empty = Map::new();
        let obj = value.as_object().unwrap_or(&empty);
        Value::Object(shape_object(&self.properties, obj))
    }

    pub fn instruction(&self) -> String {
        let mut display = serde_json::json!({ "type": "object" });
        if !self.title.is_empty() {
            display["title"] = Value::String(self.title.clone());
        }
        display["properties"] = properties_json(&self.properties);
        let required: Vec<&String> = self
            .properties
            .iter()
            .filter(|(_, f)| f.required)
            .map(|(name, _)| name)
            .collect();
        display["required"] = serde_json::json!(required);

        let schema_str = serde_json::to_string_pretty(&display).unwrap_or_default();
        format!(
            "Your response must be a single JSON object matching the JSON Schema below. \
             Fields listed in \"required\" must carry meaningful content, never empty or \
             placeholder values.\n```json\n{}\n```\nMake sure the response parses as JSON \
             and matches this structure.",
            schema_str
        )
    }
}

fn properties_json(properties: &BTreeMap<String, FieldSchema>) -> Value {
    let mut out = Map::new();
    for (name, field) in properties {
        out.insert(name.clone(), field_json(field));
    }
    Value::Object(out)
}

fn field_json(field: &FieldSchema) -> Value {
    let mut v = serde_json::json!({ "type": field.field_type });
    if let Some(desc) = &field.description {
        v["description"] = Value::String(desc.clone());
    }
    if let Some(items) = &field.items {
        v["items"] = field_json(items);
    }
    if !field.properties.is_empty() {
        v["properties"] = properties_json(&field.properties);
        let required: Vec<&String> = field
            .properties
            .iter()
            .filter(|(_, f)| f.required)
            .map(|(name, _)| name)
            .collect();
        v["required"] = serde_json::json!(required);
    }
    v
}

fn validate_object(
    properties: &BTreeMap<String, FieldSchema>,
    obj: &Map<String, Value>,
    prefix: &str,
    problems: &mut Vec<String>,
) {
    for (name, field) in properties {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        match obj.get(name) {
            None | Some(Value::Null) => {
                if field.required {
                    problems.push(path);
                }
            }
            Some(value) => {
                if !field.field_type.matches(value) {
                    if field.required {
                        problems.push(path);
                    }
                    continue;
                }
                validate_nested(field, value, &path, problems);
            }
        }
    }
}

fn validate_nested(field: &FieldSchema, value: &Value, path: &str, problems: &mut Vec<String>) {
    match value {
        Value::Object(inner) if !field.properties.is_empty() => {
            validate_object(&field.properties, inner, path, problems);
        }
        Value::Array(items) => {
            let Some(item_schema) = &field.items else {
                return;
            };
            for (i, item) in items.iter().enumerate() {
                let item_path = format!("{}[{}]", path, i);
                if !item_schema.field_type.matches(item) {
                    problems.push(item_path);
                    continue;
                }
                if let Value::Object(inner) = item {
                    validate_object(&item_schema.properties, inner, &item_path, problems);
                }
            }
        }
        _ => {}
    }
}

fn shape_object(properties: &BTreeMap<String, FieldSchema>, obj: &Map<String, Value>) -> Map<String, Value> {
    let mut out = obj.clone();
    for (name, field) in properties {
        let shaped = match obj.get(name) {
            Some(value) if field.field_type.matches(value) => shape_value(field, value),
            _ => field.field_type.default_value(),
        };
        out.insert(name.clone(), shaped);
    }
    out
}

fn shape_value(field: &FieldSchema, value: &Value) -> Value {
    match value {
        Value::Object(inner) if !field.properties.is_empty() => {
            Value::Object(shape_object(&field.properties, inner))
        }
        Value::Array(items) => match &field.items {
            Some(item_schema) => Value::Array(
                items
                    .iter()
                    .filter(|item| item_schema.field_type.matches(item))
                    .map(|item| shape_value(item_schema, item))
                    .collect(),
            ),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn continuation_schema() -> Schema {
        Schema::new("StoryContinuation")
            .field(
                "story_seg",
                FieldSchema::new(FieldType::Array).required().items(
                    FieldSchema::new(FieldType::Object)
                        .property("content", FieldSchema::new(FieldType::String).required())
                        .property("is_role", FieldSchema::new(FieldType::Boolean).required())
                        .property("mood", FieldSchema::new(FieldType::String)),
                ),
            )
            .field("ended", FieldSchema::new(FieldType::Boolean))
    }

    #[test]
    fn test_validate_reports_missing_item_fields() {
        let schema = continuation_schema();
        let value = json!({
            "story_seg": [
                { "content": "a", "is_role": false },
                { "is_role": true },
                "bogus"
            ]
        });
        assert_eq!(
            schema.validate(&value),
            vec!["story_seg[1].content".to_string(), "story_seg[2]".to_string()]
        );
    }

    #[test]
    fn test_validate_missing_top_level() {
        let schema = continuation_schema();
        assert_eq!(schema.validate(&json!({ "ended": true })), vec!["story_seg"]);
        assert_eq!(schema.validate(&json!([1, 2])), vec!["<root>"]);
    }

    #[test]
    fn test_shape_defaults_optional_fields() {
        let schema = continuation_schema();
        let shaped = schema.shape(&json!({
            "story_seg": [{ "content": "a", "is_role": false }, 7],
            "extra": 1
        }));
        assert_eq!(shaped["ended"], json!(false));
        assert_eq!(shaped["extra"], json!(1));
        assert_eq!(shaped["story_seg"].as_array().map(Vec::len), Some(1));
        assert_eq!(shaped["story_seg"][0]["mood"], json!(""));
    }

    #[test]
    fn test_schema_yaml_roundtrip() -> anyhow::Result<()> {
        let yaml = r#"
title: Outline
properties:
  title: { type: string, required: true }
  roles: { type: array, items: { type: string } }
segments:
  kind: summary
  fields:
    - { field: title, label: "The story is called " }
"#;
        let schema: Schema = serde_yaml_ng::from_str(yaml)?;
        assert!(schema.properties["title"].required);
        assert_eq!(schema.properties["roles"].field_type, FieldType::Array);
        assert!(matches!(schema.segments, SegmentLayout::Summary { ref fields } if fields.len() == 1));
        assert!(schema.instruction().contains("\"required\""));
        Ok(())
    }
}
