use thiserror::Error;

/// Raised by the response parser.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no valid JSON object found in model response")]
    NoJsonObject,
    #[error("required fields missing from model response: {}", fields.join(", "))]
    MissingFields { fields: Vec<String> },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("model call failed for phase {phase}")]
    ModelCall {
        phase: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("synthesis failed for phase {phase} segment {segment}")]
    Synthesis {
        phase: u64,
        segment: usize,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_message() {
        let err = ParseError::MissingFields {
            fields: vec!["story_seg".to_string(), "ended".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "required fields missing from model response: story_seg, ended"
        );
    }
}
