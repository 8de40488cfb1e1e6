use thiserror::Error;

/// Errors surfaced by a pipeline to its caller.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage failed while producing output. `index` is zero-based.
    #[error("Stage {index} ('{stage}') failed: {source}")]
    Stage {
        index: usize,
        stage: String,
        source: anyhow::Error,
    },

    /// A stage received input it cannot consume. Detected when the stage
    /// first sees the value, never at composition time.
    #[error("Stage {index} ('{stage}') cannot accept its input: expected {expected}, found {found}")]
    Composition {
        index: usize,
        stage: String,
        expected: String,
        found: String,
    },

    #[error("JSON conversion failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pipeline was cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Attach positional context to a stage-local fault.
    pub(crate) fn from_fault(index: usize, stage: &str, fault: StageFault) -> Self {
        match fault {
            StageFault::Input { expected, found } => PipelineError::Composition {
                index,
                stage: stage.to_string(),
                expected,
                found,
            },
            StageFault::Failed(source) => PipelineError::Stage {
                index,
                stage: stage.to_string(),
                source,
            },
        }
    }

    /// Zero-based index of the stage that failed, if the error came from one.
    pub fn stage_index(&self) -> Option<usize> {
        match self {
            PipelineError::Stage { index, .. } | PipelineError::Composition { index, .. } => {
                Some(*index)
            }
            _ => None,
        }
    }

    /// Name of the stage that failed, if the error came from one.
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            PipelineError::Stage { stage, .. } | PipelineError::Composition { stage, .. } => {
                Some(stage)
            }
            _ => None,
        }
    }
}

/// Error raised by a single stage, before the pipeline knows where it sits.
#[derive(Error, Debug)]
pub enum StageFault {
    #[error("expected {expected}, found {found}")]
    Input { expected: String, found: String },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl StageFault {
    /// Input of the wrong shape; `found` is summarized from the value.
    pub fn input(expected: impl Into<String>, found: &serde_json::Value) -> Self {
        StageFault::Input {
            expected: expected.into(),
            found: describe(found),
        }
    }
}

/// Short human-readable description of a JSON value's shape.
pub fn describe(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(items) => format!("array of {}", items.len()),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

pub type StageResult<T> = std::result::Result<T, StageFault>;
