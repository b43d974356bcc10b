use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline phase has no connections")]
    MissingDag,

    #[error("DAG cycle detected at stage '{0}'")]
    DagCycle(String),

    #[error("Stage '{0}' has no input and is not a source")]
    NoInput(String),

    #[error("There are no inputs into join stage '{0}'")]
    NoJoinInputs(String),

    #[error("Join stage '{stage}' declares input '{input}' which is not connected to it")]
    JoinInputMissing { stage: String, input: String },

    #[error("Stage '{stage}' is of unsupported kind '{kind}'")]
    UnsupportedStage { stage: String, kind: String },

    #[error("Unsupported stage kind: {0}")]
    UnsupportedStageKind(String),

    #[error("Stage '{stage}' failed: {source:#}")]
    Collaborator {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Sink '{stage}' failed: {source:#}")]
    SinkFailed {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Sink '{stage}' panicked: {message}")]
    SinkPanicked { stage: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Wrap a backend or plugin failure raised while visiting `stage`.
    pub fn collaborator(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Collaborator {
            stage: stage.into(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Collaborator { .. } | Self::SinkFailed { .. } | Self::SinkPanicked { .. } => {
                ErrorCategory::Execution
            }
            Self::MissingDag
            | Self::DagCycle(_)
            | Self::NoInput(_)
            | Self::NoJoinInputs(_)
            | Self::JoinInputMissing { .. }
            | Self::UnsupportedStage { .. }
            | Self::UnsupportedStageKind(_)
            | Self::Config(_)
            | Self::Yaml(_)
            | Self::Json(_)
            | Self::Io(_) => ErrorCategory::Configuration,
        }
    }
}

/// Error category. Configuration errors describe a malformed plan and are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Malformed phase or plan, detected during the single-threaded walk
    Configuration,
    /// A collaborator or deferred sink write failed
    Execution,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Execution => "execution",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "configuration" => Ok(ErrorCategory::Configuration),
            "execution" => Ok(ErrorCategory::Execution),
            _ => Err(PipelineError::config(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_roundtrip() {
        for category in &[ErrorCategory::Configuration, ErrorCategory::Execution] {
            let s = category.as_str();
            let parsed = ErrorCategory::from_str(s).unwrap();
            assert_eq!(*category, parsed);
        }
    }

    #[test]
    fn test_error_category_invalid() {
        assert!(ErrorCategory::from_str("transient").is_err());
    }

    #[test]
    fn test_shape_errors_are_configuration() {
        assert_eq!(
            PipelineError::NoInput("t1".to_string()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(PipelineError::MissingDag.category(), ErrorCategory::Configuration);
        assert_eq!(
            PipelineError::NoJoinInputs("j".to_string()).category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_sink_errors_are_execution() {
        let err = PipelineError::SinkFailed {
            stage: "s1".to_string(),
            source: anyhow::anyhow!("disk full"),
        };
        assert_eq!(err.category(), ErrorCategory::Execution);
        assert!(err.to_string().contains("disk full"));
        assert!(err.to_string().contains("s1"));
    }

    #[test]
    fn test_no_input_message() {
        let err = PipelineError::NoInput("orphan".to_string());
        assert_eq!(
            err.to_string(),
            "Stage 'orphan' has no input and is not a source"
        );
    }
}
