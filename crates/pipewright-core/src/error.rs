use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipewrightError {
    // Graph errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Pipeline validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Circular dependency detected at node: {node}")]
    CircularDependency { node: String },

    // Lookup errors
    #[error("Unknown executor type: {0}")]
    UnknownExecutorType(String),

    #[error("Missing output from upstream node: {0}")]
    MissingUpstreamOutput(String),

    // Step errors
    #[error("Node {node} timed out after {timeout_ms}ms")]
    NodeTimedOut { node: String, timeout_ms: u64 },

    #[error("{node_type} failed: {message}")]
    Execution { node_type: String, message: String },

    #[error("Invalid {node_type} config: {message}")]
    InvalidConfig { node_type: String, message: String },

    #[error("Invalid {node_type} input: {message}")]
    InvalidInput { node_type: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Text generation failed: {0}")]
    TextGeneration(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipewrightError {
    /// Shorthand for an executor failure.
    pub fn execution(node_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            node_type: node_type.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a config the executor cannot work with.
    pub fn invalid_config(node_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            node_type: node_type.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an input of the wrong shape.
    pub fn invalid_input(node_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            node_type: node_type.into(),
            message: message.into(),
        }
    }

    /// Whether this error happened before any node could run.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            Self::PipelineNotFound(_) | Self::Validation(_) | Self::CircularDependency { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipewrightError>;
