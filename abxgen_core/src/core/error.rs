use thiserror::Error;

#[derive(Error, Debug)]
pub enum AbxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Evaluation error in {name}: {message}")]
    Evaluation { name: String, message: String },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl AbxError {
    pub fn evaluation(name: &str, message: impl Into<String>) -> Self {
        AbxError::Evaluation {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, AbxError>;
