use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Invalid expression {expression:?}: must be non-empty with no whitespace")]
    InvalidExpression { expression: String },

    #[error("Timed out connecting to {addr}")]
    ConnectTimeout { addr: String },

    #[error("Transport failure while {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

impl ProbeError {
    pub(crate) fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        ProbeError::Transport {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        ProbeError::InvalidConfiguration {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;
