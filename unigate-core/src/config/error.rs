//! Errors raised while loading a gateway configuration

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read gateway config '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed gateway config '{path}' (line {}, column {}): {message}",
            .line.unwrap_or(0), .column.unwrap_or(0))]
    ParseError {
        path: String,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },

    #[error("Invalid gateway config: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Environment variable '{var}' referenced by the config is not set")]
    EnvVarNotFound { var: String },
}

/// Rejected setting, located by a path such as `channels[0].base_url`
#[derive(Debug, Error)]
pub struct ValidationError {
    pub field_path: String,
    pub kind: ValidationErrorKind,
    /// Hint for the operator, if any
    pub context: Option<String>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field_path, self.kind)?;
        match &self.context {
            Some(hint) => write!(f, " ({})", hint),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationErrorKind {
    #[error("required field is missing")]
    RequiredFieldMissing,

    #[error("out of range, {message}")]
    OutOfRange { message: String },

    #[error("schema version {actual} is not supported (expected {expected})")]
    InvalidVersion { expected: String, actual: String },

    #[error("channel name '{name}' is used more than once")]
    DuplicateChannel { name: String },

    #[error("'${{{var}}}' was left uninterpolated")]
    UnresolvedPlaceholder { var: String },

    #[error("not a usable base URL: {message}")]
    InvalidUrl { message: String },

    #[error("maps model '{model}' that the channel does not serve")]
    UnservedMapping { model: String },
}

impl ValidationError {
    pub fn new(field_path: impl Into<String>, kind: ValidationErrorKind) -> Self {
        Self {
            field_path: field_path.into(),
            kind,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn required(field_path: impl Into<String>) -> Self {
        Self::new(field_path, ValidationErrorKind::RequiredFieldMissing)
    }

    pub fn out_of_range(field_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            field_path,
            ValidationErrorKind::OutOfRange {
                message: message.into(),
            },
        )
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
