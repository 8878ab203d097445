//! Errors raised while loading a gateway configuration

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse '{path}'{}: {message}", location(.line, .column))]
    Parse {
        path: String,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("environment variable '{var}' is referenced but not set")]
    MissingEnvVar { var: String },
}

fn location(line: &Option<usize>, column: &Option<usize>) -> String {
    match (*line, *column) {
        (Some(line), Some(column)) => format!(" at {}:{}", line, column),
        (Some(line), None) => format!(" at line {}", line),
        _ => String::new(),
    }
}

/// A rejected field, addressed by its path (`providers[0].api_keys`)
#[derive(Debug, Error)]
#[error("invalid configuration at '{field}': {kind}{}", hint_suffix(.hint))]
pub struct ValidationError {
    pub field: String,
    pub kind: ValidationErrorKind,
    pub hint: Option<String>,
}

#[derive(Debug, Error)]
pub enum ValidationErrorKind {
    #[error("missing or empty")]
    Missing,

    #[error("{0}")]
    OutOfRange(String),

    #[error("malformed: {0}")]
    Malformed(String),

    #[error("'{0}' appears more than once")]
    Duplicate(String),

    #[error("bad URL: {0}")]
    BadUrl(String),

    #[error("'{0}' does not name a configured provider or model")]
    UnknownReference(String),

    #[error("no transformer stage named '{0}'")]
    UnknownStage(String),
}

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_deref().map(|h| format!(" ({})", h)).unwrap_or_default()
}

impl ValidationError {
    pub fn new(field: impl Into<String>, kind: ValidationErrorKind) -> Self {
        Self {
            field: field.into(),
            kind,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, ValidationErrorKind::Missing)
    }

    pub fn out_of_range(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, ValidationErrorKind::OutOfRange(message.into()))
    }

    pub fn malformed(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, ValidationErrorKind::Malformed(message.into()))
    }

    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(field, ValidationErrorKind::Duplicate(value.into()))
    }

    pub fn bad_url(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, ValidationErrorKind::BadUrl(message.into()))
    }

    pub fn unknown_reference(field: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::new(field, ValidationErrorKind::UnknownReference(reference.into()))
    }

    pub fn unknown_stage(field: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(field, ValidationErrorKind::UnknownStage(name.into()))
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
