use serde::Serialize;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyntaxError {
    pub lineno: usize,
    // 1-based character offset of the offending token within its line.
    pub offset: usize,
    pub text: String,
    pub message: String,
}

impl Display for SyntaxError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (line {}, offset {})",
            self.message, self.lineno, self.offset
        )
    }
}

impl std::error::Error for SyntaxError {}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error("failed to load the Python grammar: {0}")]
    Grammar(String),

    #[error("malformed {kind} node: {detail}")]
    MalformedTree { kind: String, detail: String },

    #[error("maximum recursion depth exceeded during compilation (limit {limit})")]
    TooDeep { limit: usize },

    #[error("failed to serialize block: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid literal pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl ConvertError {
    pub fn malformed(kind: &str, detail: impl Into<String>) -> Self {
        ConvertError::MalformedTree {
            kind: kind.to_string(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorEnvelope {
    Syntax { error: SyntaxError },
    Message { error: String },
}

impl From<&ConvertError> for ErrorEnvelope {
    fn from(err: &ConvertError) -> Self {
        match err {
            ConvertError::Syntax(syntax) => ErrorEnvelope::Syntax {
                error: syntax.clone(),
            },
            other => ErrorEnvelope::Message {
                error: other.to_string(),
            },
        }
    }
}

impl From<ConvertError> for ErrorEnvelope {
    fn from(err: ConvertError) -> Self {
        ErrorEnvelope::from(&err)
    }
}
