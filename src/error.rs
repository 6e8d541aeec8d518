use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum XPathError {
    /// Malformed query text. Carries the original query and the byte offset
    /// of the offending character.
    #[error("syntax error at offset {position} in '{query}': {message}")]
    Syntax {
        query: String,
        position: usize,
        message: String,
    },

    /// A namespace-qualified function name could not be resolved against the
    /// extension registry at parse time.
    #[error("cannot resolve extension function '{name}': {message}")]
    ExtensionResolution { name: String, message: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("variable '{0}' is not bound")]
    UnknownVariable(String),

    #[error("function '{function}' error: {message}")]
    Function { function: String, message: String },

    #[error("type error: {0}")]
    Type(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),
}

impl XPathError {
    /// Builds a syntax error for `query` with the failure offset computed
    /// from the unconsumed remainder of the input.
    pub(crate) fn syntax(query: &str, remaining: &str, message: impl Into<String>) -> Self {
        XPathError::Syntax {
            query: query.to_string(),
            position: query.len().saturating_sub(remaining.len()),
            message: message.into(),
        }
    }
}
