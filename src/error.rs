use thiserror::Error;

/// A fatal lowering failure. Lowering either fully succeeds or aborts with
/// one of these; a partially assembled kernel program is never returned.
#[derive(Debug, Error)]
pub enum LowerError {
    #[error("undefined reference '{0}' in scalar expression")]
    UndefinedName(String),

    #[error("duplicate name '{0}'")]
    DuplicateName(String),

    #[error("cannot lower {kind} node '{name}'")]
    UnsupportedNode { kind: &'static str, name: String },

    #[error("reduction over '{0}' is not supported in output assembly")]
    UnsupportedReduction(String),

    #[error("scalar (zero-dimensional) output '{0}' is not supported")]
    ScalarOutput(String),

    #[error("'{name}' accessed with {got} indices, expected {expected}")]
    RankMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("malformed graph: {0}")]
    MalformedGraph(String),

    #[error("internal consistency violation: {0}")]
    Inconsistent(String),
}

pub type Result<T> = std::result::Result<T, LowerError>;

// Bail macros

#[macro_export]
macro_rules! bail_malformed {
    ($($arg:tt)*) => {
        return Err($crate::error::LowerError::MalformedGraph(format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! bail_inconsistent {
    ($($arg:tt)*) => {
        return Err($crate::error::LowerError::Inconsistent(format!($($arg)*)))
    };
}
