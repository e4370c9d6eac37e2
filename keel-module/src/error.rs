use thiserror::Error;

/// Errors arising from malformed module-level values.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Version parse error for `{input}`: {reason}")]
    VersionParse { input: String, reason: &'static str },
    #[error("Invalid resource path `{0}`: must be relative")]
    AbsoluteResourcePath(String),
    #[error("Parameter type mismatch: expected {expected:?}, got {got:?}")]
    ParameterTypeMismatch {
        expected: crate::ParameterType,
        got: crate::ParameterType,
    },
    #[error("Unknown parameter type tag {0}")]
    UnknownParameterType(i32),
}
