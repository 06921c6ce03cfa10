//! Parse errors for the validated string types

use miette::SourceSpan;
use smol_str::SmolStr;

/// Error produced when a string fails validation as one of the identifier types.
///
/// `kind` names the identifier (`did`, `tid`, ...), `input` is the rejected text
/// and `reason` says what was wrong with it.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("invalid {kind} `{input}`: {reason}")]
#[diagnostic(help("identifiers are validated on construction; check the input source"))]
pub struct StrParseError {
    /// Identifier type being parsed
    pub kind: SmolStr,
    /// The rejected input
    #[source_code]
    pub input: String,
    /// What was wrong with it
    #[source]
    #[diagnostic_source]
    pub reason: StrParseKind,
}

impl StrParseError {
    /// Input exceeded the maximum length
    pub fn too_long(kind: &'static str, input: &str, max: usize, actual: usize) -> Self {
        Self {
            kind: SmolStr::new_static(kind),
            input: input.to_string(),
            reason: StrParseKind::TooLong { max, actual },
        }
    }

    /// Input was shorter than required
    pub fn too_short(kind: &'static str, input: &str, min: usize, actual: usize) -> Self {
        Self {
            kind: SmolStr::new_static(kind),
            input: input.to_string(),
            reason: StrParseKind::TooShort { min, actual },
        }
    }

    /// Input didn't match the identifier grammar
    pub fn regex(kind: &'static str, input: &str, message: &'static str) -> Self {
        Self {
            kind: SmolStr::new_static(kind),
            input: input.to_string(),
            reason: StrParseKind::RegexFail {
                span: None,
                message: SmolStr::new_static(message),
            },
        }
    }

    /// Input contained a disallowed character at `at`
    pub fn disallowed(kind: &'static str, input: &str, at: usize, len: usize) -> Self {
        Self {
            kind: SmolStr::new_static(kind),
            input: input.to_string(),
            reason: StrParseKind::Disallowed {
                problem: Some(SourceSpan::new(at.into(), len)),
            },
        }
    }
}

/// Category of string parse failure
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StrParseKind {
    /// Grammar mismatch
    #[error("regex failure - {message}")]
    #[diagnostic(code(arbor::string::regex_fail))]
    RegexFail {
        /// Location of the mismatch, when known
        #[label]
        span: Option<SourceSpan>,
        /// Human readable description
        #[help]
        message: SmolStr,
    },
    /// Too long
    #[error("string too long (allowed: {max}, actual: {actual})")]
    #[diagnostic(code(arbor::string::wrong_length))]
    TooLong {
        /// Maximum length
        max: usize,
        /// Actual length
        actual: usize,
    },
    /// Too short
    #[error("string too short (allowed: {min}, actual: {actual})")]
    #[diagnostic(code(arbor::string::wrong_length))]
    TooShort {
        /// Minimum length
        min: usize,
        /// Actual length
        actual: usize,
    },
    /// Disallowed character
    #[error("disallowed character")]
    #[diagnostic(code(arbor::string::disallowed))]
    Disallowed {
        /// Offending span
        #[label("here")]
        problem: Option<SourceSpan>,
    },
}
