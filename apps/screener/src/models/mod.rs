pub mod candidate;
pub mod failure;
pub mod job;
pub mod matching;

use thiserror::Error;

/// A persisted enum column held a value this build does not know about.
#[derive(Debug, Error)]
#[error("unknown {field} value '{value}'")]
pub struct StatusParseError {
    pub field: &'static str,
    pub value: String,
}

impl StatusParseError {
    pub fn new(field: &'static str, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}
