//! Query Errors
//!
//! User-attributable failures raised while transforming or accumulating rows.
//! A `QueryError` travels inside `ResultVariant::Error` when it happens on a shard,
//! and is returned directly from eager accumulation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a query error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad input to a transform or terminal
    Generic,
    /// Array size or grouping cardinality limit exceeded
    ResourceLimit,
    /// Value of the wrong type
    TypeMismatch,
    /// Missing field or empty stream where a value was required
    NonExistence,
    /// Same global optarg given twice
    DuplicateOptarg,
    /// Cancellation signal fired mid-query
    Interrupted,
}

/// One step of the position inside the user's query that produced an error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frame {
    Pos(u32),
    Opt(String),
}

/// Position of the failing term, innermost frame last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Backtrace {
    pub frames: Vec<Frame>,
}

impl Backtrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frames.push(frame);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Backtrace,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        QueryError {
            kind,
            message: message.into(),
            trace: Backtrace::new(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, message)
    }

    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLimit, message)
    }

    pub fn non_existence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonExistence, message)
    }

    pub fn type_mismatch(expected: &str, found: &str) -> Self {
        Self::new(
            ErrorKind::TypeMismatch,
            format!("Expected type {} but found {}.", expected, found),
        )
    }

    pub fn duplicate_optarg(key: &str) -> Self {
        Self::new(
            ErrorKind::DuplicateOptarg,
            format!("Duplicate global optarg: {}", key),
        )
    }

    pub fn interrupted() -> Self {
        Self::new(ErrorKind::Interrupted, "Query interrupted.")
    }

    /// Attach a backtrace unless one is already present.
    pub fn with_backtrace(mut self, backtrace: Backtrace) -> Self {
        if self.trace.is_empty() {
            self.trace = backtrace;
        }
        self
    }

    pub fn is_interruption(&self) -> bool {
        self.kind == ErrorKind::Interrupted
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for QueryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mismatch_message() {
        let err = QueryError::type_mismatch("NUMBER", "STRING");
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
        assert_eq!(err.to_string(), "Expected type NUMBER but found STRING.");
    }

    #[test]
    fn test_backtrace_kept_once_set() {
        let first = Backtrace::new().with_frame(Frame::Pos(1));
        let second = Backtrace::new().with_frame(Frame::Opt("index".to_string()));

        let err = QueryError::generic("boom")
            .with_backtrace(first.clone())
            .with_backtrace(second);
        assert_eq!(err.trace, first);
    }

    #[test]
    fn test_query_error_is_std_error() {
        let err = QueryError::generic("boom")
            .with_backtrace(Backtrace::new().with_frame(Frame::Pos(3)));
        let dynamic: &dyn std::error::Error = &err;
        assert_eq!(dynamic.to_string(), "boom");
        assert!(dynamic.source().is_none());
    }
}
