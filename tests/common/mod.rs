#![allow(dead_code)]

use faultguard_rs::{Classify, ErrorKind};
use std::error::Error;
use std::fmt;

// Custom error type that carries its own classification
#[derive(Debug, Clone, PartialEq)]
pub struct TestError {
    pub kind: ErrorKind,
    pub msg: String,
}

impl TestError {
    pub fn new(msg: &str) -> Self {
        Self::with_kind(ErrorKind::Unavailable, msg)
    }

    pub fn with_kind(kind: ErrorKind, msg: &str) -> Self {
        TestError {
            kind,
            msg: msg.to_string(),
        }
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Test error: {}", self.msg)
    }
}

impl Error for TestError {}

impl Classify for TestError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}
