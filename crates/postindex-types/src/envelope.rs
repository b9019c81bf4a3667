//! Structured error envelope for agent and CLI consumers.
//!
//! The core classifies every store-level failure into an [`ErrorKind`];
//! rendering is left to whoever prints the envelope.

use serde::{Deserialize, Serialize};

/// Classification of a failure reported through an [`ErrorEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Event source unavailable after bounded retries
    TransientFetchError,
    /// A guarded per-event check exhausted its retries (non-fatal)
    PerEventPolicyFailure,
    /// Index + checkpoint transaction failed after bounded retries
    CommitError,
    /// A commit tried to move a checkpoint backwards
    OutOfOrderCheckpointError,
    /// Persisted checkpoints could not be read
    CheckpointLoadError,
    /// Store vanished from the catalog mid-run (benign)
    StoreDisappeared,
    /// Checkpoint and event source use different position schemes
    AddressingMismatch,
    /// Event source failed in a non-retryable way
    SourceError,
    /// Store is not registered in the catalog
    StoreNotFound,
    /// Store or engine configuration is invalid
    InvalidConfig,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientFetchError => "TransientFetchError",
            ErrorKind::PerEventPolicyFailure => "PerEventPolicyFailure",
            ErrorKind::CommitError => "CommitError",
            ErrorKind::OutOfOrderCheckpointError => "OutOfOrderCheckpointError",
            ErrorKind::CheckpointLoadError => "CheckpointLoadError",
            ErrorKind::StoreDisappeared => "StoreDisappeared",
            ErrorKind::AddressingMismatch => "AddressingMismatch",
            ErrorKind::SourceError => "SourceError",
            ErrorKind::StoreNotFound => "StoreNotFound",
            ErrorKind::InvalidConfig => "InvalidConfig",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent-facing error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_tags: Option<Vec<String>>,
}

impl ErrorEnvelope {
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            received: None,
            expected: None,
            fix: None,
            details: None,
            valid_tags: None,
        }
    }

    pub fn with_received(mut self, received: impl Into<String>) -> Self {
        self.received = Some(received.into());
        self
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_valid_tags(mut self, tags: Vec<String>) -> Self {
        self.valid_tags = Some(tags);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl std::error::Error for ErrorEnvelope {}
