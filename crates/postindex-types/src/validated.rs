//! Refined string types validated at construction.
//!
//! Every type here can only be built through `parse` (or serde, which
//! routes through the same check), so an invalid value never reaches
//! the index or the catalog.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const MAX_STORE_NAME_LEN: usize = 64;
const MAX_HANDLE_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const MAX_HASHTAG_LEN: usize = 64;

macro_rules! string_newtype {
    ($name:ident) => {
        impl $name {
            /// Borrow the validated value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

/// Unique catalog name of a store.
///
/// 1-64 characters of `[a-z0-9_-]`, starting with a letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreName(String);

impl StoreName {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::StoreName {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if value.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if value.len() > MAX_STORE_NAME_LEN {
            return Err(invalid("must be at most 64 characters"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(invalid("only lowercase letters, digits, '-' and '_' are allowed"));
        }
        if !value.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid("must start with a letter or digit"));
        }
        Ok(Self(value.to_string()))
    }
}

string_newtype!(StoreName);

/// Reference to a post: `at://<authority>/<collection>/<rkey>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PostUri(String);

impl PostUri {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::PostUri {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let rest = value
            .strip_prefix("at://")
            .ok_or_else(|| invalid("must start with at://"))?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() != 3 {
            return Err(invalid("expected authority/collection/rkey"));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("path segments must not be empty"));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(invalid("must not contain whitespace"));
        }
        Ok(Self(value.to_string()))
    }

    /// The authority (DID or handle) part of the URI.
    pub fn authority(&self) -> &str {
        self.0
            .trim_start_matches("at://")
            .split('/')
            .next()
            .unwrap_or_default()
    }
}

string_newtype!(PostUri);

/// Domain-style author handle, stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

impl Handle {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::Handle {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let normalized = value.trim_start_matches('@').to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if normalized.len() > MAX_HANDLE_LEN {
            return Err(invalid("must be at most 253 characters"));
        }

        let labels: Vec<&str> = normalized.split('.').collect();
        if labels.len() < 2 {
            return Err(invalid("must contain at least two labels"));
        }
        for label in &labels {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(invalid("labels must be 1-63 characters"));
            }
            if !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(invalid("labels may only contain letters, digits and '-'"));
            }
            if label.starts_with('-') || label.ends_with('-') {
                return Err(invalid("labels must not start or end with '-'"));
            }
        }
        Ok(Self(normalized))
    }
}

string_newtype!(Handle);

/// Normalized hashtag: no leading `#`, lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hashtag(String);

impl Hashtag {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::Hashtag {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let normalized = value.trim_start_matches('#').to_lowercase();
        if normalized.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if normalized.chars().count() > MAX_HASHTAG_LEN {
            return Err(invalid("must be at most 64 characters"));
        }
        if normalized.chars().any(|c| c.is_whitespace() || c == '#') {
            return Err(invalid("must be a single word"));
        }
        Ok(Self(normalized))
    }
}

string_newtype!(Hashtag);
