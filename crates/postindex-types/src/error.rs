//! Error types for postindex domain records.

use thiserror::Error;

/// A record failed constructor-time validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Store name is empty, too long, or contains invalid characters
    #[error("Invalid store name '{value}': {reason}")]
    StoreName { value: String, reason: String },

    /// Post URI is not of the form at://authority/collection/rkey
    #[error("Invalid post URI '{value}': {reason}")]
    PostUri { value: String, reason: String },

    /// Author handle is not a valid domain-style handle
    #[error("Invalid handle '{value}': {reason}")]
    Handle { value: String, reason: String },

    /// Hashtag is empty or malformed
    #[error("Invalid hashtag '{value}': {reason}")]
    Hashtag { value: String, reason: String },

    /// Filter policy parameters are out of range
    #[error("Invalid filter policy: {0}")]
    Policy(String),

    /// Unknown index name
    #[error("Unknown index '{0}' (expected hashtag, author or date)")]
    IndexName(String),

    /// Date string is not ISO-8601 (YYYY-MM-DD)
    #[error("Invalid date '{0}': expected YYYY-MM-DD")]
    Date(String),
}

/// Unified error type for shared postindex operations.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::Handle {
            value: "bad handle".to_string(),
            reason: "contains whitespace".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid handle 'bad handle': contains whitespace"
        );

        let err = ValidationError::IndexName("tags".to_string());
        assert!(err.to_string().contains("Unknown index 'tags'"));
    }

    #[test]
    fn test_types_error_from_validation() {
        let err: TypesError = ValidationError::Date("2024-13-40".to_string()).into();
        assert!(matches!(err, TypesError::Validation(_)));
        assert_eq!(err.to_string(), "Invalid date '2024-13-40': expected YYYY-MM-DD");
    }
}
