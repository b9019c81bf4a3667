//! Key encoding and decoding for the event log.
//!
//! Key format: `evt:{sequence:020}`. Zero-padding keeps lexicographic order
//! equal to numeric order so forward iteration yields events by position.

use postindex_types::Position;

use crate::error::StorageError;

/// Key for event storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    pub sequence: u64,
}

impl EventKey {
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }

    /// First key strictly after `position`.
    pub fn after(position: Position) -> Self {
        Self::new(position.next().value())
    }

    pub fn position(&self) -> Position {
        Position::new(self.sequence)
    }

    /// Encode key to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("evt:{:020}", self.sequence).into_bytes()
    }

    /// Decode key from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let sequence = s
            .strip_prefix("evt:")
            .ok_or_else(|| StorageError::Key(format!("Invalid event key format: {}", s)))?;

        let sequence: u64 = sequence
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid sequence: {}", e)))?;

        Ok(Self { sequence })
    }
}

/// Key for log metadata entries
/// Format: meta:{name}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaKey {
    pub name: &'static str,
}

impl MetaKey {
    /// Name of the store that owns the log
    pub const STORE: MetaKey = MetaKey { name: "store" };

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("meta:{}", self.name).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_roundtrip() {
        let key = EventKey::new(12345);
        let decoded = EventKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(key, decoded);
        assert_eq!(decoded.position(), Position::new(12345));
    }

    #[test]
    fn test_event_key_lexicographic_order() {
        let key1 = EventKey::new(9);
        let key2 = EventKey::new(10);
        assert!(key1.to_bytes() < key2.to_bytes());
    }

    #[test]
    fn test_event_key_after() {
        assert_eq!(EventKey::after(Position::ZERO).sequence, 1);
        assert_eq!(EventKey::after(Position::new(41)).sequence, 42);
    }

    #[test]
    fn test_event_key_rejects_foreign_prefix() {
        assert!(EventKey::from_bytes(b"outbox:00000000000000000001").is_err());
        assert!(EventKey::from_bytes(b"evt:abc").is_err());
    }
}
