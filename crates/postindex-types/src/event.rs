//! Post events consumed by the indexer.
//!
//! Events are immutable, position-ordered records describing the creation,
//! edit or deletion of a post within one store's event stream.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::validated::{Handle, Hashtag, PostUri};

/// Store-scoped position of an event in its stream.
///
/// Position 0 means "nothing processed yet"; real events start at 1.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(pub u64);

impl Position {
    pub const ZERO: Position = Position(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The position immediately after this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an event source addresses positions.
///
/// Both schemes are non-negative and strictly ordered, but positions from
/// different schemes are not comparable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionScheme {
    /// Dense sequence numbers assigned by the local event log
    #[default]
    Sequence,
    /// Source-assigned event ids (may have gaps)
    EventId,
}

impl PositionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionScheme::Sequence => "sequence",
            PositionScheme::EventId => "event_id",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sequence" => Some(PositionScheme::Sequence),
            "event_id" => Some(PositionScheme::EventId),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Post created or edited
    #[default]
    Upsert,
    /// Post deleted
    Delete,
}

/// Post payload as it arrives from a feed, before a position is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPayload {
    pub uri: PostUri,

    #[serde(default)]
    pub kind: EventKind,

    /// When the post was created (source timestamp, not ingestion time)
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub hashtags: BTreeSet<Hashtag>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Handle>,
}

impl PostPayload {
    pub fn new(uri: PostUri, created_at: DateTime<Utc>) -> Self {
        Self {
            uri,
            kind: EventKind::Upsert,
            created_at,
            hashtags: BTreeSet::new(),
            author: None,
        }
    }

    pub fn with_hashtags(mut self, hashtags: impl IntoIterator<Item = Hashtag>) -> Self {
        self.hashtags = hashtags.into_iter().collect();
        self
    }

    pub fn with_author(mut self, author: Handle) -> Self {
        self.author = Some(author);
        self
    }

    pub fn deleted(mut self) -> Self {
        self.kind = EventKind::Delete;
        self
    }

    /// Attach a stream position, producing an event.
    pub fn at(self, position: Position) -> PostEvent {
        PostEvent {
            position,
            payload: self,
        }
    }

    /// Serialize to JSON bytes for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A post event at a known position in a store's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostEvent {
    pub position: Position,

    #[serde(flatten)]
    pub payload: PostPayload,
}

impl PostEvent {
    pub fn uri(&self) -> &PostUri {
        &self.payload.uri
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind
    }

    pub fn hashtags(&self) -> &BTreeSet<Hashtag> {
        &self.payload.hashtags
    }

    pub fn author(&self) -> Option<&Handle> {
        self.payload.author.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.payload.created_at
    }

    /// Calendar date of creation, used as the date index key.
    pub fn created_date(&self) -> NaiveDate {
        self.payload.created_at.date_naive()
    }

    pub fn is_delete(&self) -> bool {
        self.payload.kind == EventKind::Delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload() -> PostPayload {
        PostPayload::new(
            PostUri::parse("at://alice.example.com/app.bsky.feed.post/1").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 0).unwrap(),
        )
        .with_hashtags([Hashtag::parse("rust").unwrap()])
        .with_author(Handle::parse("alice.example.com").unwrap())
    }

    #[test]
    fn test_position_ordering() {
        assert!(Position::new(2) > Position::new(1));
        assert_eq!(Position::ZERO.next(), Position::new(1));
        assert_eq!(Position::new(7).to_string(), "7");
    }

    #[test]
    fn test_position_scheme_parse() {
        assert_eq!(PositionScheme::parse("sequence"), Some(PositionScheme::Sequence));
        assert_eq!(PositionScheme::parse("event_id"), Some(PositionScheme::EventId));
        assert_eq!(PositionScheme::parse("offset"), None);
    }

    #[test]
    fn test_created_date_uses_utc_calendar_day() {
        let event = payload().at(Position::new(1));
        assert_eq!(event.created_date().to_string(), "2024-03-09");
    }

    #[test]
    fn test_event_json_is_flat() {
        let event = payload().at(Position::new(5));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["position"], 5);
        assert_eq!(json["uri"], "at://alice.example.com/app.bsky.feed.post/1");
        assert_eq!(json["kind"], "upsert");
        assert_eq!(json["author"], "alice.example.com");
    }

    #[test]
    fn test_payload_rejects_invalid_fields() {
        let json = r#"{"uri":"not-a-uri","createdAt":"2024-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<PostPayload>(json).is_err());

        let json = r##"{"uri":"at://a.b/c/d","createdAt":"2024-01-01T00:00:00Z","hashtags":["#Rust"]}"##;
        let parsed: PostPayload = serde_json::from_str(json).unwrap();
        assert!(parsed.hashtags.contains(&Hashtag::parse("rust").unwrap()));
        assert_eq!(parsed.kind, EventKind::Upsert);
    }
}
