//! Index projection targets.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::event::PostEvent;
use crate::validated::{Handle, Hashtag, PostUri};

/// The indexes maintained for every store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexName {
    /// Keyed by each hashtag of a post
    Hashtag,
    /// Keyed by author handle
    Author,
    /// Keyed by creation date (YYYY-MM-DD)
    Date,
}

impl IndexName {
    pub const ALL: [IndexName; 3] = [IndexName::Hashtag, IndexName::Author, IndexName::Date];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexName::Hashtag => "hashtag",
            IndexName::Author => "author",
            IndexName::Date => "date",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value {
            "hashtag" => Ok(IndexName::Hashtag),
            "author" => Ok(IndexName::Author),
            "date" => Ok(IndexName::Date),
            other => Err(ValidationError::IndexName(other.to_string())),
        }
    }
}

impl std::fmt::Display for IndexName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IndexName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// One live entry of an index. At most one per `uri` per index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostIndexEntry {
    pub uri: PostUri,

    /// ISO date (YYYY-MM-DD)
    pub created_date: String,

    pub hashtags: BTreeSet<Hashtag>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Handle>,
}

impl PostIndexEntry {
    /// Build the entry an event projects to.
    pub fn from_event(event: &PostEvent) -> Self {
        Self {
            uri: event.uri().clone(),
            created_date: event.created_date().format("%Y-%m-%d").to_string(),
            hashtags: event.hashtags().clone(),
            author: event.author().cloned(),
        }
    }
}

/// A change to apply to one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IndexMutation {
    /// Replace the entry for `entry.uri`, reachable under `keys`
    Upsert {
        index: IndexName,
        keys: BTreeSet<String>,
        entry: PostIndexEntry,
    },
    /// Drop the entry for `uri` and all its keys
    Remove { index: IndexName, uri: PostUri },
}

impl IndexMutation {
    pub fn index(&self) -> IndexName {
        match self {
            IndexMutation::Upsert { index, .. } | IndexMutation::Remove { index, .. } => *index,
        }
    }

    pub fn uri(&self) -> &PostUri {
        match self {
            IndexMutation::Upsert { entry, .. } => &entry.uri,
            IndexMutation::Remove { uri, .. } => uri,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Position, PostPayload};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_index_name_roundtrip_strings() {
        for index in IndexName::ALL {
            assert_eq!(IndexName::parse(index.as_str()).unwrap(), index);
        }
        assert!(IndexName::parse("tags").is_err());
    }

    #[test]
    fn test_entry_from_event() {
        let event = PostPayload::new(
            PostUri::parse("at://bob.example.com/app.bsky.feed.post/9").unwrap(),
            Utc.with_ymd_and_hms(2023, 12, 31, 8, 0, 0).unwrap(),
        )
        .with_hashtags([Hashtag::parse("a").unwrap(), Hashtag::parse("b").unwrap()])
        .at(Position::new(3));

        let entry = PostIndexEntry::from_event(&event);
        assert_eq!(entry.created_date, "2023-12-31");
        assert_eq!(entry.hashtags.len(), 2);
        assert!(entry.author.is_none());
    }

    #[test]
    fn test_mutation_accessors() {
        let uri = PostUri::parse("at://bob.example.com/app.bsky.feed.post/9").unwrap();
        let remove = IndexMutation::Remove {
            index: IndexName::Author,
            uri: uri.clone(),
        };
        assert_eq!(remove.index(), IndexName::Author);
        assert_eq!(remove.uri(), &uri);
    }
}
