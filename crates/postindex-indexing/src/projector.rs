//! Projection of post events into index mutations.
//!
//! Projection is pure: the same event always yields the same mutations, and
//! applying a mutation twice leaves the index as applying it once.

use std::collections::{BTreeSet, HashMap};

use postindex_types::{IndexMutation, IndexName, PostEvent, PostIndexEntry, PostUri};

/// Keys under which an event is reachable in `index`. Empty means the
/// event has no entry there.
pub fn index_keys(event: &PostEvent, index: IndexName) -> BTreeSet<String> {
    match index {
        IndexName::Hashtag => event.hashtags().iter().map(|t| t.to_string()).collect(),
        IndexName::Author => event.author().map(|a| a.to_string()).into_iter().collect(),
        IndexName::Date => BTreeSet::from([event.created_date().format("%Y-%m-%d").to_string()]),
    }
}

/// Mutation `event` produces for a single index.
pub fn project_index(event: &PostEvent, index: IndexName) -> IndexMutation {
    let remove = IndexMutation::Remove {
        index,
        uri: event.uri().clone(),
    };
    if event.is_delete() {
        return remove;
    }

    let keys = index_keys(event, index);
    if keys.is_empty() {
        // An edit that drops the last hashtag (or the author) must also drop
        // the stale entry.
        return remove;
    }

    IndexMutation::Upsert {
        index,
        keys,
        entry: PostIndexEntry::from_event(event),
    }
}

/// Mutations `event` produces across `indexes`, in the given index order.
pub fn project(event: &PostEvent, indexes: &[IndexName]) -> Vec<IndexMutation> {
    indexes
        .iter()
        .map(|index| project_index(event, *index))
        .collect()
}

/// Collapse mutations to the last one per (index, uri).
///
/// Output is ordered by each survivor's position in the input, so folding a
/// create followed by an edit of the same post keeps only the edit.
pub fn fold(mutations: impl IntoIterator<Item = IndexMutation>) -> Vec<IndexMutation> {
    let mut slots: Vec<Option<IndexMutation>> = Vec::new();
    let mut latest: HashMap<(IndexName, PostUri), usize> = HashMap::new();

    for mutation in mutations {
        let key = (mutation.index(), mutation.uri().clone());
        if let Some(previous) = latest.insert(key, slots.len()) {
            slots[previous] = None;
        }
        slots.push(Some(mutation));
    }

    slots.into_iter().flatten().collect()
}
