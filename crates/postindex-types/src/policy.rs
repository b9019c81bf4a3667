//! Filter rules and their error policies.
//!
//! A store's filter list is an ordered set of [`FilterRule`]s. The first rule
//! whose predicate matches an event decides what happens to it.

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::event::PostEvent;
use crate::validated::{Handle, Hashtag};

/// Parameters of a `Retry` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRetryPolicy", into = "RawRetryPolicy")]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Result<Self, ValidationError> {
        if base_delay.is_zero() {
            return Err(ValidationError::Policy(
                "retry baseDelay must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            max_retries,
            base_delay,
        })
    }

    /// Retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Total attempts including the initial one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryPolicy {
    max_retries: u32,
    base_delay_ms: u64,
}

impl TryFrom<RawRetryPolicy> for RetryPolicy {
    type Error = ValidationError;

    fn try_from(raw: RawRetryPolicy) -> Result<Self, Self::Error> {
        RetryPolicy::new(raw.max_retries, Duration::from_millis(raw.base_delay_ms))
    }
}

impl From<RetryPolicy> for RawRetryPolicy {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
        }
    }
}

/// What to do with an event matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterErrorPolicy {
    /// Admit the event
    Include,
    /// Drop the event silently
    Exclude,
    /// Admit only once the guarded check succeeds, retrying with backoff;
    /// excluded and counted once retries are exhausted
    Retry(RetryPolicy),
}

/// Which events a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPredicate {
    /// Every event
    Any,
    /// Events carrying this hashtag
    Hashtag(Hashtag),
    /// Events by this author
    Author(Handle),
    /// Posts created strictly before this date
    CreatedBefore(NaiveDate),
    /// Posts created strictly after this date
    CreatedAfter(NaiveDate),
    /// Delete events
    Deleted,
}

impl EventPredicate {
    pub fn matches(&self, event: &PostEvent) -> bool {
        match self {
            EventPredicate::Any => true,
            EventPredicate::Hashtag(tag) => event.hashtags().contains(tag),
            EventPredicate::Author(handle) => event.author() == Some(handle),
            EventPredicate::CreatedBefore(date) => event.created_date() < *date,
            EventPredicate::CreatedAfter(date) => event.created_date() > *date,
            EventPredicate::Deleted => event.is_delete(),
        }
    }
}

/// A predicate paired with the policy applied when it matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub when: EventPredicate,
    pub policy: FilterErrorPolicy,
}

impl FilterRule {
    pub fn new(when: EventPredicate, policy: FilterErrorPolicy) -> Self {
        Self { when, policy }
    }

    pub fn include(when: EventPredicate) -> Self {
        Self::new(when, FilterErrorPolicy::Include)
    }

    pub fn exclude(when: EventPredicate) -> Self {
        Self::new(when, FilterErrorPolicy::Exclude)
    }

    pub fn retry(when: EventPredicate, policy: RetryPolicy) -> Self {
        Self::new(when, FilterErrorPolicy::Retry(policy))
    }
}

/// Parse an ISO date (YYYY-MM-DD) for date predicates.
pub fn parse_date(value: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| ValidationError::Date(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Position, PostPayload};
    use crate::validated::PostUri;
    use chrono::{TimeZone, Utc};

    fn event_with_tag(tag: &str) -> PostEvent {
        PostPayload::new(
            PostUri::parse("at://carol.example.com/app.bsky.feed.post/1").unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        )
        .with_hashtags([Hashtag::parse(tag).unwrap()])
        .with_author(Handle::parse("carol.example.com").unwrap())
        .at(Position::new(1))
    }

    #[test]
    fn test_retry_policy_rejects_zero_delay() {
        assert!(RetryPolicy::new(2, Duration::ZERO).is_err());
        let policy = RetryPolicy::new(2, Duration::from_millis(100)).unwrap();
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn test_policy_json_format() {
        let policy = FilterErrorPolicy::Retry(RetryPolicy::new(2, Duration::from_millis(100)).unwrap());
        let json = serde_json::to_value(policy).unwrap();
        assert_eq!(json["type"], "retry");
        assert_eq!(json["maxRetries"], 2);
        assert_eq!(json["baseDelayMs"], 100);

        let exclude: FilterErrorPolicy = serde_json::from_str(r#"{"type":"exclude"}"#).unwrap();
        assert_eq!(exclude, FilterErrorPolicy::Exclude);
    }

    #[test]
    fn test_policy_json_rejects_zero_delay() {
        let result: Result<FilterErrorPolicy, _> =
            serde_json::from_str(r#"{"type":"retry","maxRetries":1,"baseDelayMs":0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_predicates() {
        let event = event_with_tag("a");
        assert!(EventPredicate::Any.matches(&event));
        assert!(EventPredicate::Hashtag(Hashtag::parse("a").unwrap()).matches(&event));
        assert!(!EventPredicate::Hashtag(Hashtag::parse("b").unwrap()).matches(&event));
        assert!(EventPredicate::Author(Handle::parse("carol.example.com").unwrap()).matches(&event));
        assert!(EventPredicate::CreatedBefore(parse_date("2024-05-02").unwrap()).matches(&event));
        assert!(!EventPredicate::CreatedAfter(parse_date("2024-05-01").unwrap()).matches(&event));
        assert!(!EventPredicate::Deleted.matches(&event));
    }

    #[test]
    fn test_rule_json() {
        let json = r#"{"when":{"hashtag":"spam"},"policy":{"type":"exclude"}}"#;
        let rule: FilterRule = serde_json::from_str(json).unwrap();
        assert_eq!(
            rule,
            FilterRule::exclude(EventPredicate::Hashtag(Hashtag::parse("spam").unwrap()))
        );

        let any: FilterRule = serde_json::from_str(r#"{"when":"any","policy":{"type":"include"}}"#).unwrap();
        assert_eq!(any.when, EventPredicate::Any);
    }
}
