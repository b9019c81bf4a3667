//! Policy evaluation and guarded retries.
//!
//! [`evaluate`] decides an event's [`Disposition`] from the store's ordered
//! filter rules. A `Retry` disposition is resolved by [`run_guarded`], which
//! retries an [`EventGuard`] with exponential backoff and degrades to an
//! exclusion once the retry budget is spent.

use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use postindex_types::{FilterErrorPolicy, FilterRule, PostEvent, RetryPolicy};

use crate::retry;

/// What to do with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Include,
    Exclude,
    /// Admit once the guard passes, within the given retry budget
    Retry(RetryPolicy),
}

/// Disposition of `event` under `rules`: the first matching rule wins and an
/// event no rule matches is included.
pub fn evaluate(event: &PostEvent, rules: &[FilterRule]) -> Disposition {
    rules
        .iter()
        .find(|rule| rule.when.matches(event))
        .map(|rule| match rule.policy {
            FilterErrorPolicy::Include => Disposition::Include,
            FilterErrorPolicy::Exclude => Disposition::Exclude,
            FilterErrorPolicy::Retry(policy) => Disposition::Retry(policy),
        })
        .unwrap_or(Disposition::Include)
}

/// Failure of a guarded check
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// The event is not admissible yet; a later attempt may pass
    #[error("Event not ready: {0}")]
    NotReady(String),

    /// The guard itself failed
    #[error("Guard failed: {0}")]
    Failed(String),
}

/// A check an event must pass before a `Retry` rule admits it.
#[async_trait]
pub trait EventGuard: Send + Sync {
    async fn check(&self, event: &PostEvent) -> Result<(), GuardError>;
}

/// Default guard: an event projects cleanly once its creation time is not
/// ahead of the local clock by more than `max_skew`, so posts stamped in
/// the future are held back until the clock catches up.
#[derive(Debug, Clone)]
pub struct ProjectionGuard {
    max_skew: Duration,
}

impl ProjectionGuard {
    pub fn new(max_skew: Duration) -> Self {
        Self { max_skew }
    }
}

impl Default for ProjectionGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl EventGuard for ProjectionGuard {
    async fn check(&self, event: &PostEvent) -> Result<(), GuardError> {
        let skew = chrono::Duration::from_std(self.max_skew)
            .map_err(|e| GuardError::Failed(e.to_string()))?;
        let horizon = Utc::now() + skew;
        if event.created_at() > horizon {
            return Err(GuardError::NotReady(format!(
                "created_at {} is ahead of the local clock",
                event.created_at().to_rfc3339()
            )));
        }
        Ok(())
    }
}

/// Result of resolving a `Retry` disposition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Admitted { attempts: u32 },
    /// Every attempt failed; the event is excluded and counted
    Exhausted { attempts: u32, error: GuardError },
    Cancelled { attempts: u32 },
}

impl GuardOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            GuardOutcome::Admitted { attempts }
            | GuardOutcome::Exhausted { attempts, .. }
            | GuardOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Run `guard` up to `1 + policy.max_retries()` times, waiting
/// `base_delay * 2^n` (capped at `max_delay`) between attempts.
pub async fn run_guarded(
    guard: &dyn EventGuard,
    event: &PostEvent,
    policy: &RetryPolicy,
    max_delay: Duration,
    cancel: &CancellationToken,
) -> GuardOutcome {
    let mut backoff = retry::exponential(policy.base_delay(), max_delay);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let error = match guard.check(event).await {
            Ok(()) => {
                debug!(uri = %event.uri(), attempts, "Guard passed");
                return GuardOutcome::Admitted { attempts };
            }
            Err(e) => e,
        };

        if attempts >= policy.max_attempts() {
            warn!(
                uri = %event.uri(),
                position = %event.position,
                attempts,
                error = %error,
                "Guard retries exhausted, excluding event"
            );
            return GuardOutcome::Exhausted { attempts, error };
        }

        let delay = backoff.next_backoff().unwrap_or(max_delay);
        debug!(
            uri = %event.uri(),
            attempt = attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Guard failed, retrying"
        );
        if !retry::sleep_or_cancel(delay, cancel).await {
            return GuardOutcome::Cancelled { attempts };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use postindex_types::{EventPredicate, Handle, Hashtag, Position, PostPayload, PostUri};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event(tags: &[&str]) -> PostEvent {
        PostPayload::new(
            PostUri::parse("at://fay.example.com/app.bsky.feed.post/1").unwrap(),
            Utc.with_ymd_and_hms(2024, 4, 4, 4, 4, 4).unwrap(),
        )
        .with_hashtags(tags.iter().map(|t| Hashtag::parse(t).unwrap()))
        .with_author(Handle::parse("fay.example.com").unwrap())
        .at(Position::new(1))
    }

    fn tag(value: &str) -> EventPredicate {
        EventPredicate::Hashtag(Hashtag::parse(value).unwrap())
    }

    fn retry_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1)).unwrap()
    }

    struct CountingGuard {
        calls: AtomicU32,
        pass_on: Option<u32>,
    }

    impl CountingGuard {
        fn failing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                pass_on: None,
            }
        }

        fn passing_on(attempt: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                pass_on: Some(attempt),
            }
        }
    }

    #[async_trait]
    impl EventGuard for CountingGuard {
        async fn check(&self, _event: &PostEvent) -> Result<(), GuardError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.pass_on {
                Some(n) if call >= n => Ok(()),
                _ => Err(GuardError::NotReady(format!("attempt {}", call))),
            }
        }
    }

    #[test]
    fn test_empty_rules_include() {
        assert_eq!(evaluate(&event(&[]), &[]), Disposition::Include);
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            FilterRule::exclude(tag("spam")),
            FilterRule::include(tag("news")),
        ];
        assert_eq!(evaluate(&event(&["spam", "news"]), &rules), Disposition::Exclude);

        let reversed = vec![
            FilterRule::include(tag("news")),
            FilterRule::exclude(tag("spam")),
        ];
        assert_eq!(evaluate(&event(&["spam", "news"]), &reversed), Disposition::Include);
    }

    #[test]
    fn test_no_match_includes() {
        let rules = vec![FilterRule::exclude(tag("spam"))];
        assert_eq!(evaluate(&event(&["rust"]), &rules), Disposition::Include);
    }

    #[test]
    fn test_retry_disposition() {
        let rules = vec![FilterRule::retry(EventPredicate::Any, retry_policy(2))];
        assert_eq!(
            evaluate(&event(&[]), &rules),
            Disposition::Retry(retry_policy(2))
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_makes_exactly_max_attempts() {
        let guard = CountingGuard::failing();
        let outcome = run_guarded(
            &guard,
            &event(&[]),
            &retry_policy(2),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, GuardOutcome::Exhausted { attempts: 3, .. }));
        assert_eq!(guard.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_admits_after_transient_failures() {
        let guard = CountingGuard::passing_on(2);
        let outcome = run_guarded(
            &guard,
            &event(&[]),
            &retry_policy(5),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, GuardOutcome::Admitted { attempts: 2 });
    }

    #[tokio::test]
    async fn test_retry_zero_retries_single_attempt() {
        let guard = CountingGuard::failing();
        let outcome = run_guarded(
            &guard,
            &event(&[]),
            &retry_policy(0),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.attempts(), 1);
    }

    #[tokio::test]
    async fn test_retry_cancelled_during_backoff() {
        let guard = CountingGuard::failing();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::new(3, Duration::from_secs(60)).unwrap();
        let outcome = run_guarded(
            &guard,
            &event(&[]),
            &policy,
            Duration::from_secs(60),
            &cancel,
        )
        .await;
        assert_eq!(outcome, GuardOutcome::Cancelled { attempts: 1 });
    }

    #[tokio::test]
    async fn test_projection_guard() {
        let guard = ProjectionGuard::default();
        assert!(guard.check(&event(&[])).await.is_ok());

        let future = PostPayload::new(
            PostUri::parse("at://fay.example.com/app.bsky.feed.post/2").unwrap(),
            Utc::now() + chrono::Duration::hours(2),
        )
        .at(Position::new(2));
        assert!(matches!(
            guard.check(&future).await,
            Err(GuardError::NotReady(_))
        ));
    }
}
