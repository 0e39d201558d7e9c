//! Topic subscription parameters.

use std::time::Duration;

use crate::config::{DEFAULT_STREAM_MAX_ATTEMPTS, DEFAULT_STREAM_MAX_BACKOFF, STREAM_BASE_BACKOFF};
use crate::error::{ClientError, Result};
use crate::id::TopicId;

use super::message::Timestamp;

/// What to stream and how hard to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicQuery {
    pub topic_id: TopicId,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    /// Stream items to deliver in total. Zero means no limit.
    pub limit: u64,
    /// Reconnects allowed after retryable stream errors. `None` takes the
    /// client's `stream_max_attempts`.
    pub max_attempts: Option<u32>,
    /// `None` takes the client's `stream_max_backoff_ms`.
    pub max_backoff: Option<Duration>,
}

impl TopicQuery {
    pub fn new(topic_id: TopicId) -> Self {
        Self {
            topic_id,
            start_time: None,
            end_time: None,
            limit: 0,
            max_attempts: None,
            max_backoff: None,
        }
    }

    pub fn with_start_time(mut self, start: Timestamp) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_end_time(mut self, end: Timestamp) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Caps the reconnect delay. Must be at least the base delay.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Result<Self> {
        if max_backoff < STREAM_BASE_BACKOFF {
            return Err(ClientError::Config(format!(
                "max_backoff must be at least {}ms",
                STREAM_BASE_BACKOFF.as_millis()
            )));
        }
        self.max_backoff = Some(max_backoff);
        Ok(self)
    }

    /// Fills in whatever the caller left unset.
    pub fn or_defaults(mut self, max_attempts: u32, max_backoff: Duration) -> Self {
        self.max_attempts.get_or_insert(max_attempts);
        self.max_backoff.get_or_insert(max_backoff);
        self
    }

    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_STREAM_MAX_ATTEMPTS)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        self.max_backoff.unwrap_or(DEFAULT_STREAM_MAX_BACKOFF)
    }

    /// The query for a reconnect after `emitted` items, the last one at
    /// `last`. Starts one nanosecond after `last` and asks only for what
    /// the limit has left. `None` means the limit is already met.
    pub fn resume(&self, last: Option<Timestamp>, emitted: u64) -> Option<Self> {
        let mut next = self.clone();
        if self.limit > 0 {
            if emitted >= self.limit {
                return None;
            }
            next.limit = self.limit - emitted;
        }
        if let Some(last) = last {
            next.start_time = Some(last.plus_nanos(1));
        }
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_unchanged() {
        let query = TopicQuery::new(TopicId::from_num(9)).with_limit(5);
        assert_eq!(query.resume(None, 0), Some(query.clone()));
    }

    #[test]
    fn resume_skips_delivered_items() {
        let query = TopicQuery::new(TopicId::from_num(9))
            .with_start_time(Timestamp::new(1, 0))
            .with_limit(10);
        let next = query.resume(Some(Timestamp::new(50, 7)), 4).unwrap();
        assert_eq!(next.limit, 6);
        assert_eq!(next.start_time, Some(Timestamp::new(50, 8)));
    }

    #[test]
    fn unlimited_stays_unlimited() {
        let query = TopicQuery::new(TopicId::from_num(9));
        let next = query.resume(Some(Timestamp::new(50, 0)), 1000).unwrap();
        assert_eq!(next.limit, 0);
    }

    #[test]
    fn met_limit_has_nothing_to_resume() {
        let query = TopicQuery::new(TopicId::from_num(9)).with_limit(3);
        assert!(query.resume(Some(Timestamp::new(50, 0)), 3).is_none());
    }

    #[test]
    fn defaults_fill_only_unset_fields() {
        let query = TopicQuery::new(TopicId::from_num(9))
            .with_max_attempts(2)
            .or_defaults(7, Duration::from_secs(3));
        assert_eq!(query.attempt_budget(), 2);
        assert_eq!(query.backoff_ceiling(), Duration::from_secs(3));

        let bare = TopicQuery::new(TopicId::from_num(9));
        assert_eq!(bare.attempt_budget(), DEFAULT_STREAM_MAX_ATTEMPTS);
        assert_eq!(bare.backoff_ceiling(), DEFAULT_STREAM_MAX_BACKOFF);
    }

    #[test]
    fn tiny_max_backoff_is_rejected() {
        let query = TopicQuery::new(TopicId::from_num(9));
        assert!(query.clone().with_max_backoff(Duration::from_millis(100)).is_err());
        assert!(query.with_max_backoff(Duration::from_secs(1)).is_ok());
    }
}
