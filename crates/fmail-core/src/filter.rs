//! Message filtering shared by one-shot queries and subscriptions.

use crate::msgid::id_floor;
use crate::schema::{Message, Priority};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Invalid filter combination.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// `since` is not earlier than `until`
    #[error("'since' must be earlier than 'until'")]
    EmptyRange,

    /// Limit of zero can never return anything
    #[error("limit must be at least 1")]
    ZeroLimit,
}

/// Query and subscription filter.
///
/// The time range is half-open: `since <= t < until`. `priority` keeps
/// messages at or above the given level; `tags` requires every listed tag.
/// `limit` bounds one-shot queries and is ignored for subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MessageFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub from: Option<String>,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

impl MessageFilter {
    /// Reject contradictory options before any scan runs.
    pub fn validate(&self) -> Result<(), FilterError> {
        if let (Some(since), Some(until)) = (self.since, self.until)
            && since >= until
        {
            return Err(FilterError::EmptyRange);
        }
        if self.limit == Some(0) {
            return Err(FilterError::ZeroLimit);
        }
        Ok(())
    }

    /// True when `msg` passes every configured predicate except `limit`.
    ///
    /// Time comparison uses the id's lexicographic order against second-
    /// resolution bounds, so it agrees with the scan truncation in the
    /// store.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(since) = self.since
            && msg.id.as_str() < id_floor(since).as_str()
        {
            return false;
        }
        if let Some(until) = self.until
            && msg.id.as_str() >= id_floor(until).as_str()
        {
            return false;
        }
        if let Some(ref from) = self.from
            && msg.from != *from
        {
            return false;
        }
        if let Some(priority) = self.priority
            && msg.effective_priority() < priority
        {
            return false;
        }
        if !self.tags.is_empty() {
            let have = msg.tag_slice();
            if !self.tags.iter().all(|t| have.contains(t)) {
                return false;
            }
        }
        true
    }

    /// Apply the full filter to an id-sorted batch, including `limit`,
    /// which keeps the newest matches. Idempotent.
    pub fn apply(&self, messages: Vec<Message>) -> Vec<Message> {
        let mut kept: Vec<Message> = messages.into_iter().filter(|m| self.matches(m)).collect();
        if let Some(limit) = self.limit
            && kept.len() > limit
        {
            kept.drain(..kept.len() - limit);
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn msg(id: &str, from: &str, priority: Option<Priority>, tags: &[&str]) -> Message {
        Message {
            id: id.to_string(),
            from: from.to_string(),
            to: "task".to_string(),
            time: crate::msgid::id_timestamp_rfc3339(id).unwrap_or_default(),
            body: "x".to_string(),
            reply_to: None,
            priority,
            tags: if tags.is_empty() {
                None
            } else {
                Some(tags.iter().map(|t| t.to_string()).collect())
            },
            unknown_fields: HashMap::new(),
        }
    }

    #[test]
    fn validate_rejects_empty_range_and_zero_limit() {
        let t = Utc.with_ymd_and_hms(2026, 2, 10, 5, 0, 0).unwrap();
        let filter = MessageFilter {
            since: Some(t),
            until: Some(t),
            ..Default::default()
        };
        assert_eq!(filter.validate().unwrap_err(), FilterError::EmptyRange);

        let filter = MessageFilter {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(filter.validate().unwrap_err(), FilterError::ZeroLimit);

        assert!(MessageFilter::default().validate().is_ok());
    }

    #[test]
    fn time_range_is_half_open() {
        let since = Utc.with_ymd_and_hms(2026, 2, 10, 5, 19, 2).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 2, 10, 5, 19, 4).unwrap();
        let filter = MessageFilter {
            since: Some(since),
            until: Some(until),
            ..Default::default()
        };
        assert!(filter.matches(&msg("20260210-051902-0001", "a", None, &[])));
        assert!(filter.matches(&msg("20260210-051903-9999", "a", None, &[])));
        assert!(!filter.matches(&msg("20260210-051904-0001", "a", None, &[])));
        assert!(!filter.matches(&msg("20260210-051901-0001", "a", None, &[])));
    }

    #[test]
    fn priority_is_at_least() {
        let filter = MessageFilter {
            priority: Some(Priority::Normal),
            ..Default::default()
        };
        assert!(!filter.matches(&msg("20260210-051902-0001", "a", Some(Priority::Low), &[])));
        assert!(filter.matches(&msg("20260210-051902-0002", "a", None, &[])));
        assert!(filter.matches(&msg("20260210-051902-0003", "a", Some(Priority::High), &[])));
    }

    #[test]
    fn tags_are_all_of() {
        let filter = MessageFilter {
            tags: vec!["release".to_string(), "urgent".to_string()],
            ..Default::default()
        };
        assert!(filter.matches(&msg("20260210-051902-0001", "a", None, &["urgent", "release"])));
        assert!(!filter.matches(&msg("20260210-051902-0002", "a", None, &["release"])));
        assert!(!filter.matches(&msg("20260210-051902-0003", "a", None, &[])));
    }

    #[test]
    fn limit_keeps_newest() {
        let filter = MessageFilter {
            limit: Some(2),
            ..Default::default()
        };
        let batch = vec![
            msg("20260210-051902-0001", "a", None, &[]),
            msg("20260210-051902-0002", "a", None, &[]),
            msg("20260210-051902-0003", "a", None, &[]),
        ];
        let kept = filter.apply(batch);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, "20260210-051902-0002");
        assert_eq!(kept[1].id, "20260210-051902-0003");
    }

    #[test]
    fn apply_is_idempotent() {
        let filter = MessageFilter {
            from: Some("alice".to_string()),
            limit: Some(3),
            ..Default::default()
        };
        let batch = vec![
            msg("20260210-051902-0001", "alice", None, &[]),
            msg("20260210-051902-0002", "bob", None, &[]),
            msg("20260210-051902-0003", "alice", None, &[]),
        ];
        let once = filter.apply(batch);
        let twice = filter.apply(once.clone());
        assert_eq!(
            once.iter().map(|m| &m.id).collect::<Vec<_>>(),
            twice.iter().map(|m| &m.id).collect::<Vec<_>>()
        );
    }
}
