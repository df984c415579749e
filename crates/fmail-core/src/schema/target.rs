//! Send targets, DM pairs, and watch selectors.

use crate::schema::Message;

/// A normalized send target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Public channel; one directory per topic
    Topic(String),
    /// Direct message to the named peer agent
    Dm(String),
}

impl Target {
    /// The `to` field as stored in a message record: the topic name, or
    /// `@<peer>` for a DM.
    pub fn to_field(&self) -> String {
        match self {
            Target::Topic(t) => t.clone(),
            Target::Dm(peer) => format!("@{peer}"),
        }
    }

    pub fn is_dm(&self) -> bool {
        matches!(self, Target::Dm(_))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_field())
    }
}

/// Canonical DM directory name for a pair of agents: the two names joined
/// with `__` in lexicographic order, so both peers resolve the same
/// directory.
pub fn dm_dir_name(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}__{b}")
    } else {
        format!("{b}__{a}")
    }
}

/// Split a DM directory name back into its (lo, hi) agent pair.
pub fn split_dm_dir(dir: &str) -> Option<(&str, &str)> {
    dir.split_once("__")
}

/// What a subscription watches: one topic, one DM conversation, or every
/// topic in the project. The broker and the client-side providers share
/// these matching semantics; `*` never includes DMs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    /// All topics (wire name `*`)
    AllTopics,
    /// A single topic
    Topic(String),
    /// The DM conversation between `me` and `peer`
    Dm { me: String, peer: String },
}

impl WatchTarget {
    /// Parse a raw target string: `*`, `@<agent>`, or a topic name.
    /// DM targets require a known self identity.
    pub fn parse(
        raw: &str,
        me: Option<&str>,
    ) -> Result<Self, crate::validate::ValidationError> {
        use crate::validate::{ValidationError, normalize_agent, normalize_topic};
        let raw = raw.trim();
        if raw == "*" {
            return Ok(WatchTarget::AllTopics);
        }
        if let Some(rest) = raw.strip_prefix('@') {
            let me = me.ok_or(ValidationError::MissingSelf)?;
            let peer = if rest.eq_ignore_ascii_case("me") || rest.eq_ignore_ascii_case("self") {
                me.to_string()
            } else {
                normalize_agent(rest)?
            };
            return Ok(WatchTarget::Dm {
                me: normalize_agent(me)?,
                peer,
            });
        }
        Ok(WatchTarget::Topic(normalize_topic(raw)?))
    }

    /// The target string carried in `watch` commands.
    pub fn wire_name(&self) -> String {
        match self {
            WatchTarget::AllTopics => "*".to_string(),
            WatchTarget::Topic(t) => t.clone(),
            WatchTarget::Dm { peer, .. } => format!("@{peer}"),
        }
    }

    /// Whether `msg` belongs to this target.
    pub fn matches(&self, msg: &Message) -> bool {
        match self {
            WatchTarget::AllTopics => !msg.is_dm(),
            WatchTarget::Topic(t) => msg.to == *t,
            WatchTarget::Dm { me, peer } => match msg.dm_peer() {
                Some(to_agent) => dm_dir_name(&msg.from, to_agent) == dm_dir_name(me, peer),
                None => false,
            },
        }
    }
}

impl std::fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::ValidationError;
    use std::collections::HashMap;

    fn msg(from: &str, to: &str) -> Message {
        Message {
            id: "20260210-051902-0001".to_string(),
            from: from.to_string(),
            to: to.to_string(),
            time: String::new(),
            body: "x".to_string(),
            reply_to: None,
            priority: None,
            tags: None,
            unknown_fields: HashMap::new(),
        }
    }

    #[test]
    fn watch_parse_shapes() {
        assert_eq!(
            WatchTarget::parse("*", None).unwrap(),
            WatchTarget::AllTopics
        );
        assert_eq!(
            WatchTarget::parse("Task", None).unwrap(),
            WatchTarget::Topic("task".to_string())
        );
        assert_eq!(
            WatchTarget::parse("@bob", Some("alice")).unwrap(),
            WatchTarget::Dm {
                me: "alice".to_string(),
                peer: "bob".to_string()
            }
        );
        assert_eq!(
            WatchTarget::parse("@bob", None).unwrap_err(),
            ValidationError::MissingSelf
        );
    }

    #[test]
    fn all_topics_excludes_dms() {
        let target = WatchTarget::AllTopics;
        assert!(target.matches(&msg("alice", "task")));
        assert!(!target.matches(&msg("alice", "@bob")));
    }

    #[test]
    fn dm_matches_both_directions() {
        let target = WatchTarget::Dm {
            me: "alice".to_string(),
            peer: "bob".to_string(),
        };
        assert!(target.matches(&msg("bob", "@alice")));
        assert!(target.matches(&msg("alice", "@bob")));
        assert!(!target.matches(&msg("carol", "@alice")));
        assert!(!target.matches(&msg("alice", "task")));
    }

    #[test]
    fn dm_dir_is_order_independent() {
        assert_eq!(dm_dir_name("bob", "alice"), "alice__bob");
        assert_eq!(dm_dir_name("alice", "bob"), "alice__bob");
        assert_eq!(dm_dir_name("alice", "alice"), "alice__alice");
    }

    #[test]
    fn dm_dir_splits() {
        assert_eq!(split_dm_dir("alice__bob"), Some(("alice", "bob")));
        assert_eq!(split_dm_dir("notadm"), None);
    }

    #[test]
    fn to_field_shapes() {
        assert_eq!(Target::Topic("task".into()).to_field(), "task");
        assert_eq!(Target::Dm("alice".into()).to_field(), "@alice");
    }
}
