//! Name and body validation for messages and targets.
//!
//! All functions here are pure: they never touch the filesystem or the
//! network, so both the store and the broker can revalidate cheaply.

use crate::schema::Target;
use thiserror::Error;

/// Maximum length of an agent or topic name, in bytes.
pub const MAX_NAME_LEN: usize = 63;

/// Maximum serialized size of a message record (JSON including metadata),
/// in bytes. A reader can trust a single read to fit common buffers.
pub const MAX_RECORD_BYTES: usize = 1_048_576;

/// Topic names that can never be created; they collide with target-parsing
/// shorthands.
pub const RESERVED_NAMES: [&str; 3] = ["me", "self", "*"];

/// Validation failure for a name, target, or message body.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Name was empty after trimming
    #[error("name cannot be empty")]
    EmptyName,

    /// Message body was empty or whitespace-only
    #[error("message body cannot be empty")]
    EmptyBody,

    /// Name exceeds [`MAX_NAME_LEN`] bytes
    #[error("name '{0}' exceeds {MAX_NAME_LEN} characters")]
    TooLong(String),

    /// Serialized record exceeds [`MAX_RECORD_BYTES`]
    #[error("message is {size} bytes serialized; the limit is {limit} bytes")]
    BodyTooLarge { size: usize, limit: usize },

    /// Name is reserved for target-parsing shorthands
    #[error("'{0}' is a reserved name")]
    ReservedName(String),

    /// Name contains a character outside `[a-z0-9-]` (or does not start
    /// with a letter)
    #[error("name '{name}' contains invalid character '{ch}'")]
    BadCharacter { name: String, ch: char },

    /// `@me`/`@self` was used but no sender identity is known
    #[error("target '@me' requires a sender identity")]
    MissingSelf,

    /// The DM target resolves to the sender itself
    #[error("cannot send a direct message to yourself")]
    SelfDm,
}

/// Normalize and validate an agent name.
///
/// Grammar: `[a-z][a-z0-9-]{0,62}`. Uppercase input is folded to lowercase
/// before checking; anything else (underscores, spaces, `@`, empty) is
/// rejected.
pub fn normalize_agent(s: &str) -> Result<String, ValidationError> {
    let name = s.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong(name));
    }
    let first = name.chars().next().unwrap_or('\0');
    if !first.is_ascii_lowercase() {
        return Err(ValidationError::BadCharacter { name, ch: first });
    }
    if let Some(ch) = name
        .chars()
        .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-')
    {
        return Err(ValidationError::BadCharacter { name, ch });
    }
    Ok(name)
}

/// Normalize and validate a topic name.
///
/// Same grammar as agent names, additionally rejecting the reserved names
/// `me`, `self`, and `*`.
pub fn normalize_topic(s: &str) -> Result<String, ValidationError> {
    let lowered = s.trim().to_ascii_lowercase();
    if RESERVED_NAMES.contains(&lowered.as_str()) {
        return Err(ValidationError::ReservedName(lowered));
    }
    normalize_agent(&lowered)
}

/// Parse a raw target string into a [`Target`].
///
/// A leading `@` marks a DM to the named agent; otherwise the string is a
/// topic name. `@me` and `@self` resolve against `self_agent`. A DM whose
/// resolved peer equals `self_agent` is rejected with
/// [`ValidationError::SelfDm`].
pub fn normalize_target(s: &str, self_agent: Option<&str>) -> Result<Target, ValidationError> {
    let raw = s.trim();
    if let Some(rest) = raw.strip_prefix('@') {
        let lowered = rest.trim().to_ascii_lowercase();
        let peer = if lowered == "me" || lowered == "self" {
            self_agent
                .map(str::to_string)
                .ok_or(ValidationError::MissingSelf)?
        } else {
            normalize_agent(&lowered)?
        };
        if self_agent.is_some_and(|me| me == peer) {
            return Err(ValidationError::SelfDm);
        }
        Ok(Target::Dm(peer))
    } else {
        Ok(Target::Topic(normalize_topic(raw)?))
    }
}

/// Validate a message body before serialization.
///
/// Rejects empty or whitespace-only input and bodies that cannot possibly
/// fit the serialized-record limit. The store re-checks the exact record
/// size after serialization.
pub fn validate_body(body: &str) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    if body.len() > MAX_RECORD_BYTES {
        return Err(ValidationError::BodyTooLarge {
            size: body.len(),
            limit: MAX_RECORD_BYTES,
        });
    }
    Ok(())
}

/// Check a fully serialized record against [`MAX_RECORD_BYTES`].
pub fn validate_record_size(serialized_len: usize) -> Result<(), ValidationError> {
    if serialized_len > MAX_RECORD_BYTES {
        return Err(ValidationError::BodyTooLarge {
            size: serialized_len,
            limit: MAX_RECORD_BYTES,
        });
    }
    Ok(())
}

/// Normalize a tag list: trim, lowercase, drop empties, deduplicate while
/// preserving first-seen order.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for tag in tags {
        let t = tag.as_ref().trim().to_ascii_lowercase();
        if !t.is_empty() && seen.insert(t.clone()) {
            out.push(t);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_lowercases_input() {
        assert_eq!(normalize_agent("Alice").unwrap(), "alice");
        assert_eq!(normalize_agent("CI-Agent-2").unwrap(), "ci-agent-2");
    }

    #[test]
    fn agent_rejects_bad_characters() {
        for bad in ["bad_name", "has space", "@alice", "-leading", "9digit"] {
            let err = normalize_agent(bad).unwrap_err();
            assert!(
                matches!(err, ValidationError::BadCharacter { .. }),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn agent_rejects_empty() {
        assert_eq!(normalize_agent("").unwrap_err(), ValidationError::EmptyName);
        assert_eq!(
            normalize_agent("   ").unwrap_err(),
            ValidationError::EmptyName
        );
    }

    #[test]
    fn agent_rejects_overlong() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            normalize_agent(&name),
            Err(ValidationError::TooLong(_))
        ));
        let max = "a".repeat(MAX_NAME_LEN);
        assert_eq!(normalize_agent(&max).unwrap(), max);
    }

    #[test]
    fn topic_rejects_reserved() {
        for reserved in ["me", "self", "*", "ME", "Self"] {
            assert!(matches!(
                normalize_topic(reserved),
                Err(ValidationError::ReservedName(_))
            ));
        }
        assert_eq!(normalize_topic("task").unwrap(), "task");
    }

    #[test]
    fn target_parses_topic_and_dm() {
        assert_eq!(
            normalize_target("Task", Some("alice")).unwrap(),
            Target::Topic("task".to_string())
        );
        assert_eq!(
            normalize_target("@Bob", Some("alice")).unwrap(),
            Target::Dm("bob".to_string())
        );
    }

    #[test]
    fn target_at_me_resolves_then_rejects_self_dm() {
        assert_eq!(
            normalize_target("@me", Some("alice")).unwrap_err(),
            ValidationError::SelfDm
        );
        assert_eq!(
            normalize_target("@ME", Some("alice")).unwrap_err(),
            ValidationError::SelfDm
        );
        assert_eq!(
            normalize_target("@alice", Some("alice")).unwrap_err(),
            ValidationError::SelfDm
        );
    }

    #[test]
    fn target_at_me_without_identity_is_missing_self() {
        assert_eq!(
            normalize_target("@me", None).unwrap_err(),
            ValidationError::MissingSelf
        );
    }

    #[test]
    fn target_dm_without_identity_is_allowed() {
        // A reader without FMAIL_AGENT can still name an explicit peer.
        assert_eq!(
            normalize_target("@bob", None).unwrap(),
            Target::Dm("bob".to_string())
        );
    }

    #[test]
    fn body_rejects_empty_and_whitespace() {
        assert_eq!(validate_body("").unwrap_err(), ValidationError::EmptyBody);
        assert_eq!(
            validate_body(" \n\t ").unwrap_err(),
            ValidationError::EmptyBody
        );
        assert!(validate_body("x").is_ok());
    }

    #[test]
    fn body_rejects_oversize() {
        let body = "a".repeat(MAX_RECORD_BYTES + 1);
        assert!(matches!(
            validate_body(&body),
            Err(ValidationError::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn record_size_boundary() {
        assert!(validate_record_size(MAX_RECORD_BYTES).is_ok());
        assert!(validate_record_size(MAX_RECORD_BYTES + 1).is_err());
    }

    #[test]
    fn tags_dedupe_preserving_order() {
        let tags = normalize_tags(["Release", "urgent", "release", "", "  "]);
        assert_eq!(tags, vec!["release".to_string(), "urgent".to_string()]);
    }
}
