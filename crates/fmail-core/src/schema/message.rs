//! Message record schema.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Advisory delivery priority. Ordering follows declaration order so filter
/// comparisons (`>= level`) work via `Ord`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// One stored message: a single JSON file `topics/<name>/<id>.json` or
/// `dm/<lo>__<hi>/<id>.json`.
///
/// Messages are immutable once written. The id is authoritative for
/// ordering; `time` is the human-readable echo of its timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Sortable id, `YYYYMMDD-HHMMSS-NNNN`, unique within a project
    pub id: String,

    /// Sender agent name (lowercase)
    pub from: String,

    /// Target: topic name, or `@<agent>` for a DM
    pub to: String,

    /// RFC3339 UTC timestamp with second resolution, derived from `id`
    pub time: String,

    /// UTF-8 message body
    pub body: String,

    /// Advisory reference to another message id; never validated to exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Delivery priority; absent means `normal`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    /// Ordered, deduplicated tag tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    /// Unknown fields for forward compatibility
    #[serde(flatten)]
    pub unknown_fields: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Priority with the default applied.
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    /// Tag slice, empty when absent.
    pub fn tag_slice(&self) -> &[String] {
        self.tags.as_deref().unwrap_or_default()
    }

    /// True when the target is a DM (`@`-prefixed).
    pub fn is_dm(&self) -> bool {
        self.to.starts_with('@')
    }

    /// For a DM, the peer agent named in `to`.
    pub fn dm_peer(&self) -> Option<&str> {
        self.to.strip_prefix('@')
    }
}
