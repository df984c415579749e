//! List-view summaries for topics and DM conversations.
//!
//! Summaries are lazy and allowed to be approximate: counts and last
//! activity come from directory scans of filenames, not from parsing every
//! message body.

use serde::{Deserialize, Serialize};

/// Summary of one topic directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    /// Topic name (equals the directory name)
    pub name: String,

    /// Number of message files present
    pub messages: usize,

    /// RFC3339 timestamp of the newest message, from its filename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
}

/// Summary of one DM conversation involving the querying agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmConversation {
    /// The other agent in the pair
    pub peer: String,

    /// Number of message files present
    pub messages: usize,

    /// RFC3339 timestamp of the newest message, from its filename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
}
