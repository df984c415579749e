//! Agent registration records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Registration record stored at `agents/<name>.json`.
///
/// Registration merely records presence; sending does not require it unless
/// the broker is enforcing registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent name (lowercase)
    pub name: String,

    /// Free-form status line (e.g. "reviewing")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// RFC3339 timestamp of the last registration or broker handshake
    pub last_seen: String,

    /// Unknown fields for forward compatibility
    #[serde(flatten)]
    pub unknown_fields: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let json = r#"{"name":"alice","status":"reviewing","last_seen":"2026-02-10T05:19:02Z"}"#;
        let rec: AgentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.name, "alice");
        assert_eq!(rec.status.as_deref(), Some("reviewing"));
        let reparsed: AgentRecord =
            serde_json::from_str(&serde_json::to_string(&rec).unwrap()).unwrap();
        assert_eq!(reparsed.last_seen, rec.last_seen);
    }

    #[test]
    fn status_optional() {
        let rec: AgentRecord =
            serde_json::from_str(r#"{"name":"bob","last_seen":"2026-02-10T05:19:02Z"}"#).unwrap();
        assert!(rec.status.is_none());
        assert!(!serde_json::to_string(&rec).unwrap().contains("status"));
    }
}
