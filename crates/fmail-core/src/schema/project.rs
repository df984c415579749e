//! Project identity record.

use serde::{Deserialize, Serialize};

/// Contents of `.fmail/project.json`, stamped once at initialization and
/// immutable afterwards. The broker uses `id` to reject cross-project
/// connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMeta {
    /// Opaque project id, e.g. `proj-4f1d22a9b0c3`
    pub id: String,

    /// RFC3339 creation timestamp
    pub created: String,
}
