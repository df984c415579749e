//! Project root resolution and recognized environment variables.
//!
//! A project is anchored at a directory containing `.fmail/`. Resolution
//! walks upward from the starting directory; `FMAIL_ROOT` short-circuits
//! the walk. Creating a project is always an explicit `init`, never a side
//! effect of sending.

use std::path::{Path, PathBuf};

/// Name of the mailbox directory at the project root.
pub const MAIL_DIR_NAME: &str = ".fmail";

/// Identity used for sends when the caller does not pass one explicitly.
pub const ENV_AGENT: &str = "FMAIL_AGENT";

/// Project root override; skips the upward walk.
pub const ENV_ROOT: &str = "FMAIL_ROOT";

/// Broker endpoint override (socket path or `host:port`); skips discovery.
pub const ENV_BROKER: &str = "FMAIL_BROKER";

/// Walk upward from `start` looking for a directory containing `.fmail/`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start;
    loop {
        if dir.join(MAIL_DIR_NAME).is_dir() {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}

/// Resolve the project root: `FMAIL_ROOT` if set and non-empty, otherwise
/// an upward walk from the current directory.
pub fn resolve_root() -> Option<PathBuf> {
    if let Ok(root) = std::env::var(ENV_ROOT)
        && !root.trim().is_empty()
    {
        return Some(PathBuf::from(root));
    }
    let cwd = std::env::current_dir().ok()?;
    find_project_root(&cwd)
}

/// The sender identity from `FMAIL_AGENT`, if set and non-empty.
pub fn env_agent() -> Option<String> {
    std::env::var(ENV_AGENT)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// The broker endpoint override from `FMAIL_BROKER`, if set and non-empty.
pub fn env_broker() -> Option<String> {
    std::env::var(ENV_BROKER)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
