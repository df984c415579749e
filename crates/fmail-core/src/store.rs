//! The `.fmail/` on-disk message store.
//!
//! Layout, relative to the project root:
//!
//! ```text
//! .fmail/
//!   project.json        — { "id": "<project-id>", "created": <rfc3339> }
//!   agents/<name>.json  — registration record (status, last_seen)
//!   topics/<name>/<id>.json
//!   dm/<lo>__<hi>/<id>.json
//!   forged.sock         — present only while a broker is running
//!   state/              — reserved for subscriber cursors
//! ```
//!
//! Writers coordinate purely through filename uniqueness plus exclusive
//! create; there is no lock file, and readers never block writers. A reader
//! that sees `<id>.json` is guaranteed to see a complete record: messages
//! are staged in a dot-prefixed temp file, fsynced, then published with a
//! hard-link-then-unlink pair that fails if the name already exists.

use crate::filter::MessageFilter;
use crate::msgid::{IdGenerator, id_floor, id_timestamp_rfc3339, is_message_id};
use crate::root::MAIL_DIR_NAME;
use crate::schema::{
    AgentRecord, DmConversation, Message, Priority, ProjectMeta, Target, TopicInfo, dm_dir_name,
    split_dm_dir,
};
use crate::validate::{
    ValidationError, normalize_agent, normalize_tags, normalize_target, validate_body,
    validate_record_size,
};
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

pub const TOPICS_DIR: &str = "topics";
pub const DM_DIR: &str = "dm";
pub const AGENTS_DIR: &str = "agents";
pub const STATE_DIR: &str = "state";
pub const PROJECT_FILE: &str = "project.json";

/// Id collisions tolerated per send before giving up.
const WRITE_RETRY_LIMIT: u32 = 10;

/// How long to wait for the wall clock to advance when a single second
/// runs out of its 9999 ids, and how many waits to tolerate.
const SEQUENCE_RETRY_SLEEP: std::time::Duration = std::time::Duration::from_millis(120);
const SEQUENCE_RETRY_LIMIT: u32 = 12;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Input failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The query filter is self-contradictory
    #[error(transparent)]
    Filter(#[from] crate::filter::FilterError),

    /// Another writer claimed every id we generated, 10 times in a row
    #[error("message id collided {WRITE_RETRY_LIMIT} times in {dir}")]
    IdCollisionExhausted { dir: PathBuf },

    /// The id generator ran out of sequence numbers and the clock refused
    /// to advance
    #[error("id sequence exhausted within second {second}")]
    SequenceExhausted { second: String },

    /// File I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse or serialize JSON
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The directory is not an initialized project
    #[error("no {MAIL_DIR_NAME} directory at {root}")]
    NotAProject { root: PathBuf },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A message as handed to [`MailStore::send`], before validation and id
/// assignment.
#[derive(Debug, Clone)]
pub struct Draft {
    /// Sender agent name (normalized during send)
    pub from: String,
    /// Raw target string: a topic name or `@<agent>`
    pub to: String,
    /// Message body
    pub body: String,
    /// Advisory reference to an earlier message id
    pub reply_to: Option<String>,
    /// Priority; `None` means normal
    pub priority: Option<Priority>,
    /// Tag tokens (normalized and deduplicated during send)
    pub tags: Vec<String>,
}

impl Draft {
    pub fn new(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            body: body.into(),
            reply_to: None,
            priority: None,
            tags: Vec::new(),
        }
    }
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Message files examined
    pub examined: usize,
    /// Message files deleted
    pub removed: usize,
    /// Stale temp files deleted
    pub removed_tmp: usize,
}

/// Handle to one project's `.fmail/` tree.
#[derive(Debug)]
pub struct MailStore {
    root: PathBuf,
    mail_dir: PathBuf,
    ids: IdGenerator,
}

impl MailStore {
    /// Open an existing project rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let mail_dir = root.join(MAIL_DIR_NAME);
        if !mail_dir.is_dir() {
            return Err(StoreError::NotAProject { root });
        }
        Ok(Self {
            root,
            mail_dir,
            ids: IdGenerator::new(),
        })
    }

    /// Initialize a project at `root` (idempotent) and open it.
    ///
    /// Creates `.fmail/` with its subdirectories and stamps `project.json`
    /// if absent.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let mail_dir = root.join(MAIL_DIR_NAME);
        create_dir_with_mode(&mail_dir, 0o755)?;
        for sub in [TOPICS_DIR, DM_DIR, AGENTS_DIR, STATE_DIR] {
            create_dir_with_mode(&mail_dir.join(sub), 0o755)?;
        }
        let store = Self {
            root,
            mail_dir,
            ids: IdGenerator::new(),
        };
        store.ensure_project_meta()?;
        Ok(store)
    }

    /// Open with an injected id generator (used by tests and by the broker
    /// to share one generator across components).
    pub fn with_generator(root: impl Into<PathBuf>, ids: IdGenerator) -> Result<Self, StoreError> {
        let mut store = Self::open(root)?;
        store.ids = ids;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mail_dir(&self) -> &Path {
        &self.mail_dir
    }

    /// Path of the broker socket inside this project.
    pub fn socket_path(&self) -> PathBuf {
        self.mail_dir.join(crate::proto::SOCKET_FILE_NAME)
    }

    /// Read the project record, stamping it first if this is the first
    /// write to the project.
    pub fn project_meta(&self) -> Result<ProjectMeta, StoreError> {
        self.ensure_project_meta()
    }

    /// The immutable project id.
    pub fn project_id(&self) -> Result<String, StoreError> {
        Ok(self.project_meta()?.id)
    }

    // ── Send path ────────────────────────────────────────────────────────────

    /// Validate, assign an id, and durably persist one message.
    ///
    /// On success the message file exists, is fsynced, and its directory
    /// entry is durable; any future read of the target observes it.
    pub fn send(&self, draft: &Draft) -> Result<Message, StoreError> {
        let from = normalize_agent(&draft.from)?;
        let target = normalize_target(&draft.to, Some(&from))?;
        validate_body(&draft.body)?;
        let tags = normalize_tags(&draft.tags);

        self.ensure_project_meta()?;
        let (dir, file_mode) = self.target_dir(&from, &target);
        match &target {
            Target::Topic(_) => create_dir_with_mode(&dir, 0o755)?,
            Target::Dm(_) => create_dir_with_mode(&dir, 0o700)?,
        }

        for attempt in 0..WRITE_RETRY_LIMIT {
            let id = self.next_id_waiting()?;
            let time = id_timestamp_rfc3339(&id).unwrap_or_default();
            let message = Message {
                id: id.clone(),
                from: from.clone(),
                to: target.to_field(),
                time,
                body: draft.body.clone(),
                reply_to: draft.reply_to.clone(),
                priority: draft.priority,
                tags: if tags.is_empty() {
                    None
                } else {
                    Some(tags.clone())
                },
                unknown_fields: HashMap::new(),
            };
            let final_path = dir.join(format!("{id}.json"));
            let mut bytes = serde_json::to_vec(&message).map_err(|e| StoreError::Json {
                path: final_path.clone(),
                source: e,
            })?;
            bytes.push(b'\n');
            validate_record_size(bytes.len())?;

            if publish_exclusive(&dir, &final_path, &id, &bytes, file_mode)? {
                debug!(id = %message.id, to = %message.to, "message persisted");
                return Ok(message);
            }
            debug!(%id, attempt, "id already taken, retrying");
        }
        Err(StoreError::IdCollisionExhausted { dir })
    }

    fn next_id_waiting(&self) -> Result<String, StoreError> {
        let mut last_second = String::new();
        for _ in 0..SEQUENCE_RETRY_LIMIT {
            match self.ids.next_id() {
                Ok(id) => return Ok(id),
                Err(e) => {
                    last_second = e.second;
                    std::thread::sleep(SEQUENCE_RETRY_SLEEP);
                }
            }
        }
        Err(StoreError::SequenceExhausted {
            second: last_second,
        })
    }

    fn target_dir(&self, from: &str, target: &Target) -> (PathBuf, u32) {
        match target {
            Target::Topic(t) => (self.mail_dir.join(TOPICS_DIR).join(t), 0o644),
            Target::Dm(peer) => (
                self.mail_dir.join(DM_DIR).join(dm_dir_name(from, peer)),
                0o600,
            ),
        }
    }

    // ── Read paths ───────────────────────────────────────────────────────────

    /// Messages in one topic, filtered, in ascending id order.
    pub fn list_topic(
        &self,
        topic: &str,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>, StoreError> {
        let topic = crate::validate::normalize_topic(topic)?;
        filter.validate()?;
        let dir = self.mail_dir.join(TOPICS_DIR).join(topic);
        self.scan_dir(&dir, filter)
    }

    /// Messages in the DM conversation between `me` and `peer`, filtered,
    /// ascending.
    pub fn list_dm(
        &self,
        me: &str,
        peer: &str,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>, StoreError> {
        let me = normalize_agent(me)?;
        let peer = normalize_agent(peer)?;
        filter.validate()?;
        let dir = self.mail_dir.join(DM_DIR).join(dm_dir_name(&me, &peer));
        self.scan_dir(&dir, filter)
    }

    /// Summaries of every topic, sorted by name. Counts and last activity
    /// come from filenames only.
    pub fn list_topics(&self) -> Result<Vec<TopicInfo>, StoreError> {
        let base = self.mail_dir.join(TOPICS_DIR);
        let mut out = Vec::new();
        for name in list_subdirs(&base)? {
            let (messages, last_id) = summarize_dir(&base.join(&name))?;
            out.push(TopicInfo {
                name,
                messages,
                last_activity: last_id.as_deref().and_then(id_timestamp_rfc3339),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Summaries of every DM conversation involving `me`, sorted by peer.
    pub fn list_dms(&self, me: &str) -> Result<Vec<DmConversation>, StoreError> {
        let me = normalize_agent(me)?;
        let base = self.mail_dir.join(DM_DIR);
        let mut out = Vec::new();
        for name in list_subdirs(&base)? {
            let Some((lo, hi)) = split_dm_dir(&name) else {
                continue;
            };
            let peer = if lo == me {
                hi
            } else if hi == me {
                lo
            } else {
                continue;
            };
            let (messages, last_id) = summarize_dir(&base.join(&name))?;
            out.push(DmConversation {
                peer: peer.to_string(),
                messages,
                last_activity: last_id.as_deref().and_then(id_timestamp_rfc3339),
            });
        }
        out.sort_by(|a, b| a.peer.cmp(&b.peer));
        Ok(out)
    }

    /// Ids (sorted, ascending) in a target directory that are strictly
    /// greater than `cursor`. Subscription pollers use this to find fresh
    /// files without parsing anything.
    pub fn ids_after(&self, dir: &Path, cursor: Option<&str>) -> Result<Vec<String>, StoreError> {
        let mut ids = list_message_ids(dir)?;
        if let Some(cursor) = cursor {
            ids.retain(|id| id.as_str() > cursor);
        }
        Ok(ids)
    }

    /// Absolute path of a topic directory.
    pub fn topic_dir(&self, topic: &str) -> PathBuf {
        self.mail_dir.join(TOPICS_DIR).join(topic)
    }

    /// Absolute path of a DM pair directory.
    pub fn dm_dir(&self, a: &str, b: &str) -> PathBuf {
        self.mail_dir.join(DM_DIR).join(dm_dir_name(a, b))
    }

    /// All current topic directory names.
    pub fn topic_names(&self) -> Result<Vec<String>, StoreError> {
        list_subdirs(&self.mail_dir.join(TOPICS_DIR))
    }

    /// Every DM pair with a directory, as `(lo, hi)` agent names.
    pub fn dm_pairs(&self) -> Result<Vec<(String, String)>, StoreError> {
        Ok(list_subdirs(&self.mail_dir.join(DM_DIR))?
            .iter()
            .filter_map(|name| split_dm_dir(name))
            .map(|(lo, hi)| (lo.to_string(), hi.to_string()))
            .collect())
    }

    /// Parse one message file.
    pub fn read_message(&self, path: &Path) -> Result<Message, StoreError> {
        read_message_file(path)
    }

    fn scan_dir(&self, dir: &Path, filter: &MessageFilter) -> Result<Vec<Message>, StoreError> {
        let mut ids = list_message_ids(dir)?;
        if let Some(since) = filter.since {
            let floor = id_floor(since);
            ids.retain(|id| id.as_str() >= floor.as_str());
        }
        if let Some(until) = filter.until {
            let ceil = id_floor(until);
            ids.retain(|id| id.as_str() < ceil.as_str());
        }
        // With no content predicates the limit can truncate before parsing.
        let content_blind =
            filter.from.is_none() && filter.priority.is_none() && filter.tags.is_empty();
        if content_blind
            && let Some(limit) = filter.limit
            && ids.len() > limit
        {
            ids.drain(..ids.len() - limit);
        }

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let path = dir.join(format!("{id}.json"));
            match read_message_file(&path) {
                Ok(msg) => messages.push(msg),
                Err(StoreError::Json { path, source }) => {
                    warn!("skipping malformed message {}: {source}", path.display());
                }
                // A sweep may race the scan; a vanished file is not fatal.
                Err(StoreError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filter.apply(messages))
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Record an agent's presence (atomic overwrite).
    pub fn register(&self, agent: &str, status: Option<&str>) -> Result<AgentRecord, StoreError> {
        let name = normalize_agent(agent)?;
        let dir = self.mail_dir.join(AGENTS_DIR);
        create_dir_with_mode(&dir, 0o755)?;
        let record = AgentRecord {
            name: name.clone(),
            status: status.map(str::to_string),
            last_seen: now_rfc3339(),
            unknown_fields: HashMap::new(),
        };
        let path = dir.join(format!("{name}.json"));
        let tmp = dir.join(format!(".{name}.json.tmp.{}", tmp_suffix()));
        let bytes = serde_json::to_vec(&record).map_err(|e| StoreError::Json {
            path: path.clone(),
            source: e,
        })?;
        fs::write(&tmp, &bytes).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(record)
    }

    /// Bump an agent's `last_seen` without disturbing its status line.
    /// Used by the broker on every handshake so the registry doubles as a
    /// liveness roster.
    pub fn touch(&self, agent: &str) -> Result<AgentRecord, StoreError> {
        let name = normalize_agent(agent)?;
        let existing_status = self
            .list_agents()?
            .into_iter()
            .find(|rec| rec.name == name)
            .and_then(|rec| rec.status);
        self.register(&name, existing_status.as_deref())
    }

    /// Remove an agent's registration record. Missing records are not an
    /// error.
    pub fn unregister(&self, agent: &str) -> Result<(), StoreError> {
        let name = normalize_agent(agent)?;
        let path = self.mail_dir.join(AGENTS_DIR).join(format!("{name}.json"));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// All registered agents, sorted by name.
    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let dir = self.mail_dir.join(AGENTS_DIR);
        let mut out = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let path = entry.path();
            let content = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
            match serde_json::from_slice::<AgentRecord>(&content) {
                Ok(rec) => out.push(rec),
                Err(e) => warn!("skipping malformed agent record {}: {e}", path.display()),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    // ── Retention ────────────────────────────────────────────────────────────

    /// Delete messages older than `max_age` in a single walk over every
    /// target directory. The newest message of each target is always kept
    /// so "last activity" stays meaningful. Idempotent; never runs as a
    /// side effect of a send.
    pub fn sweep(&self, max_age: chrono::Duration) -> Result<SweepStats, StoreError> {
        let cutoff = id_floor(Utc::now() - max_age);
        let mut stats = SweepStats::default();
        for base in [
            self.mail_dir.join(TOPICS_DIR),
            self.mail_dir.join(DM_DIR),
        ] {
            for name in list_subdirs(&base)? {
                let dir = base.join(&name);
                sweep_dir(&dir, &cutoff, &mut stats)?;
            }
        }
        debug!(
            examined = stats.examined,
            removed = stats.removed,
            "retention sweep complete"
        );
        Ok(stats)
    }

    // ── Project record ───────────────────────────────────────────────────────

    fn ensure_project_meta(&self) -> Result<ProjectMeta, StoreError> {
        let path = self.mail_dir.join(PROJECT_FILE);
        match fs::read(&path) {
            Ok(bytes) => {
                return serde_json::from_slice(&bytes).map_err(|e| StoreError::Json {
                    path: path.clone(),
                    source: e,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }

        let created = now_rfc3339();
        let digest = blake3::hash(format!("{}|{created}", self.root.display()).as_bytes());
        let meta = ProjectMeta {
            id: format!("proj-{}", &digest.to_hex().as_str()[..12]),
            created,
        };
        let bytes = serde_json::to_vec_pretty(&meta).map_err(|e| StoreError::Json {
            path: path.clone(),
            source: e,
        })?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut f) => {
                f.write_all(&bytes).map_err(|e| StoreError::io(&path, e))?;
                f.sync_all().map_err(|e| StoreError::io(&path, e))?;
                Ok(meta)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost the creation race; the winner's record is the truth.
                let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Json { path, source: e })
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

// ── Directory helpers ────────────────────────────────────────────────────────

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn tmp_suffix() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn create_dir_with_mode(dir: &Path, mode: u32) -> Result<(), StoreError> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    set_mode(dir, mode)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| StoreError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), StoreError> {
    Ok(())
}

/// Stage `bytes` in a temp file and publish it as `final_path` without ever
/// overwriting an existing entry. Returns `false` when the name was already
/// taken (id collision).
fn publish_exclusive(
    dir: &Path,
    final_path: &Path,
    id: &str,
    bytes: &[u8],
    mode: u32,
) -> Result<bool, StoreError> {
    let tmp = dir.join(format!(".{id}.json.tmp.{}", tmp_suffix()));
    {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(|e| StoreError::io(&tmp, e))?;
        f.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
        f.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    }
    set_mode(&tmp, mode)?;

    // hard_link refuses to clobber, which is the no-overwrite guarantee.
    let published = match fs::hard_link(&tmp, final_path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(final_path, e));
        }
    };
    if let Err(e) = fs::remove_file(&tmp) {
        warn!("failed to remove temp file {}: {e}", tmp.display());
    }
    if published {
        sync_dir(dir)?;
    }
    Ok(published)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    fs::File::open(dir)
        .and_then(|f| f.sync_all())
        .map_err(|e| StoreError::io(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

fn read_message_file(path: &Path) -> Result<Message, StoreError> {
    let content = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&content).map_err(|e| StoreError::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Message ids in `dir`, ascending. Temp files (dot-prefixed) and anything
/// that is not `<id>.json` are ignored.
fn list_message_ids(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if let Some(id) = name.strip_suffix(".json")
            && is_message_id(id)
        {
            ids.push(id.to_string());
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn list_subdirs(base: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(base, e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(base, e))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    out.sort_unstable();
    Ok(out)
}

/// Count plus newest id for a target directory, from filenames only.
fn summarize_dir(dir: &Path) -> Result<(usize, Option<String>), StoreError> {
    let ids = list_message_ids(dir)?;
    let last = ids.last().cloned();
    Ok((ids.len(), last))
}

fn sweep_dir(dir: &Path, cutoff: &str, stats: &mut SweepStats) -> Result<(), StoreError> {
    let ids = list_message_ids(dir)?;
    stats.examined += ids.len();
    let newest = ids.last().cloned();
    for id in &ids {
        if Some(id) == newest.as_ref() {
            continue;
        }
        if id.as_str() < cutoff {
            let path = dir.join(format!("{id}.json"));
            match fs::remove_file(&path) {
                Ok(()) => stats.removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
    }

    // Orphaned temp files embed their id in the name; reap the old ones.
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix('.') else {
            continue;
        };
        let Some((id, _)) = rest.split_once(".json.tmp.") else {
            continue;
        };
        if is_message_id(id) && id < cutoff && fs::remove_file(entry.path()).is_ok() {
            stats.removed_tmp += 1;
        }
    }
    Ok(())
}
