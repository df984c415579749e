//! Broker wire protocol types.
//!
//! The broker speaks newline-delimited JSON over a stream socket (Unix
//! domain preferred, TCP loopback fallback). Each line is exactly one JSON
//! object terminated by `\n`; there is no other framing.
//!
//! ```json
//! // Handshake (first line from the client)
//! {"cmd":"hello","project":"proj-abc123","agent":"alice","version":1}
//! {"ok":true,"session":"s-7fa","server_version":1}
//! // Send
//! {"cmd":"send","to":"task","body":"hi","reply_to":null,"priority":"normal","tags":[]}
//! {"ok":true,"id":"20260210-051902-3581","seq":42}
//! // Watch
//! {"cmd":"watch","target":"task","since_seq":42,"filter":{"from":null,"priority":null,"tags":[]}}
//! {"ok":true,"sub":"w-001","oldest_retained_seq":40}
//! {"msg":{...},"seq":43}
//! ```
//!
//! The client side lives in `forge-mail-provider`; the server side in
//! `forge-mail-broker`.

use crate::filter::MessageFilter;
use crate::schema::{Message, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Socket filename inside `.fmail/`.
pub const SOCKET_FILE_NAME: &str = "forged.sock";

/// Default TCP loopback port probed when no socket is present.
pub const DEFAULT_TCP_PORT: u16 = 7463;

/// How long a client waits for a connection to be established.
pub const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(200);

/// Server-side write-inactivity bound; a keepalive goes out at this cadence.
pub const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// Client-side read bound: a link with no line for this long is dead.
pub const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Pause between client reconnection attempts.
pub const RECONNECT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Machine-readable error kinds in error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidProject,
    InvalidName,
    BodyTooLarge,
    BodyEmpty,
    SlowConsumer,
    Protocol,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidProject => "invalid_project",
            ErrorCode::InvalidName => "invalid_name",
            ErrorCode::BodyTooLarge => "body_too_large",
            ErrorCode::BodyEmpty => "body_empty",
            ErrorCode::SlowConsumer => "slow_consumer",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Error payload inside a `{"ok":false,...}` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

/// A command line from client to broker, discriminated by `cmd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Handshake; must be the first line on a connection.
    Hello {
        project: String,
        agent: String,
        version: u32,
    },
    /// Publish one message.
    Send {
        to: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<Priority>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },
    /// Open a subscription. `target` is a topic name, `@<agent>` for the
    /// DM conversation with that agent, or `*` for all topics.
    Watch {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_seq: Option<u64>,
        #[serde(default)]
        filter: WireFilter,
    },
    /// Record presence for the connected agent.
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    /// Remove the connected agent's registration record.
    Unregister,
    /// Broker session statistics.
    Status,
    /// Liveness probe; answered with a pong.
    Ping,
}

/// Serializable subset of [`MessageFilter`] carried in `watch` commands.
/// Time bounds travel as RFC3339 strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl WireFilter {
    pub fn from_filter(filter: &MessageFilter) -> Self {
        Self {
            since: filter.since.map(rfc3339),
            until: filter.until.map(rfc3339),
            from: filter.from.clone(),
            priority: filter.priority,
            tags: filter.tags.clone(),
        }
    }

    /// Back to the engine filter. Malformed timestamps are dropped rather
    /// than failing the watch; the broker re-filters loosely and the client
    /// filters exactly.
    pub fn to_filter(&self) -> MessageFilter {
        MessageFilter {
            since: self.since.as_deref().and_then(parse_rfc3339),
            until: self.until.as_deref().and_then(parse_rfc3339),
            from: self.from.clone(),
            priority: self.priority,
            tags: self.tags.clone(),
            limit: None,
        }
    }
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// A live message pushed to a watcher, with its broker sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgEnvelope {
    pub msg: Message,
    pub seq: u64,
}

/// Periodic server heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keepalive {
    pub keepalive: bool,
    pub ts: String,
}

/// Answer to a `ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub pong: bool,
}

/// Request/acknowledge reply envelope. All fields beyond `ok` are
/// command-specific and optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    /// Broker session id (hello ack); changes across broker restarts so
    /// clients can detect sequence-number discontinuities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<u32>,
    /// Persisted message id (send ack).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Broker sequence number (send ack).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Subscription label (watch ack).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Oldest sequence number the broker can still replay (watch ack).
    /// A client that asked for an older `since_seq` has a history gap and
    /// should catch up from the file store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_retained_seq: Option<u64>,
    /// Command-specific payload (status).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn hello_ok(session: impl Into<String>) -> Self {
        Self {
            ok: true,
            session: Some(session.into()),
            server_version: Some(PROTOCOL_VERSION),
            ..Default::default()
        }
    }

    pub fn send_ok(id: impl Into<String>, seq: u64) -> Self {
        Self {
            ok: true,
            id: Some(id.into()),
            seq: Some(seq),
            ..Default::default()
        }
    }

    pub fn watch_ok(sub: impl Into<String>, oldest_retained_seq: u64) -> Self {
        Self {
            ok: true,
            sub: Some(sub.into()),
            oldest_retained_seq: Some(oldest_retained_seq),
            ..Default::default()
        }
    }

    pub fn with_payload(payload: serde_json::Value) -> Self {
        Self {
            ok: true,
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(WireError {
                code,
                message: message.into(),
            }),
            ..Default::default()
        }
    }
}

/// Any line the server can emit, for client-side parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerLine {
    Msg(MsgEnvelope),
    Keepalive(Keepalive),
    Pong(Pong),
    Reply(Reply),
}
