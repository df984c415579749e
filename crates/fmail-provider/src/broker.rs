//! Broker provider: JSON-line client for push delivery.
//!
//! One-shot queries still read the filesystem (the store is the
//! authoritative replica); only `send` and `subscribe` travel over the
//! socket. Subscriptions reconnect with `since_seq` replay and fall back to
//! a one-shot file catch-up when the broker has dropped the requested
//! history.

use crate::discovery::{self, BoxedRead, BoxedWrite, BrokerEndpoint};
use crate::error::ProviderError;
use crate::file::{self, FileProvider};
use crate::provider::Provider;
use crate::subscription::{self, Subscription, SubscriptionSender};
use forge_mail_core::schema::WatchTarget;
use async_trait::async_trait;
use forge_mail_core::config::ProviderConfig;
use forge_mail_core::filter::MessageFilter;
use forge_mail_core::msgid::id_timestamp_rfc3339;
use forge_mail_core::proto::{
    ClientCommand, ErrorCode, IDLE_TIMEOUT, MsgEnvelope, PROTOCOL_VERSION, Reply, ServerLine,
    WireFilter,
};
use forge_mail_core::schema::{DmConversation, Message, TopicInfo};
use forge_mail_core::store::{Draft, MailStore};
use forge_mail_core::validate::{normalize_agent, normalize_tags, normalize_target, validate_body};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// Fallback hello identity for processes without `FMAIL_AGENT`.
const ANONYMOUS_AGENT: &str = "anonymous";

/// Push-delivery provider backed by a running broker.
#[derive(Debug)]
pub struct BrokerProvider {
    inner: FileProvider,
    endpoint: BrokerEndpoint,
    project: String,
}

impl BrokerProvider {
    /// Connect-time construction: resolves the project id so every later
    /// handshake can present it.
    pub async fn new(
        store: Arc<MailStore>,
        me: Option<String>,
        endpoint: BrokerEndpoint,
    ) -> Result<Self, ProviderError> {
        Self::with_config(store, me, endpoint, ProviderConfig::default()).await
    }

    pub async fn with_config(
        store: Arc<MailStore>,
        me: Option<String>,
        endpoint: BrokerEndpoint,
        cfg: ProviderConfig,
    ) -> Result<Self, ProviderError> {
        let meta_store = store.clone();
        let project = tokio::task::spawn_blocking(move || meta_store.project_id())
            .await
            .map_err(|e| ProviderError::Task(e.to_string()))??;
        Ok(Self {
            inner: FileProvider::with_config(store, me, cfg),
            endpoint,
            project,
        })
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    fn agent_name(&self) -> String {
        self.inner
            .identity()
            .map_or_else(|| ANONYMOUS_AGENT.to_string(), str::to_string)
    }
}

#[async_trait]
impl Provider for BrokerProvider {
    async fn send(&self, draft: &Draft) -> Result<Message, ProviderError> {
        send_via_broker(&self.endpoint, &self.project, &self.agent_name(), draft).await
    }

    async fn messages(
        &self,
        target: &WatchTarget,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>, ProviderError> {
        self.inner.messages(target, filter).await
    }

    async fn topics(&self) -> Result<Vec<TopicInfo>, ProviderError> {
        self.inner.topics().await
    }

    async fn dms(&self) -> Result<Vec<DmConversation>, ProviderError> {
        self.inner.dms().await
    }

    async fn subscribe(
        &self,
        target: WatchTarget,
        filter: MessageFilter,
    ) -> Result<Subscription, ProviderError> {
        filter.validate()?;
        let (sender, sub) = subscription::channel();
        let store = self.inner.store().clone();
        let endpoint = self.endpoint.clone();
        let project = self.project.clone();
        let agent = self.agent_name();
        let reconnect = self.inner.config().reconnect_interval();
        tokio::spawn(async move {
            stream_with_reconnect(
                store,
                endpoint,
                project,
                agent,
                target,
                filter,
                reconnect,
                IDLE_TIMEOUT,
                sender,
            )
            .await;
        });
        Ok(sub)
    }
}

// ── Connection primitives ────────────────────────────────────────────────────

/// One handshaken broker connection.
pub(crate) struct BrokerConn {
    reader: BufReader<BoxedRead>,
    writer: BoxedWrite,
    /// Broker session id; changes across broker restarts.
    pub(crate) session: String,
}

impl std::fmt::Debug for BrokerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConn")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Dial and run the hello handshake.
pub(crate) async fn connect(
    endpoint: &BrokerEndpoint,
    project: &str,
    agent: &str,
) -> Result<BrokerConn, ProviderError> {
    let (mut reader, mut writer) = discovery::dial(endpoint).await?;
    write_line(
        &mut writer,
        &ClientCommand::Hello {
            project: project.to_string(),
            agent: agent.to_string(),
            version: PROTOCOL_VERSION,
        },
    )
    .await?;
    let reply = read_reply(&mut reader, IDLE_TIMEOUT).await?;
    let reply = into_result(reply)?;
    let session = reply
        .session
        .ok_or_else(|| ProviderError::Protocol("hello ack missing session".to_string()))?;
    debug!(%endpoint, %session, "broker handshake complete");
    Ok(BrokerConn {
        reader,
        writer,
        session,
    })
}

impl BrokerConn {
    /// Send one command and wait for its reply, skipping interleaved
    /// keepalives.
    pub(crate) async fn request(&mut self, cmd: &ClientCommand) -> Result<Reply, ProviderError> {
        write_line(&mut self.writer, cmd).await?;
        read_reply(&mut self.reader, IDLE_TIMEOUT).await
    }
}

async fn write_line(
    writer: &mut BoxedWrite,
    cmd: &ClientCommand,
) -> Result<(), ProviderError> {
    let mut line = serde_json::to_string(cmd)
        .map_err(|e| ProviderError::Protocol(format!("failed to encode command: {e}")))?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ProviderError::Disconnected(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| ProviderError::Disconnected(e.to_string()))?;
    Ok(())
}

/// Read one line within `timeout`. `Ok(None)` is a clean EOF.
async fn read_line(
    reader: &mut BufReader<BoxedRead>,
    timeout: Duration,
) -> Result<Option<String>, ProviderError> {
    let mut line = String::new();
    let n = tokio::time::timeout(timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| ProviderError::Disconnected("idle timeout".to_string()))?
        .map_err(|e| ProviderError::Disconnected(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

fn parse_line(line: &str) -> Result<ServerLine, ProviderError> {
    serde_json::from_str(line.trim())
        .map_err(|e| ProviderError::Protocol(format!("malformed server line: {e}")))
}

/// Read until a request/ack reply shows up.
async fn read_reply(
    reader: &mut BufReader<BoxedRead>,
    timeout: Duration,
) -> Result<Reply, ProviderError> {
    loop {
        let line = read_line(reader, timeout)
            .await?
            .ok_or_else(|| ProviderError::Disconnected("connection closed".to_string()))?;
        match parse_line(&line)? {
            ServerLine::Reply(reply) => return Ok(reply),
            ServerLine::Keepalive(_) | ServerLine::Pong(_) => continue,
            ServerLine::Msg(env) => {
                warn!(seq = env.seq, "unexpected msg envelope while awaiting reply");
            }
        }
    }
}

fn into_result(reply: Reply) -> Result<Reply, ProviderError> {
    if reply.ok {
        return Ok(reply);
    }
    match reply.error {
        Some(err) if err.code == ErrorCode::InvalidProject => Err(ProviderError::InvalidProject),
        Some(err) => Err(ProviderError::Rejected {
            code: err.code,
            message: err.message,
        }),
        None => Err(ProviderError::Protocol(
            "error reply without error body".to_string(),
        )),
    }
}

// ── Send path ────────────────────────────────────────────────────────────────

/// Publish one message through the broker on a fresh connection.
///
/// The broker persists through the file store and acks with the
/// authoritative id; the returned [`Message`] is reconstructed locally from
/// the validated draft plus that id.
pub(crate) async fn send_via_broker(
    endpoint: &BrokerEndpoint,
    project: &str,
    agent: &str,
    draft: &Draft,
) -> Result<Message, ProviderError> {
    // Validate locally first: a doomed request never dials.
    let from = normalize_agent(&draft.from)?;
    let target = normalize_target(&draft.to, Some(&from))?;
    validate_body(&draft.body)?;
    let tags = normalize_tags(&draft.tags);

    let mut conn = connect(endpoint, project, agent).await?;
    let reply = conn
        .request(&ClientCommand::Send {
            to: target.to_field(),
            body: draft.body.clone(),
            reply_to: draft.reply_to.clone(),
            priority: draft.priority,
            tags: tags.clone(),
        })
        .await?;
    let reply = into_result(reply)?;
    let id = reply
        .id
        .ok_or_else(|| ProviderError::Protocol("send ack missing id".to_string()))?;
    debug!(%id, seq = ?reply.seq, "broker accepted send");

    Ok(Message {
        time: id_timestamp_rfc3339(&id).unwrap_or_default(),
        id,
        from,
        to: target.to_field(),
        body: draft.body.clone(),
        reply_to: draft.reply_to.clone(),
        priority: draft.priority,
        tags: if tags.is_empty() { None } else { Some(tags) },
        unknown_fields: HashMap::new(),
    })
}

// ── Watch path ───────────────────────────────────────────────────────────────

/// Ack data from opening a watch.
pub(crate) struct WatchAck {
    pub(crate) oldest_retained_seq: Option<u64>,
}

pub(crate) async fn open_watch(
    conn: &mut BrokerConn,
    target: &WatchTarget,
    filter: &MessageFilter,
    since_seq: Option<u64>,
) -> Result<WatchAck, ProviderError> {
    let reply = conn
        .request(&ClientCommand::Watch {
            target: target.wire_name(),
            since_seq,
            filter: WireFilter::from_filter(filter),
        })
        .await?;
    let reply = into_result(reply)?;
    Ok(WatchAck {
        oldest_retained_seq: reply.oldest_retained_seq,
    })
}

/// Outcome of a single streaming attachment.
pub(crate) enum StreamEnd {
    Cancelled,
    Lost(ProviderError),
}

/// Pump message envelopes from an open watch until cancellation or loss.
///
/// `last_seq` tracks the broker sequence for reconnect replay; `cursor`
/// tracks the highest emitted id so replays and catch-ups never
/// double-emit.
pub(crate) async fn pump_watch(
    conn: &mut BrokerConn,
    target: &WatchTarget,
    filter: &MessageFilter,
    idle_timeout: Duration,
    sender: &SubscriptionSender,
    last_seq: &mut Option<u64>,
    cursor: &mut Option<String>,
) -> StreamEnd {
    loop {
        let line = tokio::select! {
            _ = sender.token().cancelled() => return StreamEnd::Cancelled,
            line = read_line(&mut conn.reader, idle_timeout) => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                return StreamEnd::Lost(ProviderError::Disconnected(
                    "connection closed".to_string(),
                ));
            }
            Err(e) => return StreamEnd::Lost(e),
        };
        match parse_line(&line) {
            Ok(ServerLine::Msg(MsgEnvelope { msg, seq })) => {
                *last_seq = Some(last_seq.map_or(seq, |s| s.max(seq)));
                if already_emitted(cursor, &msg.id) {
                    continue;
                }
                if !target.matches(&msg) || !filter.matches(&msg) {
                    continue;
                }
                *cursor = Some(msg.id.clone());
                if !sender.emit(msg).await {
                    return StreamEnd::Cancelled;
                }
            }
            Ok(ServerLine::Keepalive(_)) | Ok(ServerLine::Pong(_)) => {}
            Ok(ServerLine::Reply(reply)) => {
                let detail = reply
                    .error
                    .map_or_else(|| "stream reply".to_string(), |e| format!("{}: {}", e.code, e.message));
                return StreamEnd::Lost(ProviderError::Disconnected(detail));
            }
            Err(e) => return StreamEnd::Lost(e),
        }
    }
}

fn already_emitted(cursor: &Option<String>, id: &str) -> bool {
    cursor.as_deref().is_some_and(|c| id <= c)
}

/// One-shot file catch-up for history the broker no longer retains.
pub(crate) async fn file_catch_up(
    store: &Arc<MailStore>,
    target: &WatchTarget,
    filter: &MessageFilter,
    cursor: &mut Option<String>,
    sender: &SubscriptionSender,
) -> Result<(), ProviderError> {
    let scan_store = store.clone();
    let scan_target = target.clone();
    let scan_filter = MessageFilter {
        limit: None,
        ..filter.clone()
    };
    let messages = tokio::task::spawn_blocking(move || {
        file::scan(&scan_store, &scan_target, &scan_filter)
    })
    .await
    .map_err(|e| ProviderError::Task(e.to_string()))?
    .map_err(ProviderError::from)?;

    for msg in messages {
        if already_emitted(cursor, &msg.id) {
            continue;
        }
        *cursor = Some(msg.id.clone());
        if !sender.emit(msg).await {
            break;
        }
    }
    Ok(())
}

/// Reconnecting subscription loop used by [`BrokerProvider::subscribe`].
#[allow(clippy::too_many_arguments)]
async fn stream_with_reconnect(
    store: Arc<MailStore>,
    endpoint: BrokerEndpoint,
    project: String,
    agent: String,
    target: WatchTarget,
    filter: MessageFilter,
    reconnect_interval: Duration,
    idle_timeout: Duration,
    sender: SubscriptionSender,
) {
    let mut last_seq: Option<u64> = None;
    let mut cursor: Option<String> = None;
    let mut session: Option<String> = None;

    loop {
        if sender.is_cancelled() {
            return;
        }
        match connect(&endpoint, &project, &agent).await {
            Ok(mut conn) => {
                // A new session id means the broker restarted and its
                // sequence space reset; our old high-water mark is
                // meaningless, so catch up from disk and resume from "now".
                if session.as_ref().is_some_and(|s| *s != conn.session) {
                    debug!(session = %conn.session, "broker session changed, file catch-up");
                    last_seq = None;
                    if let Err(e) =
                        file_catch_up(&store, &target, &filter, &mut cursor, &sender).await
                    {
                        sender.fail(e).await;
                        return;
                    }
                }
                session = Some(conn.session.clone());

                let since_seq = last_seq.map(|s| s + 1);
                match open_watch(&mut conn, &target, &filter, since_seq).await {
                    Ok(ack) => {
                        if history_dropped(since_seq, ack.oldest_retained_seq) {
                            debug!(
                                ?since_seq,
                                oldest = ?ack.oldest_retained_seq,
                                "replay gap, file catch-up"
                            );
                            if let Err(e) =
                                file_catch_up(&store, &target, &filter, &mut cursor, &sender)
                                    .await
                            {
                                sender.fail(e).await;
                                return;
                            }
                        }
                        match pump_watch(
                            &mut conn,
                            &target,
                            &filter,
                            idle_timeout,
                            &sender,
                            &mut last_seq,
                            &mut cursor,
                        )
                        .await
                        {
                            StreamEnd::Cancelled => return,
                            StreamEnd::Lost(e) => {
                                debug!("broker stream lost: {e}; reconnecting");
                            }
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        debug!("broker watch attempt failed: {e}; retrying");
                    }
                    Err(e) => {
                        sender.fail(e).await;
                        return;
                    }
                }
            }
            Err(e) if e.is_recoverable() => {
                debug!("broker connect failed: {e}; retrying");
            }
            Err(e) => {
                sender.fail(e).await;
                return;
            }
        }

        tokio::select! {
            _ = sender.token().cancelled() => return,
            _ = tokio::time::sleep(reconnect_interval) => {}
        }
    }
}

/// A replay gap exists when the broker's oldest retained sequence is newer
/// than the one we asked to resume from.
pub(crate) fn history_dropped(since_seq: Option<u64>, oldest_retained: Option<u64>) -> bool {
    match (since_seq, oldest_retained) {
        (Some(want), Some(oldest)) => oldest > want,
        _ => false,
    }
}

/// Quick status probe: one connection, one `status` command.
pub async fn query_broker_status(
    endpoint: &BrokerEndpoint,
    project: &str,
    agent: &str,
) -> Result<serde_json::Value, ProviderError> {
    let mut conn = connect(endpoint, project, agent).await?;
    let reply = conn.request(&ClientCommand::Status).await?;
    let reply = into_result(reply)?;
    Ok(reply.payload.unwrap_or(serde_json::Value::Null))
}
