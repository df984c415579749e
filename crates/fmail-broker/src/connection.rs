//! Per-client connection handling.
//!
//! Each connection follows the line protocol: one `hello` handshake line,
//! then any number of commands. A connection that opens watches also
//! receives `msg` envelopes interleaved with its replies, plus a keepalive
//! whenever nothing has been written for the keepalive interval.

use crate::hub::{HubCommand, HubReject, HubSender, WatchSpec};
use anyhow::{Context, Result};
use forge_mail_core::config::BrokerConfig;
use forge_mail_core::proto::{
    ClientCommand, ErrorCode, IDLE_TIMEOUT, KEEPALIVE_INTERVAL, Keepalive, MsgEnvelope,
    PROTOCOL_VERSION, Pong, Reply,
};
use forge_mail_core::schema::WatchTarget;
use forge_mail_core::store::Draft;
use forge_mail_core::validate::normalize_agent;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Subscription lifecycle, traced per watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubState {
    Pending,
    Replaying,
    Live,
    Closed,
}

/// Serve one client connection to completion.
pub(crate) async fn serve<S>(
    stream: S,
    peer: String,
    hub: HubSender,
    project: String,
    session: String,
    cfg: BrokerConfig,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    // Lines::next_line is cancellation safe, which matters below: the
    // command arm races keepalives and envelope writes in one select.
    let mut lines = BufReader::new(read_half).lines();
    let mut last_write = Instant::now();

    // ── Handshake ────────────────────────────────────────────────────────────
    let first = match tokio::time::timeout(IDLE_TIMEOUT, lines.next_line())
        .await
        .context("handshake timed out")?
        .context("read handshake line")?
    {
        Some(line) => line,
        None => return Ok(()), // connected and left
    };
    let agent = match parse_hello(&first, &project) {
        Ok(agent) => agent,
        Err(reply) => {
            write_json(&mut writer, &reply, &mut last_write).await?;
            return Ok(());
        }
    };
    hub.send(HubCommand::Touch {
        agent: agent.clone(),
    })
    .await
    .ok();
    write_json(&mut writer, &Reply::hello_ok(&session), &mut last_write).await?;
    debug!(peer = %peer, agent = %agent, "client connected");

    // ── Command loop ─────────────────────────────────────────────────────────
    // All watches on a connection share one envelope channel and one kick
    // token; the connection task is the single writer, so replies, replayed
    // envelopes, live envelopes, and keepalives never interleave mid-line.
    let (env_tx, mut env_rx) = mpsc::channel::<crate::hub::EnvelopeItem>(cfg.channel_capacity);
    let kick: Arc<OnceLock<ErrorCode>> = Arc::new(OnceLock::new());
    let kicked = CancellationToken::new();
    let mut sub_ids: Vec<u64> = Vec::new();
    let mut watching = false;

    let outcome: Result<()> = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = kicked.cancelled(), if watching => {
                    let code = kick.get().copied().unwrap_or(ErrorCode::Internal);
                    warn!(peer = %peer, agent = %agent, %code, "dropping subscriber");
                    let reply = Reply::err(code, "subscription dropped");
                    write_json(&mut writer, &reply, &mut last_write).await?;
                    break;
                }
                envelope = env_rx.recv(), if watching => {
                    // The connection holds its own sender, so recv() only
                    // yields real envelopes.
                    if let Some((seq, msg)) = envelope {
                        let envelope = MsgEnvelope { msg: (*msg).clone(), seq };
                        write_json(&mut writer, &envelope, &mut last_write).await?;
                    }
                }
                _ = tokio::time::sleep_until(last_write + KEEPALIVE_INTERVAL) => {
                    let ka = Keepalive {
                        keepalive: true,
                        ts: now_rfc3339(),
                    };
                    write_json(&mut writer, &ka, &mut last_write).await?;
                }
                read = lines.next_line() => {
                    let Some(line) = read.context("read command line")? else {
                        break; // client closed
                    };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let cmd = match serde_json::from_str::<ClientCommand>(trimmed) {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            let reply = Reply::err(
                                ErrorCode::Protocol,
                                format!("malformed command line: {e}"),
                            );
                            write_json(&mut writer, &reply, &mut last_write).await?;
                            continue;
                        }
                    };
                    match cmd {
                        ClientCommand::Hello { .. } => {
                            let reply = Reply::err(
                                ErrorCode::Protocol,
                                "hello is only valid as the first line",
                            );
                            write_json(&mut writer, &reply, &mut last_write).await?;
                        }
                        ClientCommand::Ping => {
                            write_json(&mut writer, &Pong { pong: true }, &mut last_write)
                                .await?;
                        }
                        ClientCommand::Send {
                            to,
                            body,
                            reply_to,
                            priority,
                            tags,
                        } => {
                            let draft = Draft {
                                from: agent.clone(),
                                to,
                                body,
                                reply_to,
                                priority,
                                tags,
                            };
                            let reply = match hub_publish(&hub, draft).await {
                                Ok(ack) => Reply::send_ok(ack.id, ack.seq),
                                Err(reject) => Reply::err(reject.code, reject.message),
                            };
                            write_json(&mut writer, &reply, &mut last_write).await?;
                        }
                        ClientCommand::Watch {
                            target,
                            since_seq,
                            filter,
                        } => {
                            let mut state = SubState::Pending;
                            debug!(watch = %target, ?state, "watch");
                            let selector = match WatchTarget::parse(&target, Some(&agent)) {
                                Ok(selector) => selector,
                                Err(e) => {
                                    let reply =
                                        Reply::err(ErrorCode::InvalidName, e.to_string());
                                    write_json(&mut writer, &reply, &mut last_write).await?;
                                    continue;
                                }
                            };
                            let spec = WatchSpec {
                                selector,
                                filter: filter.to_filter(),
                                since_seq,
                                tx: env_tx.clone(),
                                kick: kick.clone(),
                                kicked: kicked.clone(),
                            };
                            let (reply_tx, reply_rx) = oneshot::channel();
                            hub.send(HubCommand::Watch {
                                spec,
                                reply: reply_tx,
                            })
                            .await
                            .context("hub gone")?;
                            let grant = reply_rx.await.context("hub dropped watch reply")?;
                            sub_ids.push(grant.sub_id);

                            let ack =
                                Reply::watch_ok(&grant.label, grant.oldest_retained_seq);
                            write_json(&mut writer, &ack, &mut last_write).await?;

                            state = SubState::Replaying;
                            debug!(label = %grant.label, ?state, replay = grant.replay.len(), "watch");
                            for (seq, msg) in grant.replay {
                                let envelope = MsgEnvelope {
                                    msg: (*msg).clone(),
                                    seq,
                                };
                                write_json(&mut writer, &envelope, &mut last_write).await?;
                            }
                            state = SubState::Live;
                            debug!(label = %grant.label, ?state, "watch");
                            watching = true;
                        }
                        ClientCommand::Register { status } => {
                            let (reply_tx, reply_rx) = oneshot::channel();
                            hub.send(HubCommand::Register {
                                agent: agent.clone(),
                                status,
                                reply: reply_tx,
                            })
                            .await
                            .context("hub gone")?;
                            let reply = match reply_rx.await.context("hub dropped reply")? {
                                Ok(()) => Reply::ok(),
                                Err(reject) => Reply::err(reject.code, reject.message),
                            };
                            write_json(&mut writer, &reply, &mut last_write).await?;
                        }
                        ClientCommand::Unregister => {
                            let (reply_tx, reply_rx) = oneshot::channel();
                            hub.send(HubCommand::Unregister {
                                agent: agent.clone(),
                                reply: reply_tx,
                            })
                            .await
                            .context("hub gone")?;
                            let reply = match reply_rx.await.context("hub dropped reply")? {
                                Ok(()) => Reply::ok(),
                                Err(reject) => Reply::err(reject.code, reject.message),
                            };
                            write_json(&mut writer, &reply, &mut last_write).await?;
                        }
                        ClientCommand::Status => {
                            let (reply_tx, reply_rx) = oneshot::channel();
                            hub.send(HubCommand::Status { reply: reply_tx })
                                .await
                                .context("hub gone")?;
                            let payload =
                                reply_rx.await.context("hub dropped status reply")?;
                            write_json(
                                &mut writer,
                                &Reply::with_payload(payload),
                                &mut last_write,
                            )
                            .await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    // ── Cleanup ──────────────────────────────────────────────────────────────
    for sub_id in sub_ids {
        let _ = hub.send(HubCommand::Unwatch { sub_id }).await;
        debug!(sub_id, state = ?SubState::Closed, "watch");
    }
    debug!(peer = %peer, agent = %agent, "client disconnected");
    outcome
}

async fn hub_publish(hub: &HubSender, draft: Draft) -> Result<crate::hub::SendAck, HubReject> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let internal = |message: &str| HubReject {
        code: ErrorCode::Internal,
        message: message.to_string(),
    };
    hub.send(HubCommand::Publish {
        draft,
        reply: reply_tx,
    })
    .await
    .map_err(|_| internal("hub unavailable"))?;
    reply_rx
        .await
        .map_err(|_| internal("hub dropped publish reply"))?
}

fn parse_hello(line: &str, project: &str) -> Result<String, Reply> {
    let cmd = serde_json::from_str::<ClientCommand>(line.trim()).map_err(|e| {
        Reply::err(
            ErrorCode::Protocol,
            format!("first line must be a hello command: {e}"),
        )
    })?;
    let ClientCommand::Hello {
        project: client_project,
        agent,
        version,
    } = cmd
    else {
        return Err(Reply::err(
            ErrorCode::Protocol,
            "first line must be a hello command",
        ));
    };
    if client_project != project {
        return Err(Reply::err(
            ErrorCode::InvalidProject,
            format!("project '{client_project}' does not match this broker"),
        ));
    }
    if version != PROTOCOL_VERSION {
        return Err(Reply::err(
            ErrorCode::Protocol,
            format!("unsupported protocol version {version}; server speaks {PROTOCOL_VERSION}"),
        ));
    }
    normalize_agent(&agent).map_err(|e| Reply::err(ErrorCode::InvalidName, e.to_string()))
}

async fn write_json<W, T>(writer: &mut W, value: &T, last_write: &mut Instant) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(value).context("encode line")?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .context("write line")?;
    writer.flush().await.context("flush line")?;
    *last_write = Instant::now();
    Ok(())
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
