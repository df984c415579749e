//! The broker hub: sequencing, persistence, ring buffer, and fan-out.
//!
//! One hub task owns all mutable broker state. Persistence is serialized
//! through it (single-writer discipline); fan-out goes through bounded
//! per-subscriber channels and never blocks the hub. A subscriber whose
//! channel stays full past the slow-client timeout is dropped with
//! `slow_consumer` and is expected to reconnect and replay.

use chrono::{SecondsFormat, Utc};
use forge_mail_core::config::BrokerConfig;
use forge_mail_core::filter::MessageFilter;
use forge_mail_core::proto::ErrorCode;
use forge_mail_core::schema::{Message, WatchTarget};
use forge_mail_core::store::{Draft, MailStore, StoreError};
use forge_mail_core::validate::ValidationError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One fan-out item: broker sequence number plus the shared message.
pub(crate) type EnvelopeItem = (u64, Arc<Message>);

/// Handle for submitting commands to the hub task.
pub(crate) type HubSender = mpsc::Sender<HubCommand>;

/// Ack for an accepted send.
#[derive(Debug, Clone)]
pub(crate) struct SendAck {
    pub id: String,
    pub seq: u64,
}

/// Rejection carrying a wire error code.
#[derive(Debug, Clone)]
pub(crate) struct HubReject {
    pub code: ErrorCode,
    pub message: String,
}

/// A watch registration from a connection.
pub(crate) struct WatchSpec {
    pub selector: WatchTarget,
    pub filter: MessageFilter,
    pub since_seq: Option<u64>,
    /// Connection-owned channel the hub fans out into.
    pub tx: mpsc::Sender<EnvelopeItem>,
    /// Reason recorded before `kicked` fires, so the connection can tell a
    /// slow-consumer drop from an ordinary close.
    pub kick: Arc<OnceLock<ErrorCode>>,
    /// Cancelled by the hub when it abandons this subscription.
    pub kicked: CancellationToken,
}

/// Grant returned for a watch: identity, replay batch, retention horizon.
pub(crate) struct WatchGrant {
    pub sub_id: u64,
    pub label: String,
    pub oldest_retained_seq: u64,
    /// Retained messages with `seq >= since_seq`, in sequence order. The
    /// connection writes these before draining its live channel.
    pub replay: Vec<EnvelopeItem>,
}

/// Commands accepted by the hub task.
pub(crate) enum HubCommand {
    Publish {
        draft: Draft,
        reply: oneshot::Sender<Result<SendAck, HubReject>>,
    },
    Watch {
        spec: WatchSpec,
        reply: oneshot::Sender<WatchGrant>,
    },
    Unwatch {
        sub_id: u64,
    },
    Register {
        agent: String,
        status: Option<String>,
        reply: oneshot::Sender<Result<(), HubReject>>,
    },
    Unregister {
        agent: String,
        reply: oneshot::Sender<Result<(), HubReject>>,
    },
    Touch {
        agent: String,
    },
    Status {
        reply: oneshot::Sender<serde_json::Value>,
    },
}

struct SubEntry {
    spec: WatchSpec,
    blocked_since: Option<Instant>,
}

struct Hub {
    store: Arc<MailStore>,
    cfg: BrokerConfig,
    session: String,
    project: String,
    started: Instant,
    next_seq: u64,
    ring: VecDeque<EnvelopeItem>,
    subs: HashMap<u64, SubEntry>,
    next_sub_id: u64,
    publish_failures: u64,
}

/// Spawn the hub task. The ring buffer is rebuilt from the tail of the file
/// store so reconnecting clients can replay recent history even across a
/// broker restart; sequence numbers restart from 0 under a fresh session
/// id.
pub(crate) async fn spawn(
    store: Arc<MailStore>,
    cfg: BrokerConfig,
    project: String,
    cancel: CancellationToken,
) -> Result<(HubSender, String), StoreError> {
    let session = format!("s-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

    let rebuild_store = store.clone();
    let capacity = cfg.ring_capacity;
    let tail = tokio::task::spawn_blocking(move || read_store_tail(&rebuild_store, capacity))
        .await
        .map_err(|e| StoreError::Io {
            path: std::path::PathBuf::from("."),
            source: std::io::Error::other(e.to_string()),
        })??;

    let mut ring = VecDeque::with_capacity(capacity);
    for (seq, msg) in tail.into_iter().enumerate() {
        ring.push_back((seq as u64, Arc::new(msg)));
    }
    let next_seq = ring.back().map_or(0, |(seq, _)| seq + 1);
    info!(
        session = %session,
        rebuilt = ring.len(),
        next_seq,
        "hub started"
    );

    let (tx, rx) = mpsc::channel(256);
    let hub = Hub {
        store,
        cfg,
        session: session.clone(),
        project,
        started: Instant::now(),
        next_seq,
        ring,
        subs: HashMap::new(),
        next_sub_id: 1,
        publish_failures: 0,
    };
    tokio::spawn(hub.run(rx, cancel));
    Ok((tx, session))
}

/// Newest `capacity` messages across every target, in id order.
fn read_store_tail(store: &MailStore, capacity: usize) -> Result<Vec<Message>, StoreError> {
    let unbounded = MessageFilter::default();
    let mut all = Vec::new();
    for topic in store.topic_names()? {
        all.extend(store.list_topic(&topic, &unbounded)?);
    }
    for (lo, hi) in store.dm_pairs()? {
        all.extend(store.list_dm(&lo, &hi, &unbounded)?);
    }
    all.sort_by(|a, b| a.id.cmp(&b.id));
    if all.len() > capacity {
        all.drain(..all.len() - capacity);
    }
    Ok(all)
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>, cancel: CancellationToken) {
        loop {
            let cmd = tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            match cmd {
                HubCommand::Publish { draft, reply } => {
                    let result = self.publish(draft).await;
                    let _ = reply.send(result);
                }
                HubCommand::Watch { spec, reply } => {
                    let grant = self.watch(spec);
                    let _ = reply.send(grant);
                }
                HubCommand::Unwatch { sub_id } => {
                    if self.subs.remove(&sub_id).is_some() {
                        debug!(sub_id, "subscription closed");
                    }
                }
                HubCommand::Register {
                    agent,
                    status,
                    reply,
                } => {
                    let result = self.run_store(move |store| {
                        store.register(&agent, status.as_deref()).map(|_| ())
                    });
                    let _ = reply.send(result.await);
                }
                HubCommand::Unregister { agent, reply } => {
                    let result = self.run_store(move |store| store.unregister(&agent));
                    let _ = reply.send(result.await);
                }
                HubCommand::Touch { agent } => {
                    let store = self.store.clone();
                    // Presence is best-effort; a failed touch never blocks
                    // the handshake.
                    match tokio::task::spawn_blocking(move || store.touch(&agent)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("presence touch failed: {e}"),
                        Err(e) => warn!("presence touch task failed: {e}"),
                    }
                }
                HubCommand::Status { reply } => {
                    let _ = reply.send(self.status());
                }
            }
        }
        info!(session = %self.session, "hub stopped");
    }

    /// Persist then fan out. Awaiting the blocking store call inline is
    /// what serializes all persistence through this single task.
    async fn publish(&mut self, draft: Draft) -> Result<SendAck, HubReject> {
        let store = self.store.clone();
        let persisted = tokio::task::spawn_blocking(move || store.send(&draft))
            .await
            .map_err(|e| HubReject {
                code: ErrorCode::Internal,
                message: format!("persistence task failed: {e}"),
            })?;

        let message = match persisted {
            Ok(message) => message,
            Err(e) => {
                let reject = reject_from_store(e);
                if reject.code == ErrorCode::Internal {
                    self.publish_failures += 1;
                }
                return Err(reject);
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let shared = Arc::new(message);
        self.ring.push_back((seq, shared.clone()));
        while self.ring.len() > self.cfg.ring_capacity {
            self.ring.pop_front();
        }
        self.fan_out(seq, &shared);
        Ok(SendAck {
            id: shared.id.clone(),
            seq,
        })
    }

    fn fan_out(&mut self, seq: u64, msg: &Arc<Message>) {
        let now = Instant::now();
        let slow_after = self.cfg.slow_client_timeout();
        let mut dropped: Vec<(u64, bool)> = Vec::new();

        for (&sub_id, entry) in &mut self.subs {
            if !entry.spec.selector.matches(msg) || !entry.spec.filter.matches(msg) {
                continue;
            }
            match entry.spec.tx.try_send((seq, msg.clone())) {
                Ok(()) => entry.blocked_since = None,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let since = *entry.blocked_since.get_or_insert(now);
                    if now.duration_since(since) > slow_after {
                        dropped.push((sub_id, true));
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push((sub_id, false)),
            }
        }

        for (sub_id, slow) in dropped {
            if let Some(entry) = self.subs.remove(&sub_id) {
                if slow {
                    warn!(sub_id, "dropping slow consumer");
                    let _ = entry.spec.kick.set(ErrorCode::SlowConsumer);
                }
                entry.spec.kicked.cancel();
            }
        }
    }

    fn watch(&mut self, spec: WatchSpec) -> WatchGrant {
        let sub_id = self.next_sub_id;
        self.next_sub_id += 1;
        let label = format!("w-{sub_id:03}");

        let oldest_retained_seq = self.ring.front().map_or(self.next_seq, |(seq, _)| *seq);
        let replay = match spec.since_seq {
            Some(since) => self
                .ring
                .iter()
                .filter(|(seq, _)| *seq >= since)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        debug!(
            sub_id,
            selector = %spec.selector,
            replay = replay.len(),
            "watch registered"
        );
        self.subs.insert(
            sub_id,
            SubEntry {
                spec,
                blocked_since: None,
            },
        );
        WatchGrant {
            sub_id,
            label,
            oldest_retained_seq,
            replay,
        }
    }

    async fn run_store<F>(&self, op: F) -> Result<(), HubReject>
    where
        F: FnOnce(&MailStore) -> Result<(), StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| HubReject {
                code: ErrorCode::Internal,
                message: format!("store task failed: {e}"),
            })?
            .map_err(reject_from_store)
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "session": self.session,
            "project": self.project,
            "uptime_secs": self.started.elapsed().as_secs(),
            "next_seq": self.next_seq,
            "ring": self.ring.len(),
            "subscribers": self.subs.len(),
            "publish_failures": self.publish_failures,
            "now": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }
}

fn reject_from_store(err: StoreError) -> HubReject {
    let code = match &err {
        StoreError::Validation(ValidationError::EmptyBody) => ErrorCode::BodyEmpty,
        StoreError::Validation(ValidationError::BodyTooLarge { .. }) => ErrorCode::BodyTooLarge,
        StoreError::Validation(_) => ErrorCode::InvalidName,
        StoreError::Filter(_) => ErrorCode::Protocol,
        _ => {
            error!("persistence failure: {err}");
            ErrorCode::Internal
        }
    };
    HubReject {
        code,
        message: err.to_string(),
    }
}
