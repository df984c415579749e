//! Hybrid provider: broker-preferred, file-backed.
//!
//! The file provider is the durable ground truth; the broker is the
//! preferred transport. Subscriptions run both streams through a bounded
//! id-dedupe window, so a broker outage drops nothing (the poller keeps
//! reading the disk) and a broker recovery duplicates nothing. Transport
//! transitions never appear as messages; they are observable through
//! [`HybridProvider::status`].

use crate::broker::{self, StreamEnd, pump_watch};
use crate::dedupe::RecentIds;
use crate::discovery::{self, BrokerEndpoint};
use crate::error::ProviderError;
use crate::file::FileProvider;
use crate::provider::Provider;
use crate::subscription::{self, Subscription};
use forge_mail_core::schema::WatchTarget;
use async_trait::async_trait;
use forge_mail_core::config::ProviderConfig;
use forge_mail_core::filter::MessageFilter;
use forge_mail_core::proto::KEEPALIVE_INTERVAL;
use forge_mail_core::schema::{DmConversation, Message, TopicInfo};
use forge_mail_core::store::{Draft, MailStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Cap for the broker reconnection backoff.
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Which transport is currently delivering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Push delivery through the broker
    Broker,
    /// Polling the file store directly
    File,
}

/// Snapshot answered by the status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridStatus {
    pub transport: Transport,
    /// The endpoint the broker transport uses (or last used)
    pub endpoint: Option<String>,
}

/// The default outward provider.
#[derive(Debug)]
pub struct HybridProvider {
    file: FileProvider,
    project: String,
    endpoint: Option<BrokerEndpoint>,
    health_tx: watch::Sender<Transport>,
    health_rx: watch::Receiver<Transport>,
}

impl HybridProvider {
    /// Build a hybrid provider, probing for a broker once up front.
    /// Standalone projects come up in `File` transport and subscriptions
    /// keep re-probing in the background.
    pub async fn connect(
        store: Arc<MailStore>,
        me: Option<String>,
    ) -> Result<Self, ProviderError> {
        Self::with_config(store, me, ProviderConfig::default()).await
    }

    pub async fn with_config(
        store: Arc<MailStore>,
        me: Option<String>,
        cfg: ProviderConfig,
    ) -> Result<Self, ProviderError> {
        let meta_store = store.clone();
        let project = tokio::task::spawn_blocking(move || meta_store.project_id())
            .await
            .map_err(|e| ProviderError::Task(e.to_string()))??;
        let endpoint = discovery::discover(&store).await;
        let initial = if endpoint.is_some() {
            Transport::Broker
        } else {
            Transport::File
        };
        info!(
            project = %project,
            endpoint = ?endpoint.as_ref().map(ToString::to_string),
            "hybrid provider ready"
        );
        let (health_tx, health_rx) = watch::channel(initial);
        Ok(Self {
            file: FileProvider::with_config(store, me, cfg),
            project,
            endpoint,
            health_tx,
            health_rx,
        })
    }

    /// The separate status query: current transport and broker endpoint.
    pub fn status(&self) -> HybridStatus {
        HybridStatus {
            transport: *self.health_rx.borrow(),
            endpoint: self.endpoint.as_ref().map(ToString::to_string),
        }
    }

    /// Watchable transport state for dashboards.
    pub fn health(&self) -> watch::Receiver<Transport> {
        self.health_rx.clone()
    }

    fn agent_name(&self) -> String {
        self.file
            .identity()
            .map_or_else(|| "anonymous".to_string(), str::to_string)
    }

    async fn current_endpoint(&self) -> Option<BrokerEndpoint> {
        match &self.endpoint {
            Some(e) => Some(e.clone()),
            None => discovery::discover(self.file.store()).await,
        }
    }
}

#[async_trait]
impl Provider for HybridProvider {
    /// Broker if reachable, file store otherwise. Validation failures
    /// surface either way; only reachability faults fall through.
    async fn send(&self, draft: &Draft) -> Result<Message, ProviderError> {
        if let Some(endpoint) = self.current_endpoint().await {
            match broker::send_via_broker(&endpoint, &self.project, &self.agent_name(), draft)
                .await
            {
                Ok(msg) => {
                    let _ = self.health_tx.send(Transport::Broker);
                    return Ok(msg);
                }
                Err(e) if e.is_recoverable() => {
                    debug!("broker send failed ({e}); falling back to file store");
                    let _ = self.health_tx.send(Transport::File);
                }
                Err(e) => return Err(e),
            }
        }
        self.file.send(draft).await
    }

    async fn messages(
        &self,
        target: &WatchTarget,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>, ProviderError> {
        self.file.messages(target, filter).await
    }

    async fn topics(&self) -> Result<Vec<TopicInfo>, ProviderError> {
        self.file.topics().await
    }

    async fn dms(&self) -> Result<Vec<DmConversation>, ProviderError> {
        self.file.dms().await
    }

    async fn subscribe(
        &self,
        target: WatchTarget,
        filter: MessageFilter,
    ) -> Result<Subscription, ProviderError> {
        filter.validate()?;
        let (sender, sub) = subscription::channel();

        // File stream: always on, the durable ground truth.
        let mut file_sub = self.file.subscribe(target.clone(), filter.clone()).await?;

        // Broker stream: feeds notices into the supervisor below.
        let (notice_tx, mut notice_rx) = mpsc::channel::<BrokerNotice>(64);
        let attach_cancel = CancellationToken::new();
        {
            let store = self.file.store().clone();
            let endpoint = self.endpoint.clone();
            let project = self.project.clone();
            let agent = self.agent_name();
            let target = target.clone();
            let filter = filter.clone();
            let cfg = self.file.config().clone();
            let cancel = attach_cancel.clone();
            tokio::spawn(async move {
                broker_attach_loop(
                    store, endpoint, project, agent, target, filter, cfg, notice_tx, cancel,
                )
                .await;
            });
        }

        let sender_task = sender.clone();
        let health_tx = self.health_tx.clone();
        let dedupe_capacity = self.file.config().dedupe_capacity;
        tokio::spawn(async move {
            let mut dedupe = RecentIds::new(dedupe_capacity);
            loop {
                tokio::select! {
                    _ = sender_task.token().cancelled() => break,
                    file_msg = file_sub.recv() => {
                        match file_msg {
                            Some(msg) => {
                                if dedupe.insert(&msg.id) && !sender_task.emit(msg).await {
                                    break;
                                }
                            }
                            None => {
                                // The ground truth died; surface its error and stop.
                                if let Some(e) = file_sub.take_error() {
                                    sender_task.fail(e).await;
                                }
                                break;
                            }
                        }
                    }
                    notice = notice_rx.recv() => {
                        match notice {
                            Some(BrokerNotice::Msg(msg)) => {
                                let _ = health_tx.send(Transport::Broker);
                                if dedupe.insert(&msg.id) && !sender_task.emit(msg).await {
                                    break;
                                }
                            }
                            Some(BrokerNotice::Up) => {
                                let _ = health_tx.send(Transport::Broker);
                            }
                            Some(BrokerNotice::Down) => {
                                let _ = health_tx.send(Transport::File);
                            }
                            Some(BrokerNotice::Fatal(e)) => {
                                let _ = health_tx.send(Transport::File);
                                sender_task.fail(e).await;
                                // File stream continues; fatal broker state
                                // only ends the push transport.
                            }
                            None => {
                                let _ = health_tx.send(Transport::File);
                            }
                        }
                    }
                }
            }
            attach_cancel.cancel();
        });

        Ok(sub)
    }
}

#[derive(Debug)]
enum BrokerNotice {
    Up,
    Msg(Message),
    Down,
    Fatal(ProviderError),
}

/// Keep a broker watch attached, with capped exponential reconnect backoff.
///
/// A healthy broker emits a keepalive every 15 s; a link quiet for two
/// reconnect intervals past that deadline counts as a silent stall and
/// demotes.
#[allow(clippy::too_many_arguments)]
async fn broker_attach_loop(
    store: Arc<MailStore>,
    static_endpoint: Option<BrokerEndpoint>,
    project: String,
    agent: String,
    target: WatchTarget,
    filter: MessageFilter,
    cfg: ProviderConfig,
    notices: mpsc::Sender<BrokerNotice>,
    cancel: CancellationToken,
) {
    let stall_timeout = KEEPALIVE_INTERVAL + 2 * cfg.reconnect_interval();
    let mut backoff = cfg.reconnect_interval();
    let mut last_seq: Option<u64> = None;
    let mut cursor: Option<String> = None;
    // The file stream already covers history; the broker stream only needs
    // to start from "now", so a fresh attach passes no since_seq.

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let endpoint = match &static_endpoint {
            Some(e) => Some(e.clone()),
            None => discovery::discover(&store).await,
        };

        if let Some(endpoint) = endpoint {
            let attached = async {
                let mut conn = broker::connect(&endpoint, &project, &agent).await?;
                let since_seq = last_seq.map(|s| s + 1);
                broker::open_watch(&mut conn, &target, &filter, since_seq).await?;
                Ok::<_, ProviderError>(conn)
            }
            .await;

            match attached {
                Ok(mut conn) => {
                    debug!(%endpoint, session = %conn.session, "hybrid attached to broker");
                    let _ = notices.send(BrokerNotice::Up).await;
                    backoff = cfg.reconnect_interval();

                    // Run the pump in its own task; its subscription channel
                    // feeds the supervisor through the notices channel.
                    let (pump_sender, mut pump_sub) = subscription::channel();
                    let pump_target = target.clone();
                    let pump_filter = filter.clone();
                    let (mut seq, mut cur) = (last_seq, cursor.clone());
                    let pump_task = tokio::spawn(async move {
                        let end = pump_watch(
                            &mut conn,
                            &pump_target,
                            &pump_filter,
                            stall_timeout,
                            &pump_sender,
                            &mut seq,
                            &mut cur,
                        )
                        .await;
                        (end, seq, cur)
                    });

                    let cancelled = loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break true,
                            msg = pump_sub.recv() => match msg {
                                Some(msg) => {
                                    if notices.send(BrokerNotice::Msg(msg)).await.is_err() {
                                        break true;
                                    }
                                }
                                None => break false, // pump finished
                            }
                        }
                    };
                    if cancelled {
                        pump_sub.cancel();
                    }
                    let end = match pump_task.await {
                        Ok((end, seq, cur)) => {
                            last_seq = seq;
                            cursor = cur;
                            end
                        }
                        Err(e) => StreamEnd::Lost(ProviderError::Task(e.to_string())),
                    };
                    match end {
                        StreamEnd::Cancelled => return,
                        StreamEnd::Lost(e) if cancelled => {
                            debug!("hybrid broker stream closed during shutdown: {e}");
                            return;
                        }
                        StreamEnd::Lost(e) => {
                            debug!("hybrid broker stream lost: {e}");
                            let _ = notices.send(BrokerNotice::Down).await;
                        }
                    }
                }
                Err(ProviderError::InvalidProject) => {
                    let _ = notices
                        .send(BrokerNotice::Fatal(ProviderError::InvalidProject))
                        .await;
                    return;
                }
                Err(e) if e.is_recoverable() => {
                    debug!("hybrid broker attach failed: {e}");
                    let _ = notices.send(BrokerNotice::Down).await;
                }
                Err(e) => {
                    let _ = notices.send(BrokerNotice::Fatal(e)).await;
                    return;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
    }
}
