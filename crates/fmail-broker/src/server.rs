//! Listener setup and accept loops.

use crate::connection;
use crate::hub::{self, HubCommand, HubSender};
use anyhow::{Context, Result};
use forge_mail_core::config::BrokerConfig;
use forge_mail_core::store::MailStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use tokio::net::UnixListener;

/// A running broker.
///
/// Dropping the handle does not stop the broker; cancel the token passed to
/// [`start`] for that. The handle removes the socket file on drop so a
/// stopped broker never leaves a stale discovery target behind.
#[derive(Debug)]
pub struct BrokerHandle {
    /// Unix socket path, when one was bound
    pub socket_path: Option<PathBuf>,
    /// Bound TCP address, when the TCP listener is enabled
    pub tcp_addr: Option<SocketAddr>,
    /// Broker session id for this run
    pub session: String,
    hub: HubSender,
    cancel: CancellationToken,
}

impl BrokerHandle {
    /// Session statistics straight from the hub.
    pub async fn status(&self) -> Result<serde_json::Value> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.hub
            .send(HubCommand::Status { reply: reply_tx })
            .await
            .context("hub gone")?;
        reply_rx.await.context("hub dropped status reply")
    }

    /// Stop the broker.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(path) = &self.socket_path
            && path.exists()
        {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("failed to remove socket file {}: {e}", path.display());
            } else {
                debug!("removed socket file {}", path.display());
            }
        }
    }
}

/// Start the broker for the project owned by `store`.
///
/// Binds `.fmail/forged.sock` (Unix platforms) and, when enabled in `cfg`,
/// a TCP loopback listener. A TCP port of 0 binds an ephemeral port, which
/// tests use to avoid clashing on the default.
pub async fn start(
    store: Arc<MailStore>,
    cfg: BrokerConfig,
    cancel: CancellationToken,
) -> Result<BrokerHandle> {
    let project_store = store.clone();
    let project = tokio::task::spawn_blocking(move || project_store.project_id())
        .await
        .context("project id task")?
        .context("read project id")?;

    let (hub_tx, session) = hub::spawn(store.clone(), cfg.clone(), project.clone(), cancel.clone())
        .await
        .context("start hub")?;

    // Unix socket listener.
    #[cfg(unix)]
    let socket_path = {
        let path = store.socket_path();
        if path.exists() {
            warn!("removing stale socket file {}", path.display());
            std::fs::remove_file(&path)
                .with_context(|| format!("remove stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("bind unix socket {}", path.display()))?;
        info!("listening on {}", path.display());
        spawn_accept_loop_unix(
            listener,
            hub_tx.clone(),
            project.clone(),
            session.clone(),
            cfg.clone(),
            cancel.clone(),
        );
        Some(path)
    };
    #[cfg(not(unix))]
    let socket_path: Option<PathBuf> = None;

    // Optional TCP loopback listener.
    let tcp_addr = if cfg.tcp {
        let bind = SocketAddr::from(([127, 0, 0, 1], cfg.tcp_port));
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind tcp {bind}"))?;
        let addr = listener.local_addr().context("tcp local addr")?;
        info!("listening on {addr}");
        spawn_accept_loop_tcp(
            listener,
            hub_tx.clone(),
            project.clone(),
            session.clone(),
            cfg.clone(),
            cancel.clone(),
        );
        Some(addr)
    } else {
        None
    };

    info!(project = %project, session = %session, "broker ready");
    Ok(BrokerHandle {
        socket_path,
        tcp_addr,
        session,
        hub: hub_tx,
        cancel,
    })
}

#[cfg(unix)]
fn spawn_accept_loop_unix(
    listener: UnixListener,
    hub: HubSender,
    project: String,
    session: String,
    cfg: BrokerConfig,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        spawn_connection(
                            stream,
                            "unix".to_string(),
                            &hub,
                            &project,
                            &session,
                            &cfg,
                            &cancel,
                        );
                    }
                    Err(e) => {
                        error!("unix accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!("unix accept loop stopped");
    });
}

fn spawn_accept_loop_tcp(
    listener: TcpListener,
    hub: HubSender,
    project: String,
    session: String,
    cfg: BrokerConfig,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        spawn_connection(
                            stream,
                            addr.to_string(),
                            &hub,
                            &project,
                            &session,
                            &cfg,
                            &cancel,
                        );
                    }
                    Err(e) => {
                        error!("tcp accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!("tcp accept loop stopped");
    });
}

fn spawn_connection<S>(
    stream: S,
    peer: String,
    hub: &HubSender,
    project: &str,
    session: &str,
    cfg: &BrokerConfig,
    cancel: &CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let hub = hub.clone();
    let project = project.to_string();
    let session = session.to_string();
    let cfg = cfg.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = connection::serve(stream, peer, hub, project, session, cfg, cancel).await {
            debug!("connection handler ended with error: {e:#}");
        }
    });
}
