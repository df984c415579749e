//! Broker endpoint discovery and dialing.
//!
//! Resolution order: the `FMAIL_BROKER` environment variable (a socket path
//! or `host:port`), then the project's `.fmail/forged.sock`, then the TCP
//! loopback port. When every probe fails the caller runs standalone.

use crate::error::ProviderError;
use forge_mail_core::proto::DIAL_TIMEOUT;
use forge_mail_core::root::env_broker;
use forge_mail_core::store::MailStore;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

#[cfg(unix)]
use tokio::net::UnixStream;

/// A dialable broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    /// Unix domain socket path
    #[cfg(unix)]
    Unix(PathBuf),
    /// TCP loopback address
    Tcp(SocketAddr),
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            BrokerEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            BrokerEndpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Interpret the `FMAIL_BROKER` override: `host:port` if it parses as a
/// socket address, otherwise a Unix socket path.
pub fn endpoint_from_env() -> Option<BrokerEndpoint> {
    let raw = env_broker()?;
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(BrokerEndpoint::Tcp(addr));
    }
    #[cfg(unix)]
    {
        Some(BrokerEndpoint::Unix(PathBuf::from(raw)))
    }
    #[cfg(not(unix))]
    {
        tracing::warn!("FMAIL_BROKER='{raw}' is not host:port; ignored on this platform");
        None
    }
}

/// Probe for a reachable broker. `FMAIL_BROKER` is trusted without a dial
/// check; discovered endpoints must actually accept a connection.
pub async fn discover(store: &MailStore) -> Option<BrokerEndpoint> {
    if let Some(endpoint) = endpoint_from_env() {
        return Some(endpoint);
    }

    #[cfg(unix)]
    {
        let socket = store.socket_path();
        if socket.exists() {
            let endpoint = BrokerEndpoint::Unix(socket);
            if dial(&endpoint).await.is_ok() {
                debug!(%endpoint, "broker discovered");
                return Some(endpoint);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = store;

    let endpoint = BrokerEndpoint::Tcp(SocketAddr::from((
        [127, 0, 0, 1],
        forge_mail_core::proto::DEFAULT_TCP_PORT,
    )));
    if dial(&endpoint).await.is_ok() {
        debug!(%endpoint, "broker discovered");
        return Some(endpoint);
    }
    None
}

/// Connect with the dial timeout and hand back buffered line halves.
pub(crate) async fn dial(
    endpoint: &BrokerEndpoint,
) -> Result<(BufReader<BoxedRead>, BoxedWrite), ProviderError> {
    let unreachable = |e: std::io::Error| ProviderError::Unavailable(format!("{endpoint}: {e}"));
    let timed_out = || ProviderError::Unavailable(format!("{endpoint}: dial timed out"));

    match endpoint {
        #[cfg(unix)]
        BrokerEndpoint::Unix(path) => {
            let stream = tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(path))
                .await
                .map_err(|_| timed_out())?
                .map_err(unreachable)?;
            let (r, w) = stream.into_split();
            Ok((BufReader::new(Box::new(r) as BoxedRead), Box::new(w)))
        }
        BrokerEndpoint::Tcp(addr) => {
            let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| timed_out())?
                .map_err(unreachable)?;
            let (r, w) = stream.into_split();
            Ok((BufReader::new(Box::new(r) as BoxedRead), Box::new(w)))
        }
    }
}
