//! `fmail-broker` binary: serve, status, gc.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use forge_mail_core::config::{self, BrokerConfig};
use forge_mail_core::store::{MailStore, StoreError};
use forge_mail_core::validate::ValidationError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "fmail-broker", version, about = "Push-delivery broker for forge-mail projects")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker for a project until interrupted.
    Serve {
        /// Project root (defaults to FMAIL_ROOT or an upward .fmail search)
        #[arg(long)]
        root: Option<PathBuf>,
        /// TCP loopback port (overrides config)
        #[arg(long)]
        tcp_port: Option<u16>,
        /// Serve the Unix socket only
        #[arg(long)]
        no_tcp: bool,
    },
    /// Query a running broker's session statistics.
    Status {
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Run a retention sweep over the project's message directories.
    Gc {
        #[arg(long)]
        root: Option<PathBuf>,
        /// Maximum message age, e.g. "7d" or "24h" (overrides config)
        #[arg(long)]
        max_age: Option<String>,
    },
}

fn main() {
    forge_mail_core::logging::init();
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

/// Exit codes: 1 runtime/IO, 2 validation, 3 broker protocol.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(store_err) = cause.downcast_ref::<StoreError>() {
            return match store_err {
                StoreError::Validation(_) | StoreError::Filter(_) => 2,
                _ => 1,
            };
        }
        if cause.downcast_ref::<ValidationError>().is_some() {
            return 2;
        }
        if cause.downcast_ref::<ProtocolFailure>().is_some() {
            return 3;
        }
    }
    1
}

/// Marker for broker-protocol failures so `status` can exit with code 3.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ProtocolFailure(String);

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve {
            root,
            tcp_port,
            no_tcp,
        } => serve(root, tcp_port, no_tcp).await,
        Command::Status { root } => status(root).await,
        Command::Gc { root, max_age } => gc(root, max_age).await,
    }
}

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(root) = root {
        return Ok(root);
    }
    forge_mail_core::root::resolve_root()
        .context("no project root: pass --root, set FMAIL_ROOT, or run inside a .fmail project")
}

async fn serve(root: Option<PathBuf>, tcp_port: Option<u16>, no_tcp: bool) -> Result<()> {
    let root = resolve_root(root)?;
    // The broker anchors the project: first run initializes `.fmail/`.
    let store = Arc::new(MailStore::init(&root).with_context(|| {
        format!("initialize project at {}", root.display())
    })?);

    let mut cfg: BrokerConfig = config::load(&root)
        .with_context(|| format!("load config for {}", root.display()))?
        .broker;
    if let Some(port) = tcp_port {
        cfg.tcp_port = port;
    }
    if no_tcp {
        cfg.tcp = false;
    }

    let cancel = CancellationToken::new();
    let handle = forge_mail_broker::start(store, cfg, cancel.clone())
        .await
        .context("start broker")?;
    info!(session = %handle.session, "serving; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    cancel.cancel();
    // Give connection tasks a beat to flush before the socket file goes.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    drop(handle);
    Ok(())
}

async fn status(root: Option<PathBuf>) -> Result<()> {
    let root = resolve_root(root)?;
    let store = Arc::new(MailStore::open(&root)?);
    let payload = query_status(&store)
        .await
        .map_err(ProtocolFailure)
        .context("query broker status")?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

/// Minimal one-shot protocol client for the `status` subcommand.
async fn query_status(store: &Arc<MailStore>) -> Result<serde_json::Value, String> {
    use forge_mail_core::proto::{ClientCommand, PROTOCOL_VERSION, Reply, ServerLine};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let project = store.project_id().map_err(|e| e.to_string())?;
    let agent = forge_mail_core::root::env_agent().unwrap_or_else(|| "operator".to_string());

    #[cfg(unix)]
    let stream = {
        let path = store.socket_path();
        tokio::net::UnixStream::connect(&path)
            .await
            .map_err(|e| format!("no broker at {}: {e}", path.display()))?
    };
    #[cfg(not(unix))]
    let stream = {
        let addr = std::net::SocketAddr::from((
            [127, 0, 0, 1],
            forge_mail_core::proto::DEFAULT_TCP_PORT,
        ));
        tokio::net::TcpStream::connect(addr)
            .await
            .map_err(|e| format!("no broker at {addr}: {e}"))?
    };

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    async fn roundtrip<R, W>(
        reader: &mut BufReader<R>,
        writer: &mut W,
        cmd: &ClientCommand,
    ) -> Result<Reply, String>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        let mut line = serde_json::to_string(cmd).map_err(|e| e.to_string())?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        let mut reply_line = String::new();
        loop {
            reply_line.clear();
            let n = reader
                .read_line(&mut reply_line)
                .await
                .map_err(|e| e.to_string())?;
            if n == 0 {
                return Err("broker closed the connection".to_string());
            }
            match serde_json::from_str::<ServerLine>(reply_line.trim()) {
                Ok(ServerLine::Reply(reply)) => return Ok(reply),
                Ok(_) => continue,
                Err(e) => return Err(format!("malformed reply: {e}")),
            }
        }
    }

    let hello = roundtrip(
        &mut reader,
        &mut write_half,
        &ClientCommand::Hello {
            project,
            agent,
            version: PROTOCOL_VERSION,
        },
    )
    .await?;
    if !hello.ok {
        return Err(reply_error(hello));
    }
    let reply = roundtrip(&mut reader, &mut write_half, &ClientCommand::Status).await?;
    if !reply.ok {
        return Err(reply_error(reply));
    }
    Ok(reply.payload.unwrap_or(serde_json::Value::Null))
}

fn reply_error(reply: forge_mail_core::proto::Reply) -> String {
    reply
        .error
        .map_or_else(|| "unknown broker error".to_string(), |e| format!("{}: {}", e.code, e.message))
}

async fn gc(root: Option<PathBuf>, max_age: Option<String>) -> Result<()> {
    let root = resolve_root(root)?;
    let store = MailStore::open(&root)?;

    let age = match max_age {
        Some(age) => config::parse_duration(&age).context("parse --max-age")?,
        None => {
            let retention = config::load(&root)?.retention;
            match retention.max_age_duration().context("parse retention.max_age")? {
                Some(age) => age,
                None => bail!("no retention age: pass --max-age or set retention.max_age"),
            }
        }
    };

    let stats = tokio::task::spawn_blocking(move || store.sweep(age))
        .await
        .context("sweep task")??;
    println!(
        "examined {} message(s), removed {}, reaped {} temp file(s)",
        stats.examined, stats.removed, stats.removed_tmp
    );
    Ok(())
}
