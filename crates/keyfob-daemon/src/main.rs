//! keyfobd — the keyfob continuous-authentication daemon.
//!
//! Owns the pool of authentication sessions for this host. Clients talk to
//! it over a Unix socket: `start_auth` opens a session and returns the
//! invitation to display, `complete_auth` waits for the phone-side
//! handshake to resolve. In continuous mode a session keeps
//! re-authenticating the phone, and locks the desktop when contact is
//! lost.
//!
//! Everything runs on a current-thread runtime with a local task set: the
//! registry, every session and every transport adapter share one thread
//! and need no locks.

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use keyfob_daemon::beacons::SocketBeaconTransport;
use keyfob_daemon::channel::DefaultChannelFactory;
use keyfob_daemon::lock::{CommandLocker, DEFAULT_LOCK_COMMAND};
use keyfob_daemon::{ipc, ServiceCommand, ServiceLoop};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// keyfob continuous-authentication daemon
#[derive(Parser, Debug)]
#[command(name = "keyfobd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the Unix socket clients connect to
    #[arg(long, default_value = "/run/keyfob/keyfobd.sock")]
    socket: PathBuf,

    /// Configuration directory (keys, users.txt, bluetooth.txt,
    /// config.txt); defaults to /etc/keyfob/
    #[arg(long)]
    config_dir: Option<String>,

    /// Command invoked as `<command> <username>` to lock a desktop session
    #[arg(long, default_value = DEFAULT_LOCK_COMMAND)]
    lock_command: PathBuf,

    /// Service display name embedded in invitations; defaults to the
    /// hostname
    #[arg(long)]
    service_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    // Single-threaded by design: all daemon state is owned by this one
    // thread and shared without synchronisation.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(run(args)))
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let host = hostname();
    let service_name = args.service_name.clone().unwrap_or_else(|| host.clone());

    let config_dir = args
        .config_dir
        .clone()
        .map(|dir| if dir.ends_with('/') { dir } else { format!("{dir}/") });

    let factory = DefaultChannelFactory::new(host);
    let locker = Rc::new(CommandLocker::new(&args.lock_command));
    let service = ServiceLoop::new(
        factory,
        SocketBeaconTransport,
        locker,
        config_dir,
        service_name,
    );

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    // IPC server: feeds client calls into the loop, reports owner loss.
    let ipc_commands = commands_tx.clone();
    let socket_path = args.socket.clone();
    let ipc_task = tokio::task::spawn_local(async move {
        if let Err(err) = ipc::run(&socket_path, ipc_commands).await {
            error!(%err, "IPC server failed");
        }
    });

    // Unix signals request a clean exit.
    let signal_commands = commands_tx.clone();
    tokio::task::spawn_local(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(%err, "failed to register SIGTERM");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(err) => {
                error!(%err, "failed to register SIGINT");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = signal_commands.send(ServiceCommand::Exit);
    });

    info!(
        pid = std::process::id(),
        socket = %args.socket.display(),
        "keyfobd started"
    );

    // The loop runs until Exit, then drains its sessions.
    service.run(commands_rx).await;

    ipc_task.abort();
    if args.socket.exists() {
        let _ = std::fs::remove_file(&args.socket);
    }
    info!("daemon shutdown complete");
    Ok(())
}

/// Best-effort host name, for the service display name and the stream
/// channel's address string.
fn hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_owned();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned())
}
