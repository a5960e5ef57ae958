//! `ilmd`: the IDM lock manager daemon. Binds the control socket, takes
//! the pid-lock, and dispatches framed requests from connected clients
//! into the library's [`ilm::dispatch::ClientSession`]. CLI flags and
//! the pid-lock-then-listen startup sequencing follow `main.c`; the
//! accept loop is a plain `std::thread` pool rather than an async
//! runtime, since this daemon has no async I/O of its own.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use ilm::config::DaemonConfig;
use ilm::dispatch::{ClientSession, MsgHeader};
use ilm::drive::{DriveTransport, MemDrive};
#[cfg(target_os = "linux")]
use ilm::drive::LinuxPassthroughDrive;
use ilm::fault::FaultInjector;
use ilm::flock::Flock;
use ilm::raid::RaidEngine;

/// Client-request worker pool bounds (spec supplement, `cmd.c`'s
/// `ILM_MIN_WORKER_THREADS` / `ILM_MAX_WORKER_THREADS`). Distinct from
/// the per-drive async pool in `drive::async_pool`, which is sized per
/// drive rather than per daemon.
const MIN_WORKER_THREADS: usize = 2;
const MAX_WORKER_THREADS: usize = 8;
const DEFAULT_WORKER_THREADS: usize = 4;

/// CLI surface from spec section 6 "EXTERNAL INTERFACES".
#[derive(Parser)]
#[command(name = "ilmd", version, about = "In-Drive Mutex lock manager daemon")]
struct Cli {
    /// Enable debug-level logging regardless of -S/-E/-L.
    #[arg(short = 'D', long)]
    debug: bool,
    /// File log priority, syslog scale 0 (emerg) - 7 (debug).
    #[arg(short = 'L', long = "log-priority", default_value_t = 5)]
    file_log_priority: u8,
    /// Timestamp file log lines in UTC rather than local time.
    #[arg(short = 'U', long = "utc")]
    utc_logs: bool,
    /// Syslog priority, syslog scale 0-7 (no real syslog transport; see
    /// SPEC_FULL.md "Logging").
    #[arg(short = 'S', long = "syslog-priority", default_value_t = 5)]
    syslog_priority: u8,
    /// stderr log priority, syslog scale 0-7.
    #[arg(short = 'E', long = "stderr-priority", default_value_t = 4)]
    stderr_priority: u8,
    /// mlock the daemon's address space so lock-management code never pages out.
    #[arg(short = 'l', long)]
    mlock: bool,
}

/// Maps a syslog-scale priority (0 = emerg .. 7 = debug) to a `tracing` level.
fn priority_to_level(p: u8) -> Level {
    match p {
        0..=3 => Level::ERROR,
        4 => Level::WARN,
        5 => Level::INFO,
        6 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn init_logging(cli: &Cli, config: &DaemonConfig) -> anyhow::Result<()> {
    let level = if cli.debug {
        Level::TRACE
    } else {
        priority_to_level(cli.stderr_priority.max(cli.file_log_priority))
    };
    let filter = EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::from_level(level).into())
        .from_env_lossy();

    std::fs::create_dir_all(&config.log_dir).context("creating log directory")?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_file_path())
        .context("opening daemon log file")?;

    // stderr gets the interactive stream, the log file gets the durable copy.
    let writer = std::io::stderr.and(std::sync::Mutex::new(log_file));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).init();

    // `-U`/`-S` are accepted for CLI compatibility with the original
    // daemon's flag surface; this daemon has no syslog transport (out of
    // scope per spec section 1's "logging infrastructure" exclusion) and
    // `tracing_subscriber`'s formatter already timestamps in UTC.
    let _ = (cli.utc_logs, cli.syslog_priority);
    Ok(())
}

/// Picks the per-drive transport backend. Real device nodes are not
/// opened by default (spec section 5 non-goals): the in-memory emulation
/// backs the daemon unless `ILM_USE_REAL_DRIVES` explicitly opts into
/// the Linux SG_IO/NVMe pass-through backend.
fn build_transport() -> Arc<dyn DriveTransport> {
    #[cfg(target_os = "linux")]
    {
        if std::env::var_os("ILM_USE_REAL_DRIVES").is_some() {
            return Arc::new(LinuxPassthroughDrive::new());
        }
    }
    Arc::new(MemDrive::new())
}

fn worker_pool_size() -> usize {
    DEFAULT_WORKER_THREADS.clamp(MIN_WORKER_THREADS, MAX_WORKER_THREADS)
}

#[cfg(target_os = "linux")]
fn peer_pid(stream: &UnixStream) -> i32 {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    getsockopt(stream, PeerCredentials)
        .map(|cred| cred.pid())
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn peer_pid(_stream: &UnixStream) -> i32 {
    0
}

/// Services one client connection until it disconnects: reads a framed
/// request, dispatches it through a fresh [`ClientSession`], writes the
/// framed reply, repeat. Grounded in `client.c`'s per-connection
/// `ilm_client_recv`/`ilm_client_send` loop.
fn handle_connection(mut stream: UnixStream, engine: Arc<RaidEngine>, fault: Arc<FaultInjector>) -> anyhow::Result<()> {
    let pid = peer_pid(&stream);
    debug!(pid, "client connected");
    let session = ClientSession::new(engine, fault, pid);

    loop {
        let mut header_buf = [0u8; MsgHeader::SIZE];
        match stream.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let header = MsgHeader::parse(&header_buf).map_err(|e| anyhow!("{e}"))?;

        let mut payload = vec![0u8; header.length as usize];
        stream.read_exact(&mut payload)?;

        let (result, reply_payload) = session.dispatch(header.cmd, &payload);
        let reply = MsgHeader::reply(header.cmd, reply_payload.len() as u32, result);
        stream.write_all(&reply.pack())?;
        stream.write_all(&reply_payload)?;
    }

    // Client disconnects release every lock the session still holds
    // (spec section 5).
    session.disconnect();
    debug!(pid, "client disconnected");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::from_env();
    std::fs::create_dir_all(&config.run_dir).context("creating run directory")?;
    init_logging(&cli, &config)?;

    if cli.mlock {
        // SAFETY: mlockall has no preconditions beyond a valid process;
        // a failure is logged and non-fatal, treated as best-effort OS
        // hardening rather than a startup requirement.
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc != 0 {
            warn!(error = %std::io::Error::last_os_error(), "mlockall failed, continuing without it");
        }
    }

    let pid_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(config.pid_lock_path())
        .context("opening pid-lock file")?;
    let _pid_lock = Flock::new_nonblock_legacy_excl(pid_file)?;

    let socket_path = config.socket_path();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).context("binding control socket")?;
    info!(path = %socket_path.display(), "ilmd listening");

    let transport = build_transport();
    let fault = Arc::new(FaultInjector::new());
    let engine = Arc::new(RaidEngine::new(transport, Arc::clone(&fault)));

    let (conn_tx, conn_rx) = mpsc::channel::<UnixStream>();
    let conn_rx = Arc::new(std::sync::Mutex::new(conn_rx));
    let mut workers = Vec::with_capacity(worker_pool_size());
    for _ in 0..worker_pool_size() {
        let conn_rx = Arc::clone(&conn_rx);
        let engine = Arc::clone(&engine);
        let fault = Arc::clone(&fault);
        workers.push(thread::spawn(move || loop {
            let stream = {
                let rx = conn_rx.lock().unwrap();
                rx.recv()
            };
            match stream {
                Ok(stream) => {
                    if let Err(e) = handle_connection(stream, Arc::clone(&engine), Arc::clone(&fault)) {
                        debug!(error = %e, "connection ended with an error");
                    }
                }
                Err(_) => break, // sender dropped: daemon shutting down
            }
        }));
    }

    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                if conn_tx.send(stream).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    drop(conn_tx);
    for w in workers {
        let _ = w.join();
    }
    Ok(())
}
