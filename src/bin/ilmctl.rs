//! `ilmctl`: a thin debug/test client for `ilmd`. Opens one connection,
//! frames a single request, prints the reply. The raw `UnixStream`
//! send/recv style follows the daemon's own client-handling code; the
//! request shapes follow `lib_client.c` (this binary is a CLI skin over
//! what that library exposes as function calls).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use ilm::config::DaemonConfig;
use ilm::dispatch::{CmdOpcode, LockPayload, MsgHeader, PATH_MAX};
use ilm::wire::{HOST_ID_LEN, LOCK_ID_LEN, VALUE_LEN};

#[derive(Parser)]
#[command(name = "ilmctl", version, about = "In-Drive Mutex lock manager debug client")]
struct Cli {
    /// Control socket path; defaults to the daemon's configured socket.
    #[arg(long)]
    socket: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the protocol version the daemon speaks.
    Version,
    /// Acquire a lock across a drive set, hold it until stdin closes, release.
    Acquire {
        lock_id: String,
        /// "excl" or "share".
        #[arg(long, default_value = "excl")]
        mode: String,
        #[arg(long, default_value_t = 3000)]
        timeout_ms: i32,
        #[arg(long)]
        host_id: Option<String>,
        #[arg(required = true)]
        drives: Vec<String>,
    },
    /// Report the current mode of a lock on an already-added lockspace.
    Mode { lock_id: String },
    /// Write an 8-byte value block to a lock.
    WriteLvb { lock_id: String, value: String },
    /// Read a lock's value block.
    ReadLvb { lock_id: String },
    /// Set the percentage of daemon calls that should pseudo-randomly fail.
    InjectFault { percentage: i32 },
}

fn pad_bytes<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = s.as_bytes();
    let n = bytes.len().min(N);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// A lock id is two 16-byte UUIDs concatenated as 32-char hex strings
/// (spec section 6: "2 x 16-byte UUID concatenated" into a 64-byte
/// field). `global:local` on the CLI addresses both halves; a bare UUID
/// fills both.
fn parse_lock_id(s: &str) -> anyhow::Result<[u8; LOCK_ID_LEN]> {
    let (global, local) = s.split_once(':').unwrap_or((s, s));
    let global = Uuid::parse_str(global).context("invalid lock id (expected a UUID)")?;
    let local = Uuid::parse_str(local).context("invalid lock id (expected a UUID)")?;
    let mut buf = [0u8; LOCK_ID_LEN];
    buf[..32].copy_from_slice(global.simple().to_string().as_bytes());
    buf[32..].copy_from_slice(local.simple().to_string().as_bytes());
    Ok(buf)
}

/// A host id is a single UUID's 32-char hex form, which fills
/// `HOST_ID_LEN` exactly. Generates a fresh one when the caller doesn't
/// pin a specific host id.
fn parse_or_generate_host_id(s: Option<&str>) -> anyhow::Result<[u8; HOST_ID_LEN]> {
    let uuid = match s {
        Some(s) => Uuid::parse_str(s).context("invalid host id (expected a UUID)")?,
        None => {
            let uuid = Uuid::new_v4();
            println!("generated host id {uuid}");
            uuid
        }
    };
    let mut buf = [0u8; HOST_ID_LEN];
    buf.copy_from_slice(uuid.simple().to_string().as_bytes());
    Ok(buf)
}

fn mode_to_wire(mode: &str) -> anyhow::Result<u32> {
    match mode {
        "excl" | "exclusive" => Ok(1),
        "share" | "shareable" => Ok(2),
        other => bail!("unknown lock mode '{other}', expected excl or share"),
    }
}

/// One request/reply round trip over an already-connected socket.
fn call(stream: &mut UnixStream, cmd: CmdOpcode, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let header = MsgHeader::request(cmd as u32, payload.len() as u32);
    stream.write_all(&header.pack())?;
    stream.write_all(payload)?;

    let mut reply_header = [0u8; MsgHeader::SIZE];
    stream.read_exact(&mut reply_header)?;
    let reply_header = MsgHeader::parse(&reply_header).map_err(|e| anyhow!("{e}"))?;

    let mut reply_payload = vec![0u8; reply_header.length as usize];
    stream.read_exact(&mut reply_payload)?;

    if reply_header.result != 0 {
        bail!("{} failed: {}", cmd.name(), std::io::Error::from_raw_os_error(-reply_header.result));
    }
    Ok(reply_payload)
}

fn connect(socket: &std::path::Path) -> anyhow::Result<UnixStream> {
    UnixStream::connect(socket).with_context(|| format!("connecting to {}", socket.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let socket_path = cli
        .socket
        .unwrap_or_else(|| DaemonConfig::from_env().socket_path());

    match cli.command {
        Commands::Version => {
            let mut stream = connect(&socket_path)?;
            let reply = call(&mut stream, CmdOpcode::Version, &[])?;
            let version = u32::from_le_bytes(reply.try_into().map_err(|_| anyhow!("short version reply"))?);
            println!("protocol version {version}");
        }

        Commands::Acquire {
            lock_id,
            mode,
            timeout_ms,
            host_id,
            drives,
        } => {
            if drives.iter().any(|d| d.len() >= PATH_MAX) {
                bail!("drive path exceeds PATH_MAX ({PATH_MAX} bytes)");
            }
            let mut stream = connect(&socket_path)?;
            call(&mut stream, CmdOpcode::AddLockspace, &[])?;
            let host_id = parse_or_generate_host_id(host_id.as_deref())?;
            call(&mut stream, CmdOpcode::SetHostId, &host_id)?;

            let lock_id = parse_lock_id(&lock_id)?;
            let mut payload = LockPayload {
                mode: mode_to_wire(&mode)?,
                drive_num: drives.len() as u32,
                lock_id,
                timeout_ms,
                quiescent: 0,
            }
            .pack();
            payload.extend_from_slice(&ilm::dispatch::frame::pack_drive_paths(&drives).map_err(|e| anyhow!("{e}"))?);
            call(&mut stream, CmdOpcode::Acquire, &payload)?;
            println!("acquired, holding until stdin closes (ctrl-d)");

            let mut discard = String::new();
            let _ = std::io::stdin().read_to_string(&mut discard);

            let release_payload = LockPayload { mode: 0, drive_num: 0, lock_id, timeout_ms: 0, quiescent: 0 }.pack();
            call(&mut stream, CmdOpcode::Release, &release_payload)?;
            call(&mut stream, CmdOpcode::DelLockspace, &[])?;
            println!("released");
        }

        Commands::Mode { lock_id } => {
            let mut stream = connect(&socket_path)?;
            call(&mut stream, CmdOpcode::AddLockspace, &[])?;
            let lock_id = parse_lock_id(&lock_id)?;
            let payload = LockPayload { mode: 0, drive_num: 0, lock_id, timeout_ms: 0, quiescent: 0 }.pack();
            let reply = call(&mut stream, CmdOpcode::LockMode, &payload)?;
            let mode = u32::from_le_bytes(reply.try_into().map_err(|_| anyhow!("short mode reply"))?);
            println!("mode = {}", match mode { 0 => "unlocked", 1 => "exclusive", 2 => "shareable", other => return Err(anyhow!("unknown mode {other}")) });
        }

        Commands::WriteLvb { lock_id, value } => {
            let mut stream = connect(&socket_path)?;
            call(&mut stream, CmdOpcode::AddLockspace, &[])?;
            let lock_id = parse_lock_id(&lock_id)?;
            let mut payload = LockPayload { mode: 0, drive_num: 0, lock_id, timeout_ms: 0, quiescent: 0 }.pack();
            payload.extend_from_slice(&pad_bytes::<VALUE_LEN>(&value));
            call(&mut stream, CmdOpcode::WriteLvb, &payload)?;
            println!("wrote value block");
        }

        Commands::ReadLvb { lock_id } => {
            let mut stream = connect(&socket_path)?;
            call(&mut stream, CmdOpcode::AddLockspace, &[])?;
            let lock_id = parse_lock_id(&lock_id)?;
            let payload = LockPayload { mode: 0, drive_num: 0, lock_id, timeout_ms: 0, quiescent: 0 }.pack();
            let reply = call(&mut stream, CmdOpcode::ReadLvb, &payload)?;
            println!("value = {}", reply.iter().map(|b| format!("{b:02x}")).collect::<String>());
        }

        Commands::InjectFault { percentage } => {
            let mut stream = connect(&socket_path)?;
            call(&mut stream, CmdOpcode::InjectFault, &percentage.to_le_bytes())?;
            println!("fault percentage set to {percentage}");
        }
    }

    Ok(())
}
