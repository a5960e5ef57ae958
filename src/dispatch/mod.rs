//! Component H: the client command dispatcher. Parses framed requests,
//! dispatches to E/G, and packs framed replies. Grounded in `cmd.c`'s
//! `ilm_cmd_dispatch` switch and `client.h`'s per-connection state.

pub mod frame;
pub mod opcode;

pub use frame::{LockPayload, MsgHeader, PATH_MAX};
pub use opcode::CmdOpcode;

use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorKind, Result};
use crate::fault::FaultInjector;
use crate::lock::LockMode;
use crate::lockspace::{FencingConfig, Lockspace};
use crate::raid::{DriveSlot, RaidEngine};
use crate::wire::{HOST_ID_LEN, VALUE_LEN};

/// Protocol ABI version returned by `ILM_CMD_VERSION`. Bump on any
/// incompatible frame/opcode change.
pub const PROTOCOL_VERSION: u32 = 1;

fn mode_from_wire(mode: u32) -> Result<LockMode> {
    match mode {
        0 => Ok(LockMode::Unlocked),
        1 => Ok(LockMode::Exclusive),
        2 => Ok(LockMode::Shareable),
        other => Err(Error::new(ErrorKind::Invalid, format!("unknown lock mode {other}"))),
    }
}

fn mode_to_wire(mode: LockMode) -> u32 {
    match mode {
        LockMode::Unlocked => 0,
        LockMode::Exclusive => 1,
        LockMode::Shareable => 2,
    }
}

/// Per-connection dispatch state: one lockspace, lazily created by
/// `ILM_CMD_ADD_LOCKSPACE` and torn down by `ILM_CMD_DEL_LOCKSPACE`, plus
/// the fencing pieces that `SET_SIGNAL`/`SET_KILLPATH` build up
/// incrementally before they're pushed into the lockspace as one unit.
///
/// `engine` and `fault` are daemon-wide and shared across every
/// connection's session: the drive set and the fault-injection
/// percentage are process properties (spec section 4.I: "a process-wide
/// percentage"), not per-connection ones.
pub struct ClientSession {
    engine: Arc<RaidEngine>,
    fault: Arc<FaultInjector>,
    peer_pid: i32,
    lockspace: Mutex<Option<Arc<Lockspace>>>,
    fencing: Mutex<FencingConfig>,
}

impl ClientSession {
    pub fn new(engine: Arc<RaidEngine>, fault: Arc<FaultInjector>, peer_pid: i32) -> Self {
        ClientSession {
            engine,
            fault,
            peer_pid,
            lockspace: Mutex::new(None),
            fencing: Mutex::new(FencingConfig::default()),
        }
    }

    fn lockspace(&self) -> Result<Arc<Lockspace>> {
        self.lockspace
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::Invalid, "no lockspace added on this connection"))
    }

    /// Dispatches one raw `(cmd, payload)` request, returning
    /// `(result, reply_payload)` ready to frame into `MsgHeader::reply`.
    pub fn dispatch(&self, cmd: u32, payload: &[u8]) -> (i32, Vec<u8>) {
        let op = match CmdOpcode::from_u32(cmd) {
            Some(op) => op,
            None => return (ErrorKind::Invalid.to_errno(), Vec::new()),
        };
        match self.handle(op, payload) {
            Ok(reply) => (0, reply),
            Err(e) => (e.kind.to_errno(), Vec::new()),
        }
    }

    fn handle(&self, op: CmdOpcode, payload: &[u8]) -> Result<Vec<u8>> {
        match op {
            CmdOpcode::Version => Ok(PROTOCOL_VERSION.to_le_bytes().to_vec()),
            CmdOpcode::AddLockspace => self.add_lockspace(),
            CmdOpcode::DelLockspace => self.del_lockspace(),
            CmdOpcode::Acquire => self.acquire(payload),
            CmdOpcode::Release => self.release(payload),
            CmdOpcode::Convert => self.convert(payload),
            CmdOpcode::WriteLvb => self.write_lvb(payload),
            CmdOpcode::ReadLvb => self.read_lvb(payload),
            CmdOpcode::LockHostCount => self.lock_host_count(payload),
            CmdOpcode::LockMode => self.lock_mode(payload),
            CmdOpcode::SetSignal => self.set_signal(payload),
            CmdOpcode::SetKillpath => self.set_killpath(payload),
            CmdOpcode::SetHostId => self.set_host_id(payload),
            CmdOpcode::StopRenew => self.set_renew_enabled(false),
            CmdOpcode::StartRenew => self.set_renew_enabled(true),
            CmdOpcode::InjectFault => self.inject_fault(payload),
        }
    }

    fn add_lockspace(&self) -> Result<Vec<u8>> {
        let mut slot = self.lockspace.lock().unwrap();
        if slot.is_some() {
            return Err(Error::new(ErrorKind::Invalid, "lockspace already added on this connection"));
        }
        *slot = Some(Lockspace::new(Arc::clone(&self.engine), Arc::clone(&self.fault)));
        Ok(Vec::new())
    }

    fn del_lockspace(&self) -> Result<Vec<u8>> {
        let ls = self
            .lockspace
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Invalid, "no lockspace added on this connection"))?;
        ls.shutdown();
        Ok(Vec::new())
    }

    /// Parses a `LockPayload` followed by `drive_num` drive path strings.
    fn parse_acquire_payload(payload: &[u8]) -> Result<(LockPayload, Vec<DriveSlot>)> {
        let lp = LockPayload::parse(payload)?;
        let paths = frame::parse_drive_paths(&payload[LockPayload::SIZE..], lp.drive_num as usize)?;
        let drives = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| {
                let mut uuid = [0u8; 16];
                uuid[..8].copy_from_slice(&(i as u64).to_be_bytes());
                DriveSlot::new(path, uuid)
            })
            .collect();
        Ok((lp, drives))
    }

    fn acquire(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let (lp, drives) = Self::parse_acquire_payload(payload)?;
        let mode = mode_from_wire(lp.mode)?;
        let ls = self.lockspace()?;
        // Every acquire carries the full lock definition; register it
        // idempotently before issuing the acquire itself (`lock.c`'s
        // `ilm_lock_payload_read` path re-reads the whole payload on
        // every call rather than caching it from a prior add).
        ls.add_lock(lp.lock_id, lp.timeout_ms as i64, drives)?;
        ls.acquire(lp.lock_id, mode)?;
        Ok(Vec::new())
    }

    fn release(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let lp = LockPayload::parse(payload)?;
        self.lockspace()?.release(lp.lock_id)?;
        Ok(Vec::new())
    }

    fn convert(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let lp = LockPayload::parse(payload)?;
        let mode = mode_from_wire(lp.mode)?;
        self.lockspace()?.convert(lp.lock_id, mode)?;
        Ok(Vec::new())
    }

    fn write_lvb(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let lp = LockPayload::parse(payload)?;
        let tail = &payload[LockPayload::SIZE..];
        if tail.len() < VALUE_LEN {
            return Err(Error::new(ErrorKind::Invalid, "write_lvb payload too short"));
        }
        let mut lvb = [0u8; VALUE_LEN];
        lvb.copy_from_slice(&tail[..VALUE_LEN]);
        self.lockspace()?.write_lvb(lp.lock_id, lvb)?;
        Ok(Vec::new())
    }

    fn read_lvb(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let lp = LockPayload::parse(payload)?;
        let lvb = self.lockspace()?.read_lvb(lp.lock_id)?;
        Ok(lvb.to_vec())
    }

    fn lock_host_count(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let lp = LockPayload::parse(payload)?;
        let (others, has_self) = self.lockspace()?.host_count(lp.lock_id)?;
        let mut reply = Vec::with_capacity(8);
        reply.extend_from_slice(&others.to_le_bytes());
        reply.extend_from_slice(&has_self.to_le_bytes());
        Ok(reply)
    }

    fn lock_mode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let lp = LockPayload::parse(payload)?;
        let mode = self.lockspace()?.lock_mode(lp.lock_id)?;
        Ok(mode_to_wire(mode).to_le_bytes().to_vec())
    }

    fn set_signal(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < 8 {
            return Err(Error::new(ErrorKind::Invalid, "set_signal payload too short"));
        }
        let pid = i32::from_le_bytes(payload[0..4].try_into().unwrap());
        let sig = i32::from_le_bytes(payload[4..8].try_into().unwrap());
        let mut fencing = self.fencing.lock().unwrap();
        fencing.kill_pid = Some(if pid != 0 { pid } else { self.peer_pid });
        fencing.kill_signal = Some(sig);
        self.push_fencing(&fencing);
        Ok(Vec::new())
    }

    fn set_killpath(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(payload).map_err(|_| Error::new(ErrorKind::Invalid, "killpath is not valid UTF-8"))?;
        let text = text.trim_end_matches('\0');
        let (path, args) = text.split_once(' ').unwrap_or((text, ""));
        if path.is_empty() {
            return Err(Error::new(ErrorKind::Invalid, "empty killpath"));
        }
        let mut fencing = self.fencing.lock().unwrap();
        fencing.kill_path = Some(path.to_string());
        fencing.kill_args = args.to_string();
        self.push_fencing(&fencing);
        Ok(Vec::new())
    }

    fn push_fencing(&self, fencing: &FencingConfig) {
        if let Ok(ls) = self.lockspace() {
            ls.set_fencing(fencing.clone());
        }
    }

    fn set_host_id(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < HOST_ID_LEN {
            return Err(Error::new(ErrorKind::Invalid, "set_host_id payload too short"));
        }
        let mut host_id = [0u8; HOST_ID_LEN];
        host_id.copy_from_slice(&payload[..HOST_ID_LEN]);
        self.lockspace()?.set_host_id(host_id)?;
        Ok(Vec::new())
    }

    fn set_renew_enabled(&self, enabled: bool) -> Result<Vec<u8>> {
        self.lockspace()?.set_renew_enabled(enabled);
        Ok(Vec::new())
    }

    /// Called when the client connection drops. Releases every lock the
    /// session still holds, best-effort (spec section 5: "client
    /// disconnects cause the dispatcher to cancel pending waits and
    /// transition each held lock to release").
    pub fn disconnect(&self) {
        if let Some(ls) = self.lockspace.lock().unwrap().take() {
            ls.shutdown();
        }
    }

    fn inject_fault(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < 4 {
            return Err(Error::new(ErrorKind::Invalid, "inject_fault payload too short"));
        }
        let percentage = i32::from_le_bytes(payload[0..4].try_into().unwrap());
        self.fault.set_percentage(percentage)?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::MemDrive;
    use crate::wire::LOCK_ID_LEN;

    fn new_session() -> ClientSession {
        let fault = Arc::new(FaultInjector::new());
        let engine = Arc::new(RaidEngine::new(Arc::new(MemDrive::new()), Arc::clone(&fault)));
        ClientSession::new(engine, fault, 4242)
    }

    fn lock_payload(mode: u32, drive_num: u32, lock_id: [u8; LOCK_ID_LEN]) -> LockPayload {
        LockPayload { mode, drive_num, lock_id, timeout_ms: 3000, quiescent: 0 }
    }

    fn framed_acquire(lock_id: [u8; LOCK_ID_LEN], mode: u32, paths: &[&str]) -> Vec<u8> {
        let paths: Vec<String> = paths.iter().map(|s| s.to_string()).collect();
        let mut buf = lock_payload(mode, paths.len() as u32, lock_id).pack();
        buf.extend_from_slice(&frame::pack_drive_paths(&paths).unwrap());
        buf
    }

    #[test]
    fn version_reports_the_protocol_sentinel() {
        let session = new_session();
        let (result, reply) = session.dispatch(CmdOpcode::Version as u32, &[]);
        assert_eq!(result, 0);
        assert_eq!(u32::from_le_bytes(reply.try_into().unwrap()), PROTOCOL_VERSION);
    }

    #[test]
    fn unknown_opcode_is_invalid() {
        let session = new_session();
        let (result, _) = session.dispatch(99, &[]);
        assert_eq!(result, ErrorKind::Invalid.to_errno());
    }

    #[test]
    fn full_acquire_release_round_trip_through_the_wire() {
        let session = new_session();
        let (r, _) = session.dispatch(CmdOpcode::AddLockspace as u32, &[]);
        assert_eq!(r, 0);

        let mut host_id = [0u8; HOST_ID_LEN];
        host_id[0] = 7;
        let (r, _) = session.dispatch(CmdOpcode::SetHostId as u32, &host_id);
        assert_eq!(r, 0);

        let lock_id = [5u8; LOCK_ID_LEN];
        let req = framed_acquire(lock_id, 1, &["/dev/sda", "/dev/sdb", "/dev/sdc"]);
        let (r, _) = session.dispatch(CmdOpcode::Acquire as u32, &req);
        assert_eq!(r, 0);

        let (r, reply) = session.dispatch(CmdOpcode::LockMode as u32, &lock_payload(0, 0, lock_id).pack());
        assert_eq!(r, 0);
        assert_eq!(u32::from_le_bytes(reply.try_into().unwrap()), 1);

        let (r, _) = session.dispatch(CmdOpcode::Release as u32, &lock_payload(0, 0, lock_id).pack());
        assert_eq!(r, 0);

        let (r, _) = session.dispatch(CmdOpcode::DelLockspace as u32, &[]);
        assert_eq!(r, 0);
    }

    #[test]
    fn operations_without_a_lockspace_are_invalid() {
        let session = new_session();
        let (r, _) = session.dispatch(CmdOpcode::Release as u32, &lock_payload(0, 0, [0; LOCK_ID_LEN]).pack());
        assert_eq!(r, ErrorKind::Invalid.to_errno());
    }

    #[test]
    fn inject_fault_rejects_out_of_range_percentage() {
        let session = new_session();
        let (r, _) = session.dispatch(CmdOpcode::InjectFault as u32, &101i32.to_le_bytes());
        assert_eq!(r, ErrorKind::Invalid.to_errno());
    }

    #[test]
    fn lvb_round_trips_through_the_wire() {
        let session = new_session();
        session.dispatch(CmdOpcode::AddLockspace as u32, &[]);
        session.dispatch(CmdOpcode::SetHostId as u32, &[9u8; HOST_ID_LEN]);

        let lock_id = [2u8; LOCK_ID_LEN];
        let req = framed_acquire(lock_id, 1, &["/dev/sda"]);
        session.dispatch(CmdOpcode::Acquire as u32, &req);

        let mut write_req = lock_payload(0, 0, lock_id).pack();
        write_req.extend_from_slice(&[0xAB; VALUE_LEN]);
        let (r, _) = session.dispatch(CmdOpcode::WriteLvb as u32, &write_req);
        assert_eq!(r, 0);

        let (r, reply) = session.dispatch(CmdOpcode::ReadLvb as u32, &lock_payload(0, 0, lock_id).pack());
        assert_eq!(r, 0);
        assert_eq!(reply, vec![0xAB; VALUE_LEN]);
    }
}
