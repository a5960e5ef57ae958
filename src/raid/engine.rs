//! The quorum algorithms themselves: acquire, release, convert, renew,
//! break, LVB read/write, count and mode. One [`RaidEngine`] is shared by
//! every lock in a lockspace; it only holds the drive transport, never
//! lock state, so locks can be mutated independently under their own
//! per-lock mutex (spec section 5).
//!
//! Grounded in `raid_lock.c`'s `idm_raid_lock`/`_raid_lock`,
//! `idm_raid_convert_lock`, `idm_raid_renew_lock`, `idm_raid_write_lvb`,
//! `idm_raid_read_lvb`, `idm_raid_count`, `idm_raid_mode`.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::drive::{DriveCommand, DriveTransport};
use crate::error::{Error, ErrorKind, Result};
use crate::fault::FaultInjector;
use crate::lock::{Lock, LockMode};
use crate::raid::slot::DriveSlotState;
use crate::wire::{Class, DriveState, Opcode, Record, ResVerType, HOST_ID_LEN, LOCK_ID_LEN, VALUE_LEN};

/// Overall wall-clock deadline for one outer RAID operation (spec
/// section 4.E / 5).
const RAID_DEADLINE: Duration = Duration::from_secs(5);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn mode_to_class(mode: LockMode) -> Class {
    match mode {
        LockMode::Exclusive => Class::Exclusive,
        LockMode::Shareable => Class::SharedProtectedRead,
        // Unlocked never reaches the wire as a lock class; callers that
        // issue unlock/break records don't look at class, but a value is
        // still needed to fill out the record.
        LockMode::Unlocked => Class::Exclusive,
    }
}

fn blank_record(
    lock_id: [u8; LOCK_ID_LEN],
    host_id: [u8; HOST_ID_LEN],
    class: Class,
    countdown_ms: i64,
    res_ver_type: ResVerType,
    lvb: [u8; VALUE_LEN],
) -> Record {
    Record {
        state: None,
        time_now: now_ms(),
        modified: 0,
        countdown: countdown_ms,
        class,
        res_ver_type,
        lvb,
        resource_id: lock_id,
        metadata: [0; crate::wire::METADATA_LEN],
        host_id,
    }
}

/// Coordinates per-drive IDM commands into quorum-correct lock
/// operations. Stateless beyond the drive transport: all lock state
/// lives in the [`Lock`] passed to each method.
pub struct RaidEngine {
    transport: Arc<dyn DriveTransport>,
    fault: Arc<FaultInjector>,
}

impl RaidEngine {
    pub fn new(transport: Arc<dyn DriveTransport>, fault: Arc<FaultInjector>) -> Self {
        RaidEngine { transport, fault }
    }

    /// Every per-drive command passes through here, so a configured fault
    /// percentage hits the renewal scheduler and the RAID-fenced device
    /// path exactly the same as a client-initiated call, not just calls
    /// that happen to go through the lockspace's dispatch-level check.
    fn issue(&self, drive: &str, cmd: DriveCommand, opcode: Opcode) -> Result<Vec<Record>> {
        self.fault.check()?;
        let outcome = self.transport.execute(drive, &cmd)?;
        crate::drive::transport::outcome_to_result(outcome, opcode)
    }

    fn issue_trylock(
        &self,
        lock_id: [u8; LOCK_ID_LEN],
        host_id: [u8; HOST_ID_LEN],
        drive: &str,
        mode: LockMode,
        countdown_ms: i64,
    ) -> Result<()> {
        let rec = blank_record(
            lock_id,
            host_id,
            mode_to_class(mode),
            countdown_ms,
            ResVerType::NoUpdateNoValid,
            [0; VALUE_LEN],
        );
        self.issue(drive, DriveCommand::write(Opcode::Trylock, rec), Opcode::Trylock)
            .map(|_| ())
    }

    fn issue_unlock(&self, lock_id: [u8; LOCK_ID_LEN], host_id: [u8; HOST_ID_LEN], drive: &str) -> Result<()> {
        let rec = blank_record(
            lock_id,
            host_id,
            Class::Exclusive,
            0,
            ResVerType::NoUpdateNoValid,
            [0; VALUE_LEN],
        );
        self.issue(drive, DriveCommand::write(Opcode::Unlock, rec), Opcode::Unlock)
            .map(|_| ())
    }

    fn issue_break(
        &self,
        lock_id: [u8; LOCK_ID_LEN],
        host_id: [u8; HOST_ID_LEN],
        drive: &str,
        mode: LockMode,
        countdown_ms: i64,
    ) -> Result<()> {
        let rec = blank_record(
            lock_id,
            host_id,
            mode_to_class(mode),
            countdown_ms,
            ResVerType::NoUpdateNoValid,
            [0; VALUE_LEN],
        );
        self.issue(drive, DriveCommand::write(Opcode::Break, rec), Opcode::Break)
            .map(|_| ())
    }

    fn issue_refresh(
        &self,
        lock_id: [u8; LOCK_ID_LEN],
        host_id: [u8; HOST_ID_LEN],
        drive: &str,
        mode: LockMode,
        countdown_ms: i64,
    ) -> Result<()> {
        let rec = blank_record(
            lock_id,
            host_id,
            mode_to_class(mode),
            countdown_ms,
            ResVerType::NoUpdateNoValid,
            [0; VALUE_LEN],
        );
        self.issue(drive, DriveCommand::write(Opcode::Refresh, rec), Opcode::Refresh)
            .map(|_| ())
    }

    fn issue_write_lvb(
        &self,
        lock_id: [u8; LOCK_ID_LEN],
        host_id: [u8; HOST_ID_LEN],
        drive: &str,
        mode: LockMode,
        countdown_ms: i64,
        lvb: [u8; VALUE_LEN],
    ) -> Result<()> {
        let rec = blank_record(lock_id, host_id, mode_to_class(mode), countdown_ms, ResVerType::UpdateValid, lvb);
        self.issue(drive, DriveCommand::write(Opcode::Refresh, rec), Opcode::Refresh)
            .map(|_| ())
    }

    fn issue_read_record(&self, lock_id: [u8; LOCK_ID_LEN], drive: &str) -> Result<Record> {
        let cmd = DriveCommand::read_resource(Opcode::Normal, lock_id, 1);
        let mut records = self.issue(drive, cmd, Opcode::Normal)?;
        records.pop().ok_or_else(|| Error::new(ErrorKind::NotFound, "drive returned no record"))
    }

    /// `_raid_lock`: trylock, breaking a busy peer or clearing a
    /// duplicate membership as needed.
    fn per_drive_lock(
        &self,
        lock_id: [u8; LOCK_ID_LEN],
        host_id: [u8; HOST_ID_LEN],
        drive: &str,
        mode: LockMode,
        countdown_ms: i64,
    ) -> Result<()> {
        match self.issue_trylock(lock_id, host_id, drive, mode, countdown_ms) {
            Ok(()) => Ok(()),
            Err(e) if e.kind == ErrorKind::Busy => self.issue_break(lock_id, host_id, drive, mode, countdown_ms),
            Err(e) if e.kind == ErrorKind::TryAgain => {
                match self.issue_unlock(lock_id, host_id, drive) {
                    Ok(()) => {}
                    Err(ue) if ue.kind == ErrorKind::Expired => {}
                    Err(ue) => return Err(ue),
                }
                self.issue_trylock(lock_id, host_id, drive, mode, countdown_ms)
            }
            Err(e) => Err(e),
        }
    }

    /// Acquires a majority of `lock`'s drives in `mode`, retrying within
    /// a 5s deadline with randomized backoff between rounds to break
    /// symmetry against a racing host (spec section 4.E "Acquire").
    pub fn acquire(&self, lock: &mut Lock, host_id: [u8; HOST_ID_LEN], mode: LockMode) -> Result<()> {
        let lock_id = lock.id;
        let countdown_ms = lock.timeout_ms;
        let quorum = lock.quorum();

        for drive in lock.drives.iter_mut() {
            drive.state = DriveSlotState::NoAccess;
        }

        let deadline = Instant::now() + RAID_DEADLINE;
        loop {
            let mut score = 0;
            for drive in lock.drives.iter_mut() {
                if self.per_drive_lock(lock_id, host_id, &drive.path, mode, countdown_ms).is_ok() {
                    drive.state = DriveSlotState::Accessed;
                    score += 1;
                }
            }

            if score >= quorum {
                lock.mode = mode;
                return Ok(());
            }

            for drive in lock.drives.iter_mut() {
                if drive.state == DriveSlotState::Accessed {
                    let _ = self.issue_unlock(lock_id, host_id, &drive.path);
                    drive.state = DriveSlotState::NoAccess;
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::timeout("acquire: failed to reach quorum within deadline"));
            }

            thread::sleep(Duration::from_micros(rand::thread_rng().gen_range(1..=10)));
        }
    }

    /// Privileged acquire that breaks ownership directly rather than
    /// trying a cooperative trylock first -- used to take over an IDM
    /// from peers whose membership has timed out (spec section 4.E
    /// "Break").
    pub fn break_lock(&self, lock: &mut Lock, host_id: [u8; HOST_ID_LEN], mode: LockMode) -> Result<()> {
        let lock_id = lock.id;
        let countdown_ms = lock.timeout_ms;
        let quorum = lock.quorum();

        for drive in lock.drives.iter_mut() {
            drive.state = DriveSlotState::NoAccess;
        }

        let deadline = Instant::now() + RAID_DEADLINE;
        loop {
            let mut score = 0;
            for drive in lock.drives.iter_mut() {
                if self.issue_break(lock_id, host_id, &drive.path, mode, countdown_ms).is_ok() {
                    drive.state = DriveSlotState::Accessed;
                    score += 1;
                }
            }

            if score >= quorum {
                lock.mode = mode;
                return Ok(());
            }

            for drive in lock.drives.iter_mut() {
                if drive.state == DriveSlotState::Accessed {
                    let _ = self.issue_unlock(lock_id, host_id, &drive.path);
                    drive.state = DriveSlotState::NoAccess;
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::timeout("break: failed to reach quorum within deadline"));
            }

            thread::sleep(Duration::from_micros(rand::thread_rng().gen_range(1..=10)));
        }
    }

    /// Best-effort unlock on every drive; every slot is reset to
    /// `NoAccess` regardless of the per-drive outcome (spec section 4.E
    /// "Release" -- release can never leave inherited state).
    pub fn release(&self, lock: &mut Lock, host_id: [u8; HOST_ID_LEN]) -> Result<()> {
        let lock_id = lock.id;
        let mut last_err = None;
        for drive in lock.drives.iter_mut() {
            if let Err(e) = self.issue_unlock(lock_id, host_id, &drive.path) {
                last_err = Some(e);
            }
            drive.state = DriveSlotState::NoAccess;
        }
        lock.mode = LockMode::Unlocked;
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn per_drive_convert(
        &self,
        lock_id: [u8; LOCK_ID_LEN],
        host_id: [u8; HOST_ID_LEN],
        drive: &mut crate::raid::slot::DriveSlot,
        new_mode: LockMode,
        countdown_ms: i64,
    ) -> Result<()> {
        if drive.state == DriveSlotState::NoAccess {
            self.per_drive_lock(lock_id, host_id, &drive.path, new_mode, countdown_ms)?;
            drive.state = DriveSlotState::Accessed;
        }

        match self.issue_refresh(lock_id, host_id, &drive.path, new_mode, countdown_ms) {
            Ok(()) => {
                drive.state = DriveSlotState::Accessed;
                Ok(())
            }
            Err(e) if e.kind == ErrorKind::Io => {
                drive.state = DriveSlotState::Failed;
                Err(e)
            }
            Err(e) if e.kind == ErrorKind::Expired => {
                let _ = self.issue_unlock(lock_id, host_id, &drive.path);
                drive.state = DriveSlotState::NoAccess;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Converts `lock`'s mode, attempting to revert a failed promotion
    /// and accepting a failed demotion as permanently safe but
    /// conversion-disabling (spec section 4.E "Convert"). Does not
    /// update `lock.mode` unless quorum is actually reached -- a partial
    /// demotion "success" intentionally leaves the previously-granted
    /// mode visible to `read_lock_mode` (design note: convert shares the
    /// refresh opcode with renew, and the old mode must stay visible
    /// until a future convert actually succeeds).
    pub fn convert(&self, lock: &mut Lock, host_id: [u8; HOST_ID_LEN], new_mode: LockMode) -> Result<()> {
        if lock.convert_failed {
            return Err(Error::new(ErrorKind::Invalid, "lock has a sticky convert failure; re-acquire required"));
        }

        let lock_id = lock.id;
        let countdown_ms = lock.timeout_ms;
        let quorum = lock.quorum();
        let old_mode = lock.mode;

        let mut score = 0;
        let mut expired = 0;
        for drive in lock.drives.iter_mut() {
            match self.per_drive_convert(lock_id, host_id, drive, new_mode, countdown_ms) {
                Ok(()) => score += 1,
                Err(e) if e.kind == ErrorKind::Expired => expired += 1,
                Err(_) => {}
            }
        }

        if score >= quorum {
            lock.mode = new_mode;
            return Ok(());
        }

        if expired == lock.drives.len() {
            return Err(Error::new(ErrorKind::Expired, "all drives report expired membership"));
        }

        let promotion = old_mode == LockMode::Shareable && new_mode == LockMode::Exclusive;
        if !promotion {
            // Demotion is always logically safe even on a minority: the
            // exclusive holder is simply relaxing its own grant. Disable
            // further conversions since the drive set may now disagree.
            lock.convert_failed = true;
            return Ok(());
        }

        // Promotion failed to reach quorum: try to revert the drives we
        // did convert back to the old mode.
        let mut revert_score = 0;
        for drive in lock.drives.iter_mut() {
            if drive.state == DriveSlotState::NoAccess {
                revert_score += 1;
                continue;
            }
            if self.per_drive_convert(lock_id, host_id, drive, old_mode, countdown_ms).is_ok() {
                revert_score += 1;
            }
        }

        if revert_score < quorum {
            lock.convert_failed = true;
        }

        Err(Error::new(ErrorKind::Busy, "convert failed to reach quorum"))
    }

    fn per_drive_renew(
        &self,
        lock_id: [u8; LOCK_ID_LEN],
        host_id: [u8; HOST_ID_LEN],
        drive: &mut crate::raid::slot::DriveSlot,
        mode: LockMode,
        countdown_ms: i64,
    ) -> Result<()> {
        if drive.state == DriveSlotState::NoAccess {
            self.per_drive_lock(lock_id, host_id, &drive.path, mode, countdown_ms)?;
            drive.state = DriveSlotState::Accessed;
        }

        match self.issue_refresh(lock_id, host_id, &drive.path, mode, countdown_ms) {
            Ok(()) => {
                drive.state = DriveSlotState::Accessed;
                Ok(())
            }
            Err(e) if e.kind == ErrorKind::Io => {
                drive.state = DriveSlotState::Failed;
                Err(e)
            }
            // Firmware reports a mode mismatch: clear the drive's context
            // and re-acquire clean, then the caller gets this round's result.
            Err(e) if e.kind == ErrorKind::PermissionDenied => {
                let _ = self.issue_unlock(lock_id, host_id, &drive.path);
                drive.state = DriveSlotState::NoAccess;
                match self.per_drive_lock(lock_id, host_id, &drive.path, mode, countdown_ms) {
                    Ok(()) => {
                        drive.state = DriveSlotState::Accessed;
                        Ok(())
                    }
                    Err(e2) => Err(e2),
                }
            }
            Err(e) if e.kind == ErrorKind::Expired => {
                let _ = self.issue_unlock(lock_id, host_id, &drive.path);
                drive.state = DriveSlotState::NoAccess;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Renews `lock`'s membership on every drive, within a 5s deadline.
    /// Uses the even/odd alive-count rule from spec section 4.E
    /// "Renew" (`⌊N/2⌋` for even `N`, `⌊N/2⌋+1` for odd `N`).
    pub fn renew(&self, lock: &mut Lock, host_id: [u8; HOST_ID_LEN]) -> Result<()> {
        let lock_id = lock.id;
        let mode = lock.mode;
        let countdown_ms = lock.timeout_ms;
        let n = lock.drives.len();
        let quorum_alive = if n % 2 == 0 { n / 2 } else { n / 2 + 1 };

        let deadline = Instant::now() + RAID_DEADLINE;
        loop {
            let mut score = 0;
            for drive in lock.drives.iter_mut() {
                if self.per_drive_renew(lock_id, host_id, drive, mode, countdown_ms).is_ok() {
                    score += 1;
                }
            }

            if score >= quorum_alive {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::timeout("renew: failed to reach quorum within deadline"));
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    fn per_drive_write_lvb(
        &self,
        lock_id: [u8; LOCK_ID_LEN],
        host_id: [u8; HOST_ID_LEN],
        drive: &mut crate::raid::slot::DriveSlot,
        mode: LockMode,
        countdown_ms: i64,
        lvb: [u8; VALUE_LEN],
    ) -> Result<()> {
        if drive.state == DriveSlotState::NoAccess {
            self.per_drive_lock(lock_id, host_id, &drive.path, mode, countdown_ms)?;
            drive.state = DriveSlotState::Accessed;
        }

        match self.issue_write_lvb(lock_id, host_id, &drive.path, mode, countdown_ms, lvb) {
            Ok(()) => {
                drive.state = DriveSlotState::Accessed;
                Ok(())
            }
            Err(e) if e.kind == ErrorKind::Io => {
                drive.state = DriveSlotState::Failed;
                Err(e)
            }
            Err(e) if e.kind == ErrorKind::Expired => {
                let _ = self.issue_unlock(lock_id, host_id, &drive.path);
                drive.state = DriveSlotState::NoAccess;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes a new LVB to a majority of drives within the 5s deadline;
    /// rolls back every drive to the previously cached LVB on failure
    /// (spec section 4.E "LVB write"). The rollback itself is
    /// best-effort and unchecked for quorum -- a known limitation
    /// carried from the design notes.
    pub fn write_lvb(&self, lock: &mut Lock, host_id: [u8; HOST_ID_LEN], new_lvb: [u8; VALUE_LEN]) -> Result<()> {
        let lock_id = lock.id;
        let mode = lock.mode;
        let countdown_ms = lock.timeout_ms;
        let quorum = lock.quorum();
        let old_lvb = lock.lvb;

        let deadline = Instant::now() + RAID_DEADLINE;
        loop {
            let mut score = 0;
            for drive in lock.drives.iter_mut() {
                if self
                    .per_drive_write_lvb(lock_id, host_id, drive, mode, countdown_ms, new_lvb)
                    .is_ok()
                {
                    score += 1;
                }
            }

            if score >= quorum {
                lock.lvb = new_lvb;
                return Ok(());
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        for drive in lock.drives.iter_mut() {
            let _ = self.per_drive_write_lvb(lock_id, host_id, drive, mode, countdown_ms, old_lvb);
        }

        Err(Error::timeout("write_lvb: failed to reach quorum, rolled back"))
    }

    /// Reads the LVB from a majority of drives, acquiring any
    /// not-yet-accessed drive along the way (spec section 4.E
    /// "LVB read").
    pub fn read_lvb(&self, lock: &mut Lock, host_id: [u8; HOST_ID_LEN]) -> Result<[u8; VALUE_LEN]> {
        let lock_id = lock.id;
        let mode = lock.mode;
        let countdown_ms = lock.timeout_ms;
        let quorum = lock.quorum();

        let deadline = Instant::now() + RAID_DEADLINE;
        loop {
            let mut votes: HashMap<[u8; VALUE_LEN], usize> = HashMap::new();
            for drive in lock.drives.iter_mut() {
                if drive.state == DriveSlotState::NoAccess {
                    match self.per_drive_lock(lock_id, host_id, &drive.path, mode, countdown_ms) {
                        Ok(()) => drive.state = DriveSlotState::Accessed,
                        Err(_) => continue,
                    }
                }

                match self.issue_read_record(lock_id, &drive.path) {
                    Ok(rec) => {
                        drive.state = DriveSlotState::Accessed;
                        *votes.entry(rec.lvb).or_insert(0) += 1;
                    }
                    Err(e) if e.kind == ErrorKind::Io => drive.state = DriveSlotState::Failed,
                    Err(e) if e.kind == ErrorKind::Expired => {
                        let _ = self.issue_unlock(lock_id, host_id, &drive.path);
                        drive.state = DriveSlotState::NoAccess;
                    }
                    Err(_) => {}
                }
            }

            if let Some((&lvb, _)) = votes.iter().find(|(_, &count)| count >= quorum) {
                lock.lvb = lvb;
                return Ok(lvb);
            }

            if Instant::now() >= deadline {
                return Err(Error::timeout("read_lvb: failed to reach quorum agreement"));
            }
        }
    }

    /// Reports `(others, self)` host counts for `lock_id` as observed on
    /// a majority of already-`Accessed` drives (spec section 4.E
    /// "Count"). A drive's per-lock record carries one representative
    /// `host_id`, so "self" is a 0/1 presence flag rather than a host
    /// tally; "others" counts the drives (not distinct hosts) that
    /// report a different holder.
    pub fn count(&self, lock: &Lock, host_id: [u8; HOST_ID_LEN]) -> Result<(u32, u32)> {
        let mut others = 0u32;
        let mut self_present = 0u32;
        let mut agree = 0usize;

        for drive in lock.drives.iter().filter(|d| d.state == DriveSlotState::Accessed) {
            let rec = match self.issue_read_record(lock.id, &drive.path) {
                Ok(rec) => rec,
                Err(_) => continue,
            };

            match rec.state {
                Some(DriveState::Locked) | Some(DriveState::MultipleLocked) => {
                    agree += 1;
                    if rec.host_id == host_id {
                        self_present = 1;
                    } else {
                        others += 1;
                    }
                }
                _ => {}
            }
        }

        if agree >= lock.quorum() {
            Ok((others, self_present))
        } else {
            Err(Error::new(ErrorKind::Busy, "count: drives disagree on lock membership"))
        }
    }

    /// Reports the lock's mode as the argmax bucket of {Unlocked,
    /// Exclusive, Shareable} across `Accessed` drives, if that bucket
    /// reaches quorum (spec section 4.E "Mode"). A `ProtectedWrite`
    /// observation is always a hard error.
    pub fn mode(&self, lock: &Lock) -> Result<LockMode> {
        let mut counts = [0usize; 3];

        for drive in lock.drives.iter().filter(|d| d.state == DriveSlotState::Accessed) {
            let rec = match self.issue_read_record(lock.id, &drive.path) {
                Ok(rec) => rec,
                Err(_) => continue,
            };

            let bucket = if rec.state == Some(DriveState::Unlocked) {
                0
            } else {
                match rec.class {
                    Class::Exclusive => 1,
                    Class::SharedProtectedRead => 2,
                    Class::ProtectedWrite => {
                        return Err(Error::new(ErrorKind::Invalid, "drive reported ProtectedWrite class"))
                    }
                }
            };
            counts[bucket] += 1;
        }

        let (max_idx, &max_val) = counts.iter().enumerate().max_by_key(|(_, v)| **v).unwrap();

        if max_val >= lock.quorum() {
            Ok(match max_idx {
                0 => LockMode::Unlocked,
                1 => LockMode::Exclusive,
                2 => LockMode::Shareable,
                _ => unreachable!(),
            })
        } else {
            Err(Error::new(ErrorKind::Busy, "mode: drives disagree on lock mode"))
        }
    }

    /// Issues the inquiry-group mutex count for one drive (used by
    /// `ilmctl` diagnostics, not part of the quorum path).
    pub fn drive_mutex_count(&self, drive: &str) -> Result<u64> {
        crate::drive::transport::mutex_count(self.transport.as_ref(), drive)
    }

    /// Reads the lossy IDM-version sentinel for one drive (spec section
    /// 4.B).
    pub fn drive_version(&self, drive: &str) -> Result<u32> {
        crate::drive::transport::read_version(self.transport.as_ref(), drive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::MemDrive;
    use crate::raid::slot::DriveSlot;

    fn host(n: u8) -> [u8; HOST_ID_LEN] {
        let mut h = [0u8; HOST_ID_LEN];
        h[0] = n;
        h
    }

    fn lock_with_drives(n: usize) -> Lock {
        let drives = (0..n)
            .map(|i| {
                let mut uuid = [0u8; 16];
                uuid[0] = i as u8;
                DriveSlot::new(format!("/dev/sd{i}"), uuid)
            })
            .collect();
        Lock::new([7; LOCK_ID_LEN], host(1), 3000, drives)
    }

    #[test]
    fn acquire_reaches_quorum_and_release_resets_every_slot() {
        let transport = Arc::new(MemDrive::new());
        let engine = RaidEngine::new(transport, Arc::new(FaultInjector::new()));
        let mut lock = lock_with_drives(3);

        engine.acquire(&mut lock, host(1), LockMode::Exclusive).unwrap();
        assert_eq!(lock.accessed_count(), 3);
        assert!(lock.is_granted());

        engine.release(&mut lock, host(1)).unwrap();
        assert_eq!(lock.accessed_count(), 0);
        assert_eq!(lock.mode, LockMode::Unlocked);
    }

    #[test]
    fn acquire_rejects_a_peer_whose_membership_is_still_live() {
        // Spec invariant 2 / scenario 2: exactly one of two racing hosts
        // wins acquire while the other's membership is live. A per-drive
        // `Busy` from trylock falls through to `Break`, but break itself
        // must refuse a still-live holder, so the peer's grant can't be
        // stolen out from under it.
        let transport = Arc::new(MemDrive::new());
        let engine = RaidEngine::new(transport, Arc::new(FaultInjector::new()));

        let mut lock_a = lock_with_drives(4);
        engine.acquire(&mut lock_a, host(0xA), LockMode::Exclusive).unwrap();
        assert!(lock_a.is_granted());

        let lock_id = lock_a.id;
        let drive = &lock_a.drives[0].path;
        let err = engine.per_drive_lock(lock_id, host(0xB), drive, LockMode::Exclusive, 3000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
    }

    #[test]
    fn break_lock_takes_over_ownership_once_the_holder_expires() {
        let transport = Arc::new(MemDrive::new());
        let engine = RaidEngine::new(transport, Arc::new(FaultInjector::new()));

        let drives = lock_with_drives(3).drives;
        let mut lock_a = Lock::new([7; LOCK_ID_LEN], host(0xA), 20, drives);
        engine.acquire(&mut lock_a, host(0xA), LockMode::Exclusive).unwrap();
        thread::sleep(Duration::from_millis(40));

        let mut lock_b = Lock::new([7; LOCK_ID_LEN], host(0xB), 3000, lock_a.drives.clone());
        engine.break_lock(&mut lock_b, host(0xB), LockMode::Exclusive).unwrap();
        assert!(lock_b.is_granted());

        let (others, self_count) = engine.count(&lock_b, host(0xB)).unwrap();
        assert_eq!(others, 0);
        assert_eq!(self_count, 1);
    }

    #[test]
    fn convert_exclusive_to_shareable_and_back() {
        let transport = Arc::new(MemDrive::new());
        let engine = RaidEngine::new(transport, Arc::new(FaultInjector::new()));
        let mut lock = lock_with_drives(3);

        engine.acquire(&mut lock, host(1), LockMode::Exclusive).unwrap();
        engine.convert(&mut lock, host(1), LockMode::Shareable).unwrap();
        assert_eq!(lock.mode, LockMode::Shareable);

        engine.convert(&mut lock, host(1), LockMode::Exclusive).unwrap();
        assert_eq!(lock.mode, LockMode::Exclusive);
        assert!(!lock.convert_failed);
    }

    #[test]
    fn renew_keeps_majority_alive() {
        let transport = Arc::new(MemDrive::new());
        let engine = RaidEngine::new(transport, Arc::new(FaultInjector::new()));
        let mut lock = lock_with_drives(2);

        engine.acquire(&mut lock, host(1), LockMode::Exclusive).unwrap();
        engine.renew(&mut lock, host(1)).unwrap();
        assert_eq!(lock.accessed_count(), 2);
    }

    #[test]
    fn lvb_round_trips_through_write_and_read() {
        let transport = Arc::new(MemDrive::new());
        let engine = RaidEngine::new(transport, Arc::new(FaultInjector::new()));
        let mut lock = lock_with_drives(3);

        engine.acquire(&mut lock, host(1), LockMode::Exclusive).unwrap();
        engine.write_lvb(&mut lock, host(1), *b"ABCDEFGH").unwrap();
        let read = engine.read_lvb(&mut lock, host(1)).unwrap();
        assert_eq!(&read, b"ABCDEFGH");
    }

    #[test]
    fn count_reports_self_only_for_the_holder() {
        let transport = Arc::new(MemDrive::new());
        let engine = RaidEngine::new(transport, Arc::new(FaultInjector::new()));
        let mut lock = lock_with_drives(2);

        engine.acquire(&mut lock, host(1), LockMode::Exclusive).unwrap();
        let (others, self_count) = engine.count(&lock, host(1)).unwrap();
        assert_eq!(others, 0);
        assert_eq!(self_count, 1);
    }

    #[test]
    fn fault_injection_reaches_the_per_drive_renew_path() {
        // Spec section 8 scenario 6: injecting a fault must be able to
        // fail a renewal round, not just a client-initiated call, since
        // the renewal scheduler also goes through `issue`.
        let fault = Arc::new(FaultInjector::new());
        let engine = RaidEngine::new(Arc::new(MemDrive::new()), Arc::clone(&fault));
        let mut lock = lock_with_drives(1);
        engine.acquire(&mut lock, host(1), LockMode::Exclusive).unwrap();

        fault.set_percentage(100).unwrap();
        let lock_id = lock.id;
        let drive = &mut lock.drives[0];
        let err = engine.per_drive_renew(lock_id, host(1), drive, LockMode::Exclusive, 3000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);
    }

    #[test]
    fn mode_reports_exclusive_after_acquire() {
        let transport = Arc::new(MemDrive::new());
        let engine = RaidEngine::new(transport, Arc::new(FaultInjector::new()));
        let mut lock = lock_with_drives(3);

        engine.acquire(&mut lock, host(1), LockMode::Exclusive).unwrap();
        assert_eq!(engine.mode(&lock).unwrap(), LockMode::Exclusive);
    }
}
