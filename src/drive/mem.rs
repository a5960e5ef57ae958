//! Pure in-memory drive emulation used only by tests. Tracks one mutex
//! record per resource id and enforces the same conflict rules real
//! firmware reports (spec section "DATA MODEL" + the status table in
//! section 4.A), without any actual device I/O.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::wire::{Class, DeviceStatus, DriveState, Opcode, Record, ResVerType, HOST_ID_LEN, LOCK_ID_LEN, VALUE_LEN};

use super::transport::{DriveCommand, DriveOutcome, DriveTransport};

#[derive(Clone)]
struct MemLock {
    class: Class,
    hosts: Vec<[u8; HOST_ID_LEN]>,
    lvb: [u8; VALUE_LEN],
    countdown: i64,
    modified: u64,
    /// When the current membership lapses; `None` means either unheld or
    /// an infinite (`countdown == -1`) grant.
    expires_at: Option<Instant>,
}

/// Membership deadline for a grant written with `countdown_ms` (spec
/// section "DATA MODEL": `-1` means infinite).
fn expiry_for(countdown_ms: i64) -> Option<Instant> {
    if countdown_ms < 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(countdown_ms as u64))
    }
}

/// Whether `lock`'s current membership is still live: held, and either
/// infinite or not yet past its deadline. An infinite grant is never
/// breakable under this clock-based model since there's no "unresponsive"
/// signal to test it against.
fn is_live(lock: &MemLock) -> bool {
    if lock.hosts.is_empty() {
        return false;
    }
    match lock.expires_at {
        Some(exp) => Instant::now() < exp,
        None => true,
    }
}

/// An in-memory drive. `version_byte` controls what [`identify`] reports;
/// tests that need to simulate a non-IDM drive set it below
/// `MIN_IDM_VERSION`.
pub struct MemDrive {
    locks: Mutex<HashMap<[u8; LOCK_ID_LEN], MemLock>>,
    version_byte: u8,
    tick: Mutex<u64>,
}

impl Default for MemDrive {
    fn default() -> Self {
        MemDrive {
            locks: Mutex::new(HashMap::new()),
            version_byte: super::transport::MIN_IDM_VERSION,
            tick: Mutex::new(0),
        }
    }
}

impl MemDrive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version_byte(version_byte: u8) -> Self {
        MemDrive {
            version_byte,
            ..Self::default()
        }
    }

    fn next_tick(&self) -> u64 {
        let mut t = self.tick.lock().unwrap();
        *t += 1;
        *t
    }

    fn read_record(&self, lock: &MemLock) -> Record {
        Record {
            state: Some(if lock.hosts.is_empty() {
                DriveState::Unlocked
            } else if lock.hosts.len() > 1 {
                DriveState::MultipleLocked
            } else {
                DriveState::Locked
            }),
            time_now: 0,
            modified: lock.modified,
            countdown: lock.countdown,
            class: lock.class,
            res_ver_type: ResVerType::UpdateValid,
            lvb: lock.lvb,
            resource_id: [0; LOCK_ID_LEN],
            metadata: [0; crate::wire::METADATA_LEN],
            // Real firmware reports one representative host per read; an
            // empty list (unlocked) has no holder to report.
            host_id: lock.hosts.first().copied().unwrap_or([0; HOST_ID_LEN]),
        }
    }
}

impl DriveTransport for MemDrive {
    fn execute(&self, _drive: &str, cmd: &DriveCommand) -> crate::error::Result<DriveOutcome> {
        // Inquiry reads report the total number of outstanding locks and
        // aren't addressed to any particular resource.
        if cmd.group == crate::wire::GROUP_INQUIRY {
            let locks = self.locks.lock().unwrap();
            let mut rec = self.read_record(&MemLock {
                class: Class::Exclusive,
                hosts: Vec::new(),
                lvb: [0; VALUE_LEN],
                countdown: locks.len() as i64,
                modified: 0,
                expires_at: None,
            });
            rec.countdown = locks.len() as i64;
            return Ok(DriveOutcome::success(vec![rec]));
        }

        let resource_id = match cmd.resource_id {
            Some(id) => id,
            None => return Ok(DriveOutcome::failure(DeviceStatus::InvalidOpcode)),
        };

        let mut locks = self.locks.lock().unwrap();

        match cmd.opcode {
            Opcode::Init => {
                locks.entry(resource_id).or_insert_with(|| MemLock {
                    class: Class::Exclusive,
                    hosts: Vec::new(),
                    lvb: [0; VALUE_LEN],
                    countdown: 0,
                    modified: 0,
                    expires_at: None,
                });
                Ok(DriveOutcome::success(Vec::new()))
            }
            Opcode::Destroy => {
                locks.remove(&resource_id);
                Ok(DriveOutcome::success(Vec::new()))
            }
            Opcode::Trylock | Opcode::Lock => {
                let write = match &cmd.write_record {
                    Some(r) => r,
                    None => return Ok(DriveOutcome::failure(DeviceStatus::InvalidOpcode)),
                };
                let tick = self.next_tick();
                let entry = locks.entry(resource_id).or_insert_with(|| MemLock {
                    class: write.class,
                    hosts: Vec::new(),
                    lvb: [0; VALUE_LEN],
                    countdown: write.countdown,
                    modified: 0,
                    expires_at: None,
                });

                if entry.hosts.iter().any(|h| *h == write.host_id) {
                    return Ok(DriveOutcome::failure(DeviceStatus::MutexHeldAlready));
                }

                let grantable = entry.hosts.is_empty()
                    || (entry.class == Class::SharedProtectedRead
                        && write.class == Class::SharedProtectedRead);

                if !grantable {
                    return Ok(DriveOutcome::failure(DeviceStatus::MutexHeldByAnother));
                }

                if entry.hosts.is_empty() {
                    entry.class = write.class;
                }
                entry.hosts.push(write.host_id);
                entry.countdown = write.countdown;
                entry.modified = tick;
                entry.expires_at = expiry_for(write.countdown);
                Ok(DriveOutcome::success(Vec::new()))
            }
            Opcode::Unlock => {
                let write = match &cmd.write_record {
                    Some(r) => r,
                    None => return Ok(DriveOutcome::failure(DeviceStatus::InvalidOpcode)),
                };
                match locks.get_mut(&resource_id) {
                    Some(entry) => {
                        let before = entry.hosts.len();
                        entry.hosts.retain(|h| *h != write.host_id);
                        if entry.hosts.len() == before {
                            return Ok(DriveOutcome::failure(DeviceStatus::MutexConflict));
                        }
                        entry.modified = self.next_tick();
                        if entry.hosts.is_empty() {
                            locks.remove(&resource_id);
                        }
                        Ok(DriveOutcome::success(Vec::new()))
                    }
                    None => Ok(DriveOutcome::failure(DeviceStatus::MutexConflict)),
                }
            }
            Opcode::Refresh => {
                let write = match &cmd.write_record {
                    Some(r) => r,
                    None => return Ok(DriveOutcome::failure(DeviceStatus::InvalidOpcode)),
                };
                match locks.get_mut(&resource_id) {
                    Some(entry) => {
                        if !entry.hosts.iter().any(|h| *h == write.host_id) {
                            return Ok(DriveOutcome::failure(DeviceStatus::MutexConflict));
                        }
                        let converting = entry.class != write.class;
                        let others_present = entry.hosts.iter().any(|h| *h != write.host_id);
                        if converting && others_present {
                            return Ok(DriveOutcome::failure(DeviceStatus::MutexHeldAlready));
                        }
                        entry.class = write.class;
                        entry.countdown = write.countdown;
                        if write.res_ver_type == ResVerType::UpdateValid
                            || write.res_ver_type == ResVerType::UpdateNoValid
                        {
                            entry.lvb = write.lvb;
                        }
                        entry.modified = self.next_tick();
                        entry.expires_at = expiry_for(write.countdown);
                        Ok(DriveOutcome::success(Vec::new()))
                    }
                    None => Ok(DriveOutcome::failure(DeviceStatus::MutexConflict)),
                }
            }
            Opcode::Break => {
                // A break only succeeds against a lapsed or absent
                // membership: a still-live holder's grant can't be taken
                // over directly, otherwise two hosts could both observe
                // themselves as the exclusive owner (spec invariant 2).
                let write = match &cmd.write_record {
                    Some(r) => r,
                    None => return Ok(DriveOutcome::failure(DeviceStatus::InvalidOpcode)),
                };
                let tick = self.next_tick();
                let entry = locks.entry(resource_id).or_insert_with(|| MemLock {
                    class: write.class,
                    hosts: Vec::new(),
                    lvb: [0; VALUE_LEN],
                    countdown: write.countdown,
                    modified: 0,
                    expires_at: None,
                });

                if is_live(entry) {
                    return Ok(DriveOutcome::failure(DeviceStatus::MutexHeldByAnother));
                }

                entry.hosts.clear();
                entry.hosts.push(write.host_id);
                entry.class = write.class;
                entry.countdown = write.countdown;
                entry.modified = tick;
                entry.expires_at = expiry_for(write.countdown);
                Ok(DriveOutcome::success(Vec::new()))
            }
            Opcode::Normal => match locks.get(&resource_id) {
                Some(entry) => Ok(DriveOutcome::success(vec![self.read_record(entry)])),
                None => {
                    let empty = MemLock {
                        class: Class::Exclusive,
                        hosts: Vec::new(),
                        lvb: [0; VALUE_LEN],
                        countdown: 0,
                        modified: 0,
                        expires_at: None,
                    };
                    Ok(DriveOutcome::success(vec![self.read_record(&empty)]))
                }
            },
        }
    }

    fn identify(&self, _drive: &str) -> crate::error::Result<u8> {
        Ok(self.version_byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::transport::{outcome_to_result, DriveCommand};
    use crate::wire::{Class, ResVerType};

    fn host(n: u8) -> [u8; HOST_ID_LEN] {
        let mut h = [0u8; HOST_ID_LEN];
        h[0] = n;
        h
    }

    fn write_rec(resource: [u8; LOCK_ID_LEN], host_id: [u8; HOST_ID_LEN], class: Class, countdown: i64) -> Record {
        Record {
            state: None,
            time_now: 0,
            modified: 0,
            countdown,
            class,
            res_ver_type: ResVerType::NoUpdateNoValid,
            lvb: [0; VALUE_LEN],
            resource_id: resource,
            metadata: [0; crate::wire::METADATA_LEN],
            host_id,
        }
    }

    #[test]
    fn exclusive_trylock_conflicts_for_a_second_host() {
        let drive = MemDrive::new();
        let res = [7u8; LOCK_ID_LEN];

        let cmd1 = DriveCommand::write(Opcode::Trylock, write_rec(res, host(1), Class::Exclusive, 3000));
        let out1 = drive.execute("d0", &cmd1).unwrap();
        assert_eq!(out1.status, DeviceStatus::Success);

        let cmd2 = DriveCommand::write(Opcode::Trylock, write_rec(res, host(2), Class::Exclusive, 3000));
        let out2 = drive.execute("d0", &cmd2).unwrap();
        assert_eq!(out2.status, DeviceStatus::MutexHeldByAnother);
    }

    #[test]
    fn shared_read_locks_can_be_held_concurrently() {
        let drive = MemDrive::new();
        let res = [9u8; LOCK_ID_LEN];

        for h in [1u8, 2, 3] {
            let cmd = DriveCommand::write(
                Opcode::Trylock,
                write_rec(res, host(h), Class::SharedProtectedRead, 3000),
            );
            let out = drive.execute("d0", &cmd).unwrap();
            assert_eq!(out.status, DeviceStatus::Success);
        }
    }

    #[test]
    fn unlock_by_non_holder_is_a_conflict() {
        let drive = MemDrive::new();
        let res = [1u8; LOCK_ID_LEN];
        let lock_cmd = DriveCommand::write(Opcode::Trylock, write_rec(res, host(1), Class::Exclusive, 3000));
        drive.execute("d0", &lock_cmd).unwrap();

        let unlock_cmd = DriveCommand::write(Opcode::Unlock, write_rec(res, host(2), Class::Exclusive, 0));
        let out = drive.execute("d0", &unlock_cmd).unwrap();
        assert_eq!(out.status, DeviceStatus::MutexConflict);
    }

    #[test]
    fn convert_to_exclusive_blocked_while_others_share() {
        let drive = MemDrive::new();
        let res = [3u8; LOCK_ID_LEN];
        for h in [1u8, 2] {
            let cmd = DriveCommand::write(
                Opcode::Trylock,
                write_rec(res, host(h), Class::SharedProtectedRead, 3000),
            );
            drive.execute("d0", &cmd).unwrap();
        }

        let convert = DriveCommand::write(Opcode::Refresh, write_rec(res, host(1), Class::Exclusive, 3000));
        let out = drive.execute("d0", &convert).unwrap();
        assert_eq!(out.status, DeviceStatus::MutexHeldAlready);
    }

    #[test]
    fn break_rejects_a_still_live_holder() {
        let drive = MemDrive::new();
        let res = [4u8; LOCK_ID_LEN];
        let lock_cmd = DriveCommand::write(Opcode::Trylock, write_rec(res, host(1), Class::Exclusive, 3000));
        drive.execute("d0", &lock_cmd).unwrap();

        let brk = DriveCommand::write(Opcode::Break, write_rec(res, host(2), Class::Exclusive, 3000));
        let out = drive.execute("d0", &brk).unwrap();
        assert_eq!(out.status, DeviceStatus::MutexHeldByAnother);

        let read = DriveCommand::read_resource(Opcode::Normal, res, 1);
        let out = drive.execute("d0", &read).unwrap();
        let records = outcome_to_result(out, Opcode::Normal).unwrap();
        assert_eq!(records[0].host_id, host(1));
    }

    #[test]
    fn break_takes_ownership_once_the_holder_expires() {
        let drive = MemDrive::new();
        let res = [5u8; LOCK_ID_LEN];
        let lock_cmd = DriveCommand::write(Opcode::Trylock, write_rec(res, host(1), Class::Exclusive, 10));
        drive.execute("d0", &lock_cmd).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));

        let brk = DriveCommand::write(Opcode::Break, write_rec(res, host(2), Class::Exclusive, 3000));
        let out = drive.execute("d0", &brk).unwrap();
        assert_eq!(out.status, DeviceStatus::Success);

        let read = DriveCommand::read_resource(Opcode::Normal, res, 1);
        let out = drive.execute("d0", &read).unwrap();
        let records = outcome_to_result(out, Opcode::Normal).unwrap();
        assert_eq!(records[0].state, Some(DriveState::Locked));
        assert_eq!(records[0].host_id, host(2));
    }

    #[test]
    fn break_takes_ownership_when_nothing_is_held() {
        let drive = MemDrive::new();
        let res = [6u8; LOCK_ID_LEN];
        let brk = DriveCommand::write(Opcode::Break, write_rec(res, host(2), Class::Exclusive, 3000));
        let out = drive.execute("d0", &brk).unwrap();
        assert_eq!(out.status, DeviceStatus::Success);
    }
}
