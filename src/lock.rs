//! Component F: the lock object. Holds identity, requested mode,
//! timeout, cached LVB, the per-drive state vector, and the
//! `convert_failed` sticky flag. Grounded in `lock.c`/`lock.h`'s `struct
//! ilm_lock`.

use crate::raid::slot::DriveSlot;
use crate::wire::{LOCK_ID_LEN, HOST_ID_LEN, VALUE_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Unlocked,
    Exclusive,
    Shareable,
}

/// One lock's full state. Lockspace owns a `HashMap<[u8; LOCK_ID_LEN],
/// Mutex<Lock>>` so mutation of one lock never blocks another (spec
/// section 5 "Shared-resource policy").
#[derive(Debug, Clone)]
pub struct Lock {
    pub id: [u8; LOCK_ID_LEN],
    pub host_id: [u8; HOST_ID_LEN],
    pub mode: LockMode,
    pub timeout_ms: i64,
    pub lvb: [u8; VALUE_LEN],
    pub convert_failed: bool,
    pub drives: Vec<DriveSlot>,
}

impl Lock {
    pub fn new(id: [u8; LOCK_ID_LEN], host_id: [u8; HOST_ID_LEN], timeout_ms: i64, drives: Vec<DriveSlot>) -> Self {
        let mut drives = drives;
        crate::raid::slot::sort_and_dedup_drives(&mut drives);
        Lock {
            id,
            host_id,
            mode: LockMode::Unlocked,
            timeout_ms,
            lvb: [0; VALUE_LEN],
            convert_failed: false,
            drives,
        }
    }

    pub fn drive_count(&self) -> usize {
        self.drives.len()
    }

    /// Majority quorum threshold for this lock's drive set.
    pub fn quorum(&self) -> usize {
        self.drives.len() / 2 + 1
    }

    pub fn accessed_count(&self) -> usize {
        self.drives
            .iter()
            .filter(|d| d.state == crate::raid::slot::DriveSlotState::Accessed)
            .count()
    }

    pub fn is_granted(&self) -> bool {
        self.mode != LockMode::Unlocked && self.accessed_count() >= self.quorum()
    }

    /// Human-readable diagnostic dump (spec section 4.F).
    pub fn dump(&self) -> String {
        format!(
            "lock id={:02x?} host={:02x?} mode={:?} timeout_ms={} convert_failed={} accessed={}/{} drives=[{}]",
            &self.id[..8],
            &self.host_id[..8],
            self.mode,
            self.timeout_ms,
            self.convert_failed,
            self.accessed_count(),
            self.drives.len(),
            self.drives
                .iter()
                .map(|d| format!("{}:{:?}", d.path, d.state))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raid::slot::DriveSlot;

    #[test]
    fn quorum_is_strict_majority() {
        let lock = Lock::new(
            [0; LOCK_ID_LEN],
            [0; HOST_ID_LEN],
            3000,
            vec![DriveSlot::new("/dev/sda", [1; 16]), DriveSlot::new("/dev/sdb", [2; 16])],
        );
        assert_eq!(lock.quorum(), 2);

        let lock = Lock::new(
            [0; LOCK_ID_LEN],
            [0; HOST_ID_LEN],
            3000,
            vec![
                DriveSlot::new("/dev/sda", [1; 16]),
                DriveSlot::new("/dev/sdb", [2; 16]),
                DriveSlot::new("/dev/sdc", [3; 16]),
            ],
        );
        assert_eq!(lock.quorum(), 2);
    }

    #[test]
    fn new_lock_is_not_granted() {
        let lock = Lock::new([0; LOCK_ID_LEN], [0; HOST_ID_LEN], 3000, vec![DriveSlot::new("/dev/sda", [1; 16])]);
        assert!(!lock.is_granted());
    }
}
