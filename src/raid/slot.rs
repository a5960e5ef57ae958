//! Per-drive slot bookkeeping for one lock (spec section 4.E "state
//! machine"), plus the drive-list sort/dedup invariant from `lock.c`'s
//! `ilm_sort_drives`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveSlotState {
    NoAccess,
    Accessed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DriveSlot {
    pub path: String,
    pub uuid: [u8; 16],
    pub state: DriveSlotState,
}

impl DriveSlot {
    pub fn new(path: impl Into<String>, uuid: [u8; 16]) -> Self {
        DriveSlot {
            path: path.into(),
            uuid,
            state: DriveSlotState::NoAccess,
        }
    }
}

/// Sorts drive slots by UUID ascending and removes duplicate paths,
/// keeping the first occurrence. Matches `lock.c`'s `ilm_sort_drives`
/// insertion sort followed by a duplicate-path pass (invariant 1, spec
/// section 3).
pub fn sort_and_dedup_drives(drives: &mut Vec<DriveSlot>) {
    drives.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    let mut seen = std::collections::HashSet::new();
    drives.retain(|d| seen.insert(d.path.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_by_uuid_and_drops_duplicate_paths() {
        let mut drives = vec![
            DriveSlot::new("/dev/sdc", [3; 16]),
            DriveSlot::new("/dev/sda", [1; 16]),
            DriveSlot::new("/dev/sda", [1; 16]),
            DriveSlot::new("/dev/sdb", [2; 16]),
        ];
        sort_and_dedup_drives(&mut drives);
        let paths: Vec<_> = drives.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["/dev/sda", "/dev/sdb", "/dev/sdc"]);
    }
}
