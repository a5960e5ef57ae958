//! Device status -> error kind mapping (spec section 4.A). Exhaustive over
//! the statuses the firmware can report; anything else maps to `Invalid`.

use crate::error::ErrorKind;
use crate::wire::opcode::Opcode;

/// Device-class-specific status codes (SCSI sense / NVMe status both map
/// into this set before the table below is applied).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Success,
    /// SCSI: Reservation Conflict. NVMe: 0xC9.
    MutexConflict,
    /// SCSI: Terminated. NVMe: 0xCA.
    MutexHeldAlready,
    /// SCSI: Busy. NVMe: 0xCB.
    MutexHeldByAnother,
    LbaOutOfRange,
    MutexListFull,
    HostListFull,
    MutexHostListFull,
    InvalidOpcode,
    /// Transport-level failure (couldn't even talk to the device).
    DeviceIoError,
}

/// Maps a `(status, opcode)` pair to the manager's error taxonomy. The
/// mapping is opcode-dependent for the three mutex statuses: a `Refresh`
/// (renew/convert) reports different kinds from an `Unlock`, which in turn
/// differs from every other opcode. This exactly mirrors the status table
/// in spec section 4.A.
pub fn map_status(status: DeviceStatus, opcode: Opcode) -> ErrorKind {
    use DeviceStatus::*;
    use ErrorKind::*;

    match status {
        Success => unreachable!("caller must special-case success before mapping"),
        MutexConflict => match opcode {
            Opcode::Refresh => Expired,
            Opcode::Unlock => NotFound,
            _ => Busy,
        },
        MutexHeldAlready => match opcode {
            Opcode::Refresh => PermissionDenied,
            Opcode::Unlock => Invalid,
            _ => TryAgain,
        },
        MutexHeldByAnother => Busy,
        LbaOutOfRange => NotFound,
        MutexListFull | HostListFull | MutexHostListFull => OutOfMemory,
        InvalidOpcode => Invalid,
        DeviceIoError => Io,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_conflict_depends_on_opcode() {
        assert_eq!(map_status(DeviceStatus::MutexConflict, Opcode::Refresh), ErrorKind::Expired);
        assert_eq!(map_status(DeviceStatus::MutexConflict, Opcode::Unlock), ErrorKind::NotFound);
        assert_eq!(map_status(DeviceStatus::MutexConflict, Opcode::Trylock), ErrorKind::Busy);
    }

    #[test]
    fn mutex_held_already_depends_on_opcode() {
        assert_eq!(map_status(DeviceStatus::MutexHeldAlready, Opcode::Refresh), ErrorKind::PermissionDenied);
        assert_eq!(map_status(DeviceStatus::MutexHeldAlready, Opcode::Unlock), ErrorKind::Invalid);
        assert_eq!(map_status(DeviceStatus::MutexHeldAlready, Opcode::Lock), ErrorKind::TryAgain);
    }

    #[test]
    fn mutex_held_by_another_is_always_busy() {
        for op in [Opcode::Refresh, Opcode::Unlock, Opcode::Trylock, Opcode::Break] {
            assert_eq!(map_status(DeviceStatus::MutexHeldByAnother, op), ErrorKind::Busy);
        }
    }

    #[test]
    fn list_full_variants_map_to_out_of_memory() {
        for s in [DeviceStatus::MutexListFull, DeviceStatus::HostListFull, DeviceStatus::MutexHostListFull] {
            assert_eq!(map_status(s, Opcode::Lock), ErrorKind::OutOfMemory);
        }
    }
}
