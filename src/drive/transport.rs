//! Component B: per-drive IDM transport. Issues a single IDM command to
//! one drive, synchronously or via the async substrate (component C).

use std::time::Duration;

use crate::error::{Error, Result};
use crate::wire::{DeviceStatus, Opcode, Record, GROUP_DEFAULT};

/// Default device pass-through timeout (spec section 4.B).
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(15);

/// Byte offset of the vendor IDM-spec-version field (spec section 4.B:
/// "reads vendor byte 1023").
pub const VERSION_BYTE_OFFSET: usize = 1023;
/// Minimum vendor byte value that counts as IDM support.
pub const MIN_IDM_VERSION: u8 = 0x10;

/// A single command issued to one drive: an opcode + mutex group, an
/// optional record to write, and how many records to read back.
///
/// On a real drive a read is addressed by LBA slot, not by content; the
/// manager always knows which lock it's reading, so reads also carry the
/// resource id as addressing context for backends (like [`crate::drive::mem::MemDrive`])
/// that key records by content instead of LBA.
#[derive(Debug, Clone)]
pub struct DriveCommand {
    pub opcode: Opcode,
    pub group: u8,
    pub write_record: Option<Record>,
    pub num_records: usize,
    pub resource_id: Option<[u8; crate::wire::LOCK_ID_LEN]>,
}

impl DriveCommand {
    pub fn write(opcode: Opcode, record: Record) -> Self {
        DriveCommand {
            opcode,
            group: GROUP_DEFAULT,
            resource_id: Some(record.resource_id),
            write_record: Some(record),
            num_records: 0,
        }
    }

    pub fn read(opcode: Opcode, group: u8, num_records: usize) -> Self {
        DriveCommand {
            opcode,
            group,
            write_record: None,
            num_records,
            resource_id: None,
        }
    }

    pub fn read_resource(opcode: Opcode, resource_id: [u8; crate::wire::LOCK_ID_LEN], num_records: usize) -> Self {
        DriveCommand {
            opcode,
            group: GROUP_DEFAULT,
            write_record: None,
            num_records,
            resource_id: Some(resource_id),
        }
    }
}

/// The raw outcome of one pass-through command: a device status plus any
/// records the read side returned.
#[derive(Debug, Clone)]
pub struct DriveOutcome {
    pub status: DeviceStatus,
    pub records: Vec<Record>,
}

impl DriveOutcome {
    pub fn success(records: Vec<Record>) -> Self {
        DriveOutcome {
            status: DeviceStatus::Success,
            records,
        }
    }

    pub fn failure(status: DeviceStatus) -> Self {
        DriveOutcome {
            status,
            records: Vec::new(),
        }
    }
}

/// Converts a `(DriveOutcome, Opcode)` pair into the manager's `Result`,
/// applying the status table in spec section 4.A. `Success` always maps
/// to `Ok`.
pub fn outcome_to_result(outcome: DriveOutcome, opcode: Opcode) -> Result<Vec<Record>> {
    if outcome.status == DeviceStatus::Success {
        return Ok(outcome.records);
    }
    let kind = crate::wire::map_status(outcome.status, opcode);
    Err(Error::new(
        kind,
        format!("drive returned {:?} for opcode {}", outcome.status, opcode.name()),
    ))
}

/// Issues a single pass-through command to one drive and returns a raw
/// device status, or opens/closes the device around it. Implementations
/// own the device handle lifetime (open -> issue -> close on every exit
/// path) so no dedicated resource-release API is exposed here.
pub trait DriveTransport: Send + Sync {
    /// Execute one command synchronously against `drive`.
    fn execute(&self, drive: &str, cmd: &DriveCommand) -> Result<DriveOutcome>;

    /// Reads the raw vendor version byte at offset 1023 of the inquiry
    /// page. Callers use [`read_version`] for the lossy sentinel contract.
    fn identify(&self, drive: &str) -> Result<u8>;
}

/// Deliberately lossy version probe (spec section 4.B design note):
/// returns `0x100` iff the device byte is `>= MIN_IDM_VERSION`, else `0`.
/// Do not "fix" this to return the real version -- higher layers depend
/// on the sentinel.
pub fn read_version(transport: &dyn DriveTransport, drive: &str) -> Result<u32> {
    let byte = transport.identify(drive)?;
    if byte >= MIN_IDM_VERSION {
        Ok(0x100)
    } else {
        Ok(0)
    }
}

/// Reads the inquiry-group (`group = 0xFF`) mutex count for a drive.
pub fn mutex_count(transport: &dyn DriveTransport, drive: &str) -> Result<u64> {
    let cmd = DriveCommand::read(Opcode::Normal, crate::wire::GROUP_INQUIRY, 1);
    let outcome = transport.execute(drive, &cmd)?;
    let records = outcome_to_result(outcome, Opcode::Normal)?;
    Ok(records.first().map(|r| r.countdown as u64).unwrap_or(0))
}
