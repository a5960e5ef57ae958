//! Component A: pack/unpack the 512-byte per-lock record, byte-swap
//! fields, and map device status to the manager's error taxonomy.

pub mod opcode;
pub mod record;
pub mod status;

pub use opcode::{decode_command_word, Opcode, GROUP_DEFAULT, GROUP_INQUIRY};
pub use record::{Class, DriveState, Record, ResVerType, LOCK_ID_LEN, HOST_ID_LEN, METADATA_LEN, RECORD_SIZE, VALUE_LEN};
pub use status::{map_status, DeviceStatus};

/// Dumps `bytes` as a hex string under `tracing::debug!`, for tracing a
/// raw record on its way to or from a drive around every pass-through
/// command when debug logging is on.
pub fn log_hex(label: &str, bytes: &[u8]) {
    tracing::debug!(%label, hex = %bytes.iter().map(|b| format!("{b:02x}")).collect::<String>());
}
