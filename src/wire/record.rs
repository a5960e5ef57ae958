//! The 512-byte per-lock record exchanged with drive firmware (spec
//! section "DATA MODEL"). Field widths and ordering follow the vendor
//! read/write record layouts in `idm_nvme.h` (`_idmReadData` /
//! `_idmWriteData`); the manager keeps a single in-memory `Record` and
//! serializes it differently depending on direction.

pub const RECORD_SIZE: usize = 512;
pub const LOCK_ID_LEN: usize = 64;
pub const HOST_ID_LEN: usize = 32;
pub const METADATA_LEN: usize = 64;
pub const VALUE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum DriveState {
    Uninit = 0,
    Locked = 0x101,
    Unlocked = 0x102,
    MultipleLocked = 0x103,
    Timeout = 0x104,
    Dead = 0xdead,
}

impl DriveState {
    pub fn from_u64(v: u64) -> Option<Self> {
        use DriveState::*;
        match v {
            0 => Some(Uninit),
            0x101 => Some(Locked),
            0x102 => Some(Unlocked),
            0x103 => Some(MultipleLocked),
            0x104 => Some(Timeout),
            0xdead => Some(Dead),
            _ => None,
        }
    }
}

/// Wire-level mutex class. Only `Exclusive` and `SharedProtectedRead` are
/// ever issued by this core; observing `ProtectedWrite` on read-back is a
/// hard error (spec section "DATA MODEL").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Class {
    Exclusive = 0,
    ProtectedWrite = 1,
    SharedProtectedRead = 2,
}

impl Class {
    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(Class::Exclusive),
            1 => Some(Class::ProtectedWrite),
            2 => Some(Class::SharedProtectedRead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResVerType {
    NoUpdateNoValid = 0,
    UpdateNoValid = 1,
    UpdateValid = 2,
    Invalid = 3,
}

impl ResVerType {
    pub fn from_u8(v: u8) -> Self {
        match v & 0x3 {
            0 => ResVerType::NoUpdateNoValid,
            1 => ResVerType::UpdateNoValid,
            2 => ResVerType::UpdateValid,
            _ => ResVerType::Invalid,
        }
    }
}

/// In-memory view of one per-lock record. `time_now` is only meaningful
/// when building a record to write; `state` and `modified` are only
/// meaningful on a record parsed from a read.
#[derive(Debug, Clone)]
pub struct Record {
    pub state: Option<DriveState>,
    pub time_now: u64,
    pub modified: u64,
    pub countdown: i64,
    pub class: Class,
    pub res_ver_type: ResVerType,
    pub lvb: [u8; VALUE_LEN],
    pub resource_id: [u8; LOCK_ID_LEN],
    pub metadata: [u8; METADATA_LEN],
    pub host_id: [u8; HOST_ID_LEN],
}

fn reverse(buf: &[u8]) -> Vec<u8> {
    buf.iter().rev().copied().collect()
}

impl Record {
    /// Serializes a write record: `{ignored0(8), time_now(8), countdown(8),
    /// class(8), resource_ver(8), rsvd0(24), resource_id(64), metadata(64),
    /// host_id(32), rsvd1(32), ignored1(256)}`, 512 bytes total.
    pub fn pack_write(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        let mut off = 0;

        buf[off..off + 8].copy_from_slice(&0u64.to_be_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.time_now.to_be_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&(self.countdown as u64).to_be_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&(self.class as u64).to_be_bytes());
        off += 8;

        // LVB is byte-reversed into resource_ver, then byte 0 is
        // overwritten with the res_ver_type tag (clobbering the first
        // reversed LVB byte) -- matches `idm_scsi.c`'s `_scsi_xfer_sync`.
        let rev_lvb = reverse(&self.lvb);
        buf[off..off + VALUE_LEN].copy_from_slice(&rev_lvb);
        buf[off] = self.res_ver_type as u8;
        off += VALUE_LEN;

        off += 24; // rsvd0

        buf[off..off + LOCK_ID_LEN].copy_from_slice(&reverse(&self.resource_id));
        off += LOCK_ID_LEN;
        buf[off..off + METADATA_LEN].copy_from_slice(&reverse(&self.metadata));
        off += METADATA_LEN;
        buf[off..off + HOST_ID_LEN].copy_from_slice(&reverse(&self.host_id));
        off += HOST_ID_LEN;

        debug_assert_eq!(off + 32 + 256, RECORD_SIZE);
        buf
    }

    /// Parses one 512-byte read record: `{state(8), modified(8),
    /// countdown(8), class(8), resource_ver(8), rsvd0(24), resource_id(64),
    /// metadata(64), host_id(32), rsvd1(32), rsvd2(256)}`.
    pub fn parse_read(buf: &[u8; RECORD_SIZE]) -> Self {
        let mut off = 0;
        let state_raw = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let modified = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let countdown = i64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let class_raw = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;

        let res_ver_type = ResVerType::from_u8(buf[off]);
        let mut rev_ver = [0u8; VALUE_LEN];
        rev_ver.copy_from_slice(&buf[off..off + VALUE_LEN]);
        let lvb: [u8; VALUE_LEN] = reverse(&rev_ver).try_into().unwrap();
        off += VALUE_LEN;

        off += 24; // rsvd0

        let resource_id: [u8; LOCK_ID_LEN] =
            reverse(&buf[off..off + LOCK_ID_LEN]).try_into().unwrap();
        off += LOCK_ID_LEN;
        let metadata: [u8; METADATA_LEN] =
            reverse(&buf[off..off + METADATA_LEN]).try_into().unwrap();
        off += METADATA_LEN;
        let host_id: [u8; HOST_ID_LEN] =
            reverse(&buf[off..off + HOST_ID_LEN]).try_into().unwrap();

        Record {
            state: DriveState::from_u64(state_raw),
            time_now: 0,
            modified,
            countdown,
            class: Class::from_u64(class_raw).unwrap_or(Class::Exclusive),
            res_ver_type,
            lvb,
            resource_id,
            metadata,
            host_id,
        }
    }

    /// Parses up to `num_records` consecutive 512-byte records out of a
    /// larger read buffer (component A's `deserialize ... K consecutive
    /// records` contract).
    pub fn parse_many(buf: &[u8], num_records: usize) -> Vec<Record> {
        buf.chunks_exact(RECORD_SIZE)
            .take(num_records)
            .map(|chunk| {
                let arr: [u8; RECORD_SIZE] = chunk.try_into().unwrap();
                Record::parse_read(&arr)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record {
            state: None,
            time_now: 1_700_000_000_000,
            modified: 0,
            countdown: 3000,
            class: Class::Exclusive,
            res_ver_type: ResVerType::UpdateValid,
            lvb: *b"ABCDEFGH",
            resource_id: [0x11; LOCK_ID_LEN],
            metadata: [0x22; METADATA_LEN],
            host_id: [0x33; HOST_ID_LEN],
        }
    }

    #[test]
    fn pack_is_512_bytes() {
        assert_eq!(sample().pack_write().len(), RECORD_SIZE);
    }

    #[test]
    fn resource_id_round_trips_through_reversal() {
        let rec = sample();
        let packed = rec.pack_write();
        // A write record uses the write-struct layout; simulate a device
        // that echoes it back as a read record by reparsing with
        // parse_read (offsets line up because both layouts share the
        // trailing id/metadata/host fields at the same offsets).
        let parsed = Record::parse_read(&packed);
        assert_eq!(parsed.resource_id, rec.resource_id);
        assert_eq!(parsed.metadata, rec.metadata);
        assert_eq!(parsed.host_id, rec.host_id);
    }

    #[test]
    fn countdown_and_class_round_trip() {
        let rec = sample();
        let packed = rec.pack_write();
        let parsed = Record::parse_read(&packed);
        assert_eq!(parsed.countdown, rec.countdown);
        assert_eq!(parsed.class, rec.class);
    }

    #[test]
    fn res_ver_type_tag_round_trips() {
        let rec = sample();
        let packed = rec.pack_write();
        let parsed = Record::parse_read(&packed);
        assert_eq!(parsed.res_ver_type, rec.res_ver_type);
    }

    #[test]
    fn drive_state_unknown_value_is_none() {
        assert!(DriveState::from_u64(0xbad).is_none());
        assert_eq!(DriveState::from_u64(0x101), Some(DriveState::Locked));
    }
}
