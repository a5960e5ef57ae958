//! Wire framing for the client control protocol (spec section 6
//! "EXTERNAL INTERFACES"). All multi-byte integers are little-endian on
//! the wire -- unlike the per-drive record format in `wire::record`,
//! which is big-endian and byte-reversed. Grounded in `client.h`'s
//! `struct ilm_msg_header` and `lock.h`'s `struct ilm_lock_payload`.

use crate::error::{Error, ErrorKind, Result};
use crate::wire::LOCK_ID_LEN;

pub const MSG_MAGIC: u32 = 0x494C_4D00;
pub const LOCK_MAGIC: u32 = 0x4C4F_434B;

/// Maximum length of one drive path string in a framed request,
/// matching the POSIX `PATH_MAX` the source embeds per-drive paths at.
pub const PATH_MAX: usize = 4096;

/// `{magic, cmd, length, result}`, 16 bytes, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub cmd: u32,
    /// Length in bytes of the payload that follows this header.
    pub length: u32,
    /// `0` on success, `-errno` on failure (spec section 6/7).
    pub result: i32,
}

impl MsgHeader {
    pub const SIZE: usize = 16;

    pub fn request(cmd: u32, length: u32) -> Self {
        MsgHeader { cmd, length, result: 0 }
    }

    pub fn reply(cmd: u32, length: u32, result: i32) -> Self {
        MsgHeader { cmd, length, result }
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&MSG_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.cmd.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.result.to_le_bytes());
        buf
    }

    pub fn parse(buf: &[u8; Self::SIZE]) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MSG_MAGIC {
            return Err(Error::new(ErrorKind::Invalid, format!("bad message magic {magic:#x}")));
        }
        Ok(MsgHeader {
            cmd: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            length: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            result: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// `{magic, mode, drive_num, lock_id[64], timeout_ms, quiescent}`, 84
/// bytes, followed by `drive_num` `PATH_MAX`-byte path strings.
#[derive(Debug, Clone)]
pub struct LockPayload {
    pub mode: u32,
    pub drive_num: u32,
    pub lock_id: [u8; LOCK_ID_LEN],
    pub timeout_ms: i32,
    pub quiescent: i32,
}

impl LockPayload {
    pub const SIZE: usize = 4 + 4 + 4 + LOCK_ID_LEN + 4 + 4;

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&LOCK_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.drive_num.to_le_bytes());
        buf.extend_from_slice(&self.lock_id);
        buf.extend_from_slice(&self.timeout_ms.to_le_bytes());
        buf.extend_from_slice(&self.quiescent.to_le_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::new(ErrorKind::Invalid, "lock payload too short"));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != LOCK_MAGIC {
            return Err(Error::new(ErrorKind::Invalid, format!("bad lock payload magic {magic:#x}")));
        }
        let mode = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let drive_num = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let mut lock_id = [0u8; LOCK_ID_LEN];
        lock_id.copy_from_slice(&buf[12..12 + LOCK_ID_LEN]);
        let off = 12 + LOCK_ID_LEN;
        let timeout_ms = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let quiescent = i32::from_le_bytes(buf[off + 4..off + 8].try_into().unwrap());
        Ok(LockPayload {
            mode,
            drive_num,
            lock_id,
            timeout_ms,
            quiescent,
        })
    }
}

/// Packs `paths` as `PATH_MAX`-byte, nul-padded, fixed-width strings.
pub fn pack_drive_paths(paths: &[String]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(paths.len() * PATH_MAX);
    for path in paths {
        if path.len() >= PATH_MAX {
            return Err(Error::new(ErrorKind::Invalid, "drive path exceeds PATH_MAX"));
        }
        let mut slot = vec![0u8; PATH_MAX];
        slot[..path.len()].copy_from_slice(path.as_bytes());
        buf.extend_from_slice(&slot);
    }
    Ok(buf)
}

/// Parses `count` fixed-width `PATH_MAX`-byte drive path strings out of
/// `buf`.
pub fn parse_drive_paths(buf: &[u8], count: usize) -> Result<Vec<String>> {
    if buf.len() < count * PATH_MAX {
        return Err(Error::new(ErrorKind::Invalid, "drive path list too short"));
    }
    let mut paths = Vec::with_capacity(count);
    for i in 0..count {
        let slot = &buf[i * PATH_MAX..(i + 1) * PATH_MAX];
        let nul = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
        let path = std::str::from_utf8(&slot[..nul])
            .map_err(|_| Error::new(ErrorKind::Invalid, "drive path is not valid UTF-8"))?;
        paths.push(path.to_string());
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_header_round_trips() {
        let h = MsgHeader::request(3, 84);
        let packed = h.pack();
        let parsed = MsgHeader::parse(&packed).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn msg_header_rejects_bad_magic() {
        let mut buf = MsgHeader::request(0, 0).pack();
        buf[0] = 0;
        assert_eq!(MsgHeader::parse(&buf).unwrap_err().kind, ErrorKind::Invalid);
    }

    #[test]
    fn lock_payload_round_trips() {
        let payload = LockPayload {
            mode: 1,
            drive_num: 2,
            lock_id: [7; LOCK_ID_LEN],
            timeout_ms: 3000,
            quiescent: 0,
        };
        let packed = payload.pack();
        let parsed = LockPayload::parse(&packed).unwrap();
        assert_eq!(parsed.mode, payload.mode);
        assert_eq!(parsed.drive_num, payload.drive_num);
        assert_eq!(parsed.lock_id, payload.lock_id);
        assert_eq!(parsed.timeout_ms, payload.timeout_ms);
    }

    #[test]
    fn drive_paths_round_trip() {
        let paths = vec!["/dev/sda".to_string(), "/dev/sdb".to_string()];
        let packed = pack_drive_paths(&paths).unwrap();
        let parsed = parse_drive_paths(&packed, paths.len()).unwrap();
        assert_eq!(parsed, paths);
    }
}
