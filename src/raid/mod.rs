//! Component E: the RAID lock engine. Turns per-drive IDM operations
//! (component B) into quorum-correct acquire/release/convert/renew/break/
//! LVB operations over a lock's whole drive set. Grounded in
//! `raid_lock.c`.

pub mod engine;
pub mod slot;

pub use engine::RaidEngine;
pub use slot::{sort_and_dedup_drives, DriveSlot, DriveSlotState};
