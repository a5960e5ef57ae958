//! Components B-D: per-drive transport, the async command substrate, and
//! the drive-to-pool registry.

pub mod async_pool;
pub mod linux;
pub mod mem;
pub mod registry;
pub mod transport;

pub use mem::MemDrive;
pub use registry::DriveRegistry;
pub use transport::{DriveCommand, DriveOutcome, DriveTransport};

#[cfg(target_os = "linux")]
pub use linux::LinuxPassthroughDrive;
