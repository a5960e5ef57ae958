//! Error taxonomy shared by the wire codec, drive transport, RAID engine
//! and client dispatcher (spec section "ERROR HANDLING DESIGN").

use thiserror::Error;

/// The kinds of failure the manager can report. Per-drive failures never
/// reach a caller directly; they feed the quorum tally in the RAID engine,
/// which distills them down to one of these per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad argument, malformed frame, unsupported mode, wrong payload size.
    Invalid,
    /// No matching lock / host on the drive, or LBA out of range.
    NotFound,
    /// Quorum blocked by another host; acquire cannot proceed without a break.
    Busy,
    /// This host is already present; caller should retry after unlock.
    TryAgain,
    /// This host's membership lapsed; caller must re-acquire.
    Expired,
    /// Firmware reports mutex-held-already on a refresh-shaped op.
    PermissionDenied,
    /// Drive-side list full, or host allocation failed.
    OutOfMemory,
    /// Transport failure, or an explicit fault-injection hit.
    Io,
    /// The 5s quorum deadline was exceeded.
    Timeout,
}

impl ErrorKind {
    /// Maps to `-errno`-shaped integers for `MsgHeader.result` (spec section 6/7).
    pub fn to_errno(self) -> i32 {
        use ErrorKind::*;
        match self {
            Invalid => -libc::EINVAL,
            NotFound => -libc::ENOENT,
            Busy => -libc::EBUSY,
            TryAgain => -libc::EAGAIN,
            Expired => -libc::ETIME,
            PermissionDenied => -libc::EPERM,
            OutOfMemory => -libc::ENOMEM,
            Io => -libc::EIO,
            Timeout => -libc::ETIMEDOUT,
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, e.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::new(ErrorKind::Io, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
