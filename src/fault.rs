//! Component I: process-wide fault injection. Every externally triggered
//! entry point checks [`FaultInjector::is_hit`] first and, on a hit,
//! short-circuits with `ErrorKind::Io` before touching any drive.
//!
//! Grounded in `inject_fault.c`'s `ilm_inject_fault_set_percentage`/
//! `ilm_inject_fault_is_hit`, but the hit test itself is pseudo-random
//! (spec section 4.I) rather than the source's deterministic step
//! counter -- a step counter makes the *same* calls always fault on the
//! same calls, which is a poor match for "pseudo-random p% of calls".

use std::sync::atomic::{AtomicU8, Ordering};

use rand::Rng;

use crate::error::{Error, ErrorKind, Result};

/// Shared fault-injection switch. One instance per daemon process;
/// cheap to clone (an `Arc` around an atomic) so every lockspace and the
/// dispatcher can hold a handle.
#[derive(Debug)]
pub struct FaultInjector {
    percentage: AtomicU8,
}

impl Default for FaultInjector {
    fn default() -> Self {
        FaultInjector {
            percentage: AtomicU8::new(0),
        }
    }
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hit percentage. `0..=100`; anything else is `Invalid`.
    pub fn set_percentage(&self, percentage: i32) -> Result<()> {
        if !(0..=100).contains(&percentage) {
            return Err(Error::new(ErrorKind::Invalid, format!("fault percentage out of range: {percentage}")));
        }
        self.percentage.store(percentage as u8, Ordering::SeqCst);
        Ok(())
    }

    pub fn percentage(&self) -> u8 {
        self.percentage.load(Ordering::SeqCst)
    }

    /// Returns true on a pseudo-random `percentage()`% of calls. `0`
    /// never hits, `100` always hits.
    pub fn is_hit(&self) -> bool {
        let p = self.percentage();
        match p {
            0 => false,
            100 => true,
            p => rand::thread_rng().gen_range(0..100) < p as u32,
        }
    }

    /// Convenience guard for entry points: returns `Err(Io)` on a hit,
    /// `Ok(())` otherwise.
    pub fn check(&self) -> Result<()> {
        if self.is_hit() {
            Err(Error::new(ErrorKind::Io, "fault injection hit"))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_percent_never_hits() {
        let f = FaultInjector::new();
        f.set_percentage(0).unwrap();
        for _ in 0..100 {
            assert!(!f.is_hit());
        }
    }

    #[test]
    fn hundred_percent_always_hits() {
        let f = FaultInjector::new();
        f.set_percentage(100).unwrap();
        for _ in 0..100 {
            assert!(f.is_hit());
        }
    }

    #[test]
    fn out_of_range_percentage_is_invalid() {
        let f = FaultInjector::new();
        assert_eq!(f.set_percentage(101).unwrap_err().kind, ErrorKind::Invalid);
        assert_eq!(f.set_percentage(-1).unwrap_err().kind, ErrorKind::Invalid);
    }

    #[test]
    fn check_short_circuits_with_io_on_a_hit() {
        let f = FaultInjector::new();
        f.set_percentage(100).unwrap();
        assert_eq!(f.check().unwrap_err().kind, ErrorKind::Io);
    }
}
