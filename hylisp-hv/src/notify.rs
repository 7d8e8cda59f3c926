//! Wake-up signaling for the map-event multiplexer.
//!
//! The multiplexer owns its wait set, so other threads never touch it. They
//! write to an eventfd instead; the multiplexer keeps the eventfd in slot 0
//! of its wait set and rebuilds the set when it becomes readable.

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::os::fd::{AsFd, BorrowedFd};
use tracing::warn;

/// Non-blocking eventfd shared between the registration service and the
/// multiplexer.
#[derive(Debug)]
pub struct Notifier {
    eventfd: EventFd,
}

impl Notifier {
    /// Create a new notifier with a zero counter.
    pub fn new() -> std::io::Result<Self> {
        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)?;
        Ok(Notifier { eventfd })
    }

    /// Signal the multiplexer that the registry changed.
    ///
    /// Signals coalesce; a failed write is logged and otherwise ignored.
    pub fn signal(&self) {
        if let Err(e) = self.eventfd.write(1) {
            warn!(error = %e, "Failed to signal multiplexer");
        }
    }

    /// Reset the counter. Returns how many signals were pending.
    pub fn drain(&self) -> u64 {
        match self.eventfd.read() {
            Ok(count) => count,
            Err(Errno::EAGAIN) => 0,
            Err(e) => {
                warn!(error = %e, "Failed to drain notifier");
                0
            }
        }
    }
}

impl AsFd for Notifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.eventfd.as_fd()
    }
}
