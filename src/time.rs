//! Clock source for the CS manager.

use embassy_time::Instant;

/// Monotonic clock injected by the controller.
///
/// The manager only reads it when the host updates the channel classification, to tell how long
/// it has been since the previous update.
pub trait Timer {
    /// Current time. Must not go backwards.
    fn now(&self) -> Instant;
}

impl<T: Timer + ?Sized> Timer for &T {
    fn now(&self) -> Instant {
        T::now(self)
    }
}
