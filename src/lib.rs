#![no_std]
#![allow(dead_code)]

//! Channel Sounding control plane for a BLE link layer.
//!
//! [`CsManager`] validates host requests, runs the control procedures that keep both controllers
//! of a connection in sync, and reports completions through an event queue. Control PDUs to send
//! are taken from [`CsManager::next_control_packet`], and PDUs received from the peer are fed to
//! [`CsManager::on_control_pdu`].

mod fmt;

mod codec;
mod cursor;
mod database;

pub mod config;
pub mod control;
pub mod manager;
pub mod scheduler;
pub mod time;
pub mod types;

pub use control::{ControlPacket, ControlProcedure};
pub use database::ConnectionStorage;
pub use manager::{CsEvent, CsManager, CsResources, CsSettings};
pub use scheduler::{RadioScheduler, SchedulerHandle};
pub use time::Timer;
pub use types::security::SecurityModule;

/// Channel Sounding errors.
///
/// Every variant maps onto the HCI status code reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The connection handle does not refer to an active connection.
    InactiveConnection,
    /// Channel Sounding or a sub-feature is not supported locally or by the peer.
    FeatureNotSupported,
    /// A parameter is out of range or refers to something that does not exist.
    UnexpectedParameter,
    /// The request is not allowed in the current state.
    CommandDisallowed,
    /// Out of slots or queue space.
    InsufficientResources,
    /// The connection went away while a procedure was outstanding.
    ConnectionTerminated,
    /// The peer rejected a procedure with a status outside the variants above.
    Rejected(u8),
    /// A control PDU could not be encoded or decoded.
    Codec(codec::Error),
}

impl Error {
    /// Interpret a status code received from the peer.
    pub fn from_status(status: u8) -> Self {
        match status {
            0x02 => Self::InactiveConnection,
            0x11 | 0x1A => Self::FeatureNotSupported,
            0x12 | 0x1E => Self::UnexpectedParameter,
            0x0C => Self::CommandDisallowed,
            0x07 => Self::InsufficientResources,
            0x16 => Self::ConnectionTerminated,
            other => Self::Rejected(other),
        }
    }
}

impl From<Error> for u8 {
    fn from(error: Error) -> u8 {
        match error {
            Error::InactiveConnection => 0x02,
            Error::FeatureNotSupported => 0x11,
            Error::UnexpectedParameter => 0x12,
            Error::CommandDisallowed => 0x0C,
            Error::InsufficientResources => 0x07,
            Error::ConnectionTerminated => 0x16,
            Error::Rejected(status) => status,
            Error::Codec(_) => 0x12,
        }
    }
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        Self::Codec(error)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InactiveConnection => write!(f, "Unknown connection identifier"),
            Error::FeatureNotSupported => write!(f, "Unsupported feature or parameter value"),
            Error::UnexpectedParameter => write!(f, "Invalid parameters"),
            Error::CommandDisallowed => write!(f, "Command disallowed"),
            Error::InsufficientResources => write!(f, "Memory capacity exceeded"),
            Error::ConnectionTerminated => write!(f, "Connection terminated by local host"),
            Error::Rejected(status) => write!(f, "Rejected by peer ({:#04x})", status),
            Error::Codec(e) => write!(f, "Malformed control PDU ({:?})", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip_through_peer() {
        for error in [
            Error::InactiveConnection,
            Error::FeatureNotSupported,
            Error::UnexpectedParameter,
            Error::CommandDisallowed,
            Error::InsufficientResources,
            Error::ConnectionTerminated,
            Error::Rejected(0x3B),
        ] {
            assert_eq!(Error::from_status(error.into()), error);
        }
        assert_eq!(Error::from_status(0x1A), Error::FeatureNotSupported);
        assert_eq!(u8::from(Error::Codec(codec::Error::InvalidValue)), 0x12);
    }
}
