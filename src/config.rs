//! Compile-time configuration.
//!
//! `trouble-cs` sizes its fixed-capacity storage at compile time. Each setting can be
//! overridden with an environment variable named `TROUBLE_CS_<NAME>` at build time, for
//! example `TROUBLE_CS_CONFIG_SLOTS=8 cargo build`. You can also set them in the `[env]`
//! section of `.cargo/config.toml`.
//!
//! Run-time behavior (whether Channel Sounding is supported, the local capabilities and the
//! local FAE table) is configured through [`CsSettings`](crate::CsSettings) instead.

mod raw {
    #![allow(unused)]
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}

/// CS configuration slots per connection
///
/// The number of configurations that can be stored for every connection. The local
/// capabilities may advertise fewer, but never more, configurations than this.
///
/// Default: 4.
pub const CONFIG_SLOTS: usize = raw::CONFIG_SLOTS;

/// Completion event queue size
///
/// Events reported upwards are buffered here until the host-facing layer picks them up.
///
/// Default: 8.
pub const EVENT_QUEUE_SIZE: usize = raw::EVENT_QUEUE_SIZE;

/// Control PDU transmit queue size
///
/// Shared by all connections. A request that cannot be queued is refused with
/// [`Error::InsufficientResources`](crate::Error::InsufficientResources).
///
/// Default: 4.
pub const CONTROL_TX_QUEUE_SIZE: usize = raw::CONTROL_TX_QUEUE_SIZE;

/// Maximum size of forwarded subevent result data.
///
/// Default: 251.
pub const SUBEVENT_DATA_MAX: usize = raw::SUBEVENT_DATA_MAX;
