//! Common types.

pub mod capabilities;
pub mod config;
pub mod fae;
pub(crate) mod primitives;
pub mod procedure;
pub mod security;
pub mod test_mode;
pub mod timing;
