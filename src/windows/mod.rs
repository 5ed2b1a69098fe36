//! Windows structure overlays.
//!
//! Every type here is built from [`crate::memory::GuestPtr`] views and never trusts a
//! guest-declared length or count beyond the bounds configured in
//! [`crate::config::MemoryConfig`].
//!
//! - [`pe`] - PE image headers
//! - [`advapi32`] - CryptoAPI key BLOBs and algorithm identifiers

pub mod advapi32;
pub mod pe;
