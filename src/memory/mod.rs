//! Guest memory access.
//!
//! Everything that reads or writes guest memory goes through this module.
//!
//! # Key Components
//!
//! - [`GuestPhysicalAddress`], [`GuestVirtualAddress`], [`GuestAddress`] - Address identity and checked arithmetic
//! - [`MemoryChannel`] - The backend contract for raw physical memory access
//! - [`GuestPtr`] - Typed, bounds-checked, lazily fetched overlays
//! - [`GuestMemory`] - A channel plus the limits overlays must respect
//! - [`SnapshotMemory`], [`DumpFile`] - In-memory and on-disk physical memory images
//!
//! Virtual addresses are translated through the guest's own page tables
//! ([`crate::arch::x86::translate`]) one page at a time.

mod address;
mod channel;
mod dirty;
mod dump;
mod guest;
mod ptr;
mod snapshot;
mod string;
mod value;

pub use address::{
    AddressSpace, GuestAddress, GuestPhysicalAddress, GuestVirtualAddress, MAX_PHYSICAL_ADDRESS,
    PAGE_MASK, PAGE_SHIFT, PAGE_SIZE,
};
pub use channel::{read_guest, write_guest, MemoryChannel, Retrying};
pub use dirty::{DirtyMap, DirtyRuns};
pub use dump::DumpFile;
pub use guest::GuestMemory;
pub use ptr::GuestPtr;
pub use snapshot::SnapshotMemory;
pub use string::{map_counted, map_cstring, map_wstring, terminated_length};
pub use value::{read_le, read_le_at, write_le_at, GuestValue};
