//! x86 and x86-64 guest state.
//!
//! # Key Components
//!
//! - [`Registers`] - Per-VCPU register snapshot attached to every event
//! - [`Segment`] / [`SegmentSelector`] - Decoded segment registers
//! - [`Exception`] - CPU exception vectors
//! - [`translate`] - Page-table walk for 32-bit, PAE and long mode guests

mod exception;
mod paging;
mod registers;
mod segment;

pub use exception::Exception;
pub use paging::{bytes_left_in_page, translate, PageDirectory, PageTableEntry, PagingMode};
pub use registers::{Cr0, Cr4, DescriptorTable, Efer, RFlags, Registers};
pub use segment::{Segment, SegmentSelector};
