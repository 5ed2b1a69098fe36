//! # vmscope Prelude
//!
//! The types most introspection code needs: addresses, overlays, events and the error type.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all vmscope operations
pub use crate::Error;

/// The result type used throughout vmscope
pub use crate::Result;

/// Failure reasons of memory channels and backend resolution
pub use crate::{MemoryFault, UnsupportedReason};

/// Configuration
pub use crate::config::{DispatchConfig, MemoryConfig, ResolverConfig, VmiConfig, WritePolicy};

// ================================================================================================
// Guest Memory
// ================================================================================================

/// Guest addresses
pub use crate::memory::{AddressSpace, GuestAddress, GuestPhysicalAddress, GuestVirtualAddress};

/// Memory access and overlays
pub use crate::memory::{GuestMemory, GuestPtr, GuestValue, MemoryChannel};

/// Built-in memory images
pub use crate::memory::{DumpFile, SnapshotMemory};

// ================================================================================================
// Architecture
// ================================================================================================

/// x86 state
pub use crate::arch::x86::{
    Exception, PageDirectory, PagingMode, Registers, Segment, SegmentSelector,
};

// ================================================================================================
// Events
// ================================================================================================

/// Event model and delivery
pub use crate::event::{
    context, Event, EventCallback, EventDetail, EventDispatcher, EventSource, EventType,
    ExceptionEvent,
};

// ================================================================================================
// Hypervisor
// ================================================================================================

/// Backend traits and resolution
pub use crate::hypervisor::{
    Domain, DomainInformation, DomainSelector, Hypervisor, HypervisorResolver,
};

// ================================================================================================
// Windows Structures
// ================================================================================================

/// PE images
pub use crate::windows::pe::{ImageSectionHeader, SectionCharacteristics, SectionTable};

/// CryptoAPI
pub use crate::windows::advapi32::{AlgId, BlobHeader, BlobType};
