//! Guest address types.
//!
//! Addresses carry no behaviour beyond identity and checked arithmetic. A physical address is a
//! plain 52-bit frame-and-offset value; a virtual address additionally carries the
//! [`PageDirectory`] it must be translated through, so two virtual addresses are only
//! comparable when they belong to the same address space.

use std::{cmp::Ordering, fmt};

use crate::{
    arch::x86::{PageDirectory, PagingMode},
    event::context,
    Error, Result,
};

/// log2 of the guest page size
pub const PAGE_SHIFT: u32 = 12;
/// Guest page size in bytes
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Mask selecting the offset within a page
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;
/// Highest guest physical address (52-bit MAXPHYADDR)
pub const MAX_PHYSICAL_ADDRESS: u64 = (1 << 52) - 1;

/// Which address space a raw guest address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum AddressSpace {
    /// Guest physical memory
    #[strum(serialize = "physical")]
    Physical,
    /// Guest virtual memory, translated through a page directory
    #[strum(serialize = "virtual")]
    Virtual,
}

/// A location in guest physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GuestPhysicalAddress(u64);

impl GuestPhysicalAddress {
    /// Wraps a raw physical address.
    #[must_use]
    pub const fn new(address: u64) -> Self {
        GuestPhysicalAddress(address)
    }

    /// The raw address
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Page frame number
    #[must_use]
    pub const fn page_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Offset within the page
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    /// Returns the address `offset` bytes further on.
    ///
    /// # Errors
    /// Returns [`Error::AddressOverflow`] if the result would exceed the physical address space.
    pub fn offset(self, offset: u64) -> Result<Self> {
        match self.0.checked_add(offset) {
            Some(address) if address <= MAX_PHYSICAL_ADDRESS => Ok(GuestPhysicalAddress(address)),
            _ => Err(Error::AddressOverflow {
                address: self.0,
                offset,
            }),
        }
    }
}

impl From<u64> for GuestPhysicalAddress {
    fn from(address: u64) -> Self {
        GuestPhysicalAddress(address)
    }
}

impl fmt::Display for GuestPhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A location in guest virtual memory together with the page tables that map it.
///
/// Equality includes the page directory. Ordering is only defined between addresses that share
/// a page directory; `partial_cmp` returns `None` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestVirtualAddress {
    address: u64,
    directory: PageDirectory,
}

impl GuestVirtualAddress {
    /// Creates a virtual address in the address space described by `directory`.
    ///
    /// # Errors
    /// Returns [`Error::AddressOverflow`] if `address` is not valid for the paging mode
    /// (above 4 GiB in 32-bit modes, non-canonical in long mode).
    pub fn new(address: u64, directory: PageDirectory) -> Result<Self> {
        if !directory.mode.is_canonical(address) {
            return Err(Error::AddressOverflow { address, offset: 0 });
        }
        Ok(GuestVirtualAddress { address, directory })
    }

    /// Creates a virtual address in the address space of the event active on this thread.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMethod`] if no event is active, or [`Error::AddressOverflow`]
    /// as for [`GuestVirtualAddress::new`].
    pub fn from_active_event(address: u64) -> Result<Self> {
        let directory = context::with(|event| event.registers().page_directory())?;
        Self::new(address, directory)
    }

    /// The raw virtual address
    #[must_use]
    pub const fn value(self) -> u64 {
        self.address
    }

    /// The page tables this address is translated through
    #[must_use]
    pub const fn directory(self) -> PageDirectory {
        self.directory
    }

    /// Offset within the page
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.address & PAGE_MASK
    }

    /// Returns the address `offset` bytes further on, in the same address space.
    ///
    /// # Errors
    /// Returns [`Error::AddressOverflow`] if the result wraps or leaves the valid range of the
    /// paging mode. In long mode this includes stepping into the non-canonical hole.
    pub fn offset(self, offset: u64) -> Result<Self> {
        let overflow = Error::AddressOverflow {
            address: self.address,
            offset,
        };
        let Some(address) = self.address.checked_add(offset) else {
            return Err(overflow);
        };

        let mode = self.directory.mode;
        let crosses_hole =
            mode == PagingMode::Long4 && (address >> 47 != self.address >> 47);
        if !mode.is_canonical(address) || crosses_hole {
            return Err(overflow);
        }

        Ok(GuestVirtualAddress {
            address,
            directory: self.directory,
        })
    }
}

impl PartialOrd for GuestVirtualAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.directory != other.directory {
            return None;
        }
        Some(self.address.cmp(&other.address))
    }
}

impl fmt::Display for GuestVirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.address)
    }
}

/// Either kind of guest address. This is what overlays are rooted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestAddress {
    /// A physical address
    Physical(GuestPhysicalAddress),
    /// A virtual address
    Virtual(GuestVirtualAddress),
}

impl GuestAddress {
    /// The raw address value
    #[must_use]
    pub const fn value(self) -> u64 {
        match self {
            GuestAddress::Physical(address) => address.value(),
            GuestAddress::Virtual(address) => address.value(),
        }
    }

    /// The address space of this address
    #[must_use]
    pub const fn space(self) -> AddressSpace {
        match self {
            GuestAddress::Physical(_) => AddressSpace::Physical,
            GuestAddress::Virtual(_) => AddressSpace::Virtual,
        }
    }

    /// Returns the address `offset` bytes further on, in the same address space.
    ///
    /// # Errors
    /// Returns [`Error::AddressOverflow`] on wrap-around or when leaving the address space.
    pub fn offset(self, offset: u64) -> Result<Self> {
        Ok(match self {
            GuestAddress::Physical(address) => GuestAddress::Physical(address.offset(offset)?),
            GuestAddress::Virtual(address) => GuestAddress::Virtual(address.offset(offset)?),
        })
    }
}

impl From<GuestPhysicalAddress> for GuestAddress {
    fn from(address: GuestPhysicalAddress) -> Self {
        GuestAddress::Physical(address)
    }
}

impl From<GuestVirtualAddress> for GuestAddress {
    fn from(address: GuestVirtualAddress) -> Self {
        GuestAddress::Virtual(address)
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestAddress::Physical(address) => write!(f, "{address} (physical)"),
            GuestAddress::Virtual(address) => write!(f, "{address} (virtual)"),
        }
    }
}
