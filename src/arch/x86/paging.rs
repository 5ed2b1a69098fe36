//! x86 page-table walking.
//!
//! Guest virtual addresses are only meaningful together with the page directory that maps them.
//! [`translate`] walks the guest's own page tables through a [`MemoryChannel`] to find the
//! backing physical address, supporting the four x86 configurations:
//!
//! | Mode | Levels | Entry size | Large pages |
//! |------|--------|------------|-------------|
//! | [`PagingMode::Disabled`] | 0 (identity) | - | - |
//! | [`PagingMode::Legacy32`] | 2 | 4 bytes | 4 MiB |
//! | [`PagingMode::Pae`] | 3 | 8 bytes | 2 MiB |
//! | [`PagingMode::Long4`] | 4 | 8 bytes | 2 MiB, 1 GiB |
//!
//! Page tables live in guest memory and are therefore guest-controlled. The walk reads exactly
//! one entry per level and fails with [`MemoryFault::NotPresent`] as soon as an entry is not
//! present; it never loops.

use bitflags::bitflags;

use crate::{
    memory::{read_le, AddressSpace, GuestPhysicalAddress, MemoryChannel, PAGE_SHIFT},
    Error, MemoryFault, Result,
};

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
    /// Bits of an x86 page-table entry, at any level.
    ///
    /// Entries are kept with [`PageTableEntry::from_bits_retain`] so the frame address bits
    /// survive alongside the flags.
    pub struct PageTableEntry : u64 {
        /// The entry maps something
        const PRESENT = 1 << 0;
        /// Writes are allowed
        const WRITABLE = 1 << 1;
        /// User-mode accesses are allowed
        const USER = 1 << 2;
        /// Write-through caching
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled
        const CACHE_DISABLED = 1 << 4;
        /// Set by the CPU on access
        const ACCESSED = 1 << 5;
        /// Set by the CPU on write
        const DIRTY = 1 << 6;
        /// Maps a large page instead of pointing at the next table
        const HUGE = 1 << 7;
        /// Not flushed from the TLB on CR3 reload
        const GLOBAL = 1 << 8;
        /// Instruction fetches are not allowed
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageTableEntry {
    /// Returns the physical frame address this entry points at.
    ///
    /// The mask depends on the entry width: 32-bit entries keep bits 12..32, 64-bit entries keep
    /// bits 12..48.
    #[must_use]
    pub fn frame(self, mode: PagingMode) -> u64 {
        match mode {
            PagingMode::Legacy32 => self.bits() & 0xFFFF_F000,
            _ => self.bits() & 0x0000_FFFF_FFFF_F000,
        }
    }
}

/// Paging configuration of a VCPU, derived from CR0, CR4 and EFER.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum PagingMode {
    /// CR0.PG clear; virtual addresses are physical addresses.
    Disabled,
    /// Classic 32-bit two-level paging.
    Legacy32,
    /// Physical address extension, three levels.
    Pae,
    /// IA-32e four-level paging.
    Long4,
}

struct Level {
    shift: u32,
    bits: u32,
    huge: bool,
}

const LEGACY32_LEVELS: &[Level] = &[
    Level { shift: 22, bits: 10, huge: true },
    Level { shift: 12, bits: 10, huge: false },
];

const PAE_LEVELS: &[Level] = &[
    Level { shift: 30, bits: 2, huge: false },
    Level { shift: 21, bits: 9, huge: true },
    Level { shift: 12, bits: 9, huge: false },
];

const LONG4_LEVELS: &[Level] = &[
    Level { shift: 39, bits: 9, huge: false },
    Level { shift: 30, bits: 9, huge: true },
    Level { shift: 21, bits: 9, huge: true },
    Level { shift: 12, bits: 9, huge: false },
];

impl PagingMode {
    /// Highest virtual address representable in this mode.
    #[must_use]
    pub fn max_virtual(self) -> u64 {
        match self {
            PagingMode::Disabled | PagingMode::Long4 => u64::MAX,
            PagingMode::Legacy32 | PagingMode::Pae => u64::from(u32::MAX),
        }
    }

    /// Returns `true` if `va` is a valid virtual address in this mode.
    ///
    /// In long mode bits 63..47 must be a sign extension of bit 47.
    #[must_use]
    pub fn is_canonical(self, va: u64) -> bool {
        match self {
            PagingMode::Long4 => {
                let high = va >> 47;
                high == 0 || high == 0x1_FFFF
            }
            _ => va <= self.max_virtual(),
        }
    }

    fn levels(self) -> &'static [Level] {
        match self {
            PagingMode::Disabled => &[],
            PagingMode::Legacy32 => LEGACY32_LEVELS,
            PagingMode::Pae => PAE_LEVELS,
            PagingMode::Long4 => LONG4_LEVELS,
        }
    }

    fn entry_size(self) -> u64 {
        match self {
            PagingMode::Legacy32 => 4,
            _ => 8,
        }
    }

    fn root_table(self, cr3: u64) -> u64 {
        match self {
            PagingMode::Pae => cr3 & 0xFFFF_FFE0,
            PagingMode::Legacy32 => cr3 & 0xFFFF_F000,
            _ => cr3 & 0x000F_FFFF_FFFF_F000,
        }
    }
}

/// The page tables a virtual address is interpreted through: the CR3 value and paging mode of
/// the VCPU that produced the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageDirectory {
    /// Raw CR3 value
    pub base: GuestPhysicalAddress,
    /// Paging mode in effect
    pub mode: PagingMode,
}

impl PageDirectory {
    /// Creates a page directory description.
    #[must_use]
    pub const fn new(base: GuestPhysicalAddress, mode: PagingMode) -> Self {
        PageDirectory { base, mode }
    }

    /// A directory for guests that run without paging.
    #[must_use]
    pub const fn identity() -> Self {
        PageDirectory {
            base: GuestPhysicalAddress::new(0),
            mode: PagingMode::Disabled,
        }
    }
}

fn read_entry(
    channel: &dyn MemoryChannel,
    address: u64,
    mode: PagingMode,
) -> Result<PageTableEntry> {
    let mut raw = [0u8; 8];
    let size = mode.entry_size() as usize;
    channel
        .read_physical(GuestPhysicalAddress::new(address), &mut raw[..size])
        .map_err(|fault| Error::MemoryAccess {
            address,
            space: AddressSpace::Physical,
            fault,
        })?;

    let bits = if size == 4 {
        u64::from(read_le::<u32>(&raw)?)
    } else {
        read_le::<u64>(&raw)?
    };
    Ok(PageTableEntry::from_bits_retain(bits))
}

/// Translates a guest virtual address to the guest physical address backing it.
///
/// # Errors
/// - [`Error::NullAddress`] if paging is enabled but the page directory base is zero
/// - [`Error::AddressOverflow`] if `va` is not canonical for the paging mode
/// - [`Error::MemoryAccess`] with [`MemoryFault::NotPresent`] (reported at `va`) if an entry
///   along the walk is not present, or with the channel's fault (reported at the entry's
///   physical address) if a table could not be read
pub fn translate(
    channel: &dyn MemoryChannel,
    directory: PageDirectory,
    va: u64,
) -> Result<GuestPhysicalAddress> {
    let mode = directory.mode;
    if mode == PagingMode::Disabled {
        return Ok(GuestPhysicalAddress::new(va));
    }
    if directory.base.value() == 0 {
        return Err(Error::NullAddress);
    }
    if !mode.is_canonical(va) {
        return Err(Error::AddressOverflow {
            address: va,
            offset: 0,
        });
    }

    let levels = mode.levels();
    let mut table = mode.root_table(directory.base.value());
    for (depth, level) in levels.iter().enumerate() {
        let index = (va >> level.shift) & ((1 << level.bits) - 1);
        let entry = read_entry(channel, table + index * mode.entry_size(), mode)?;

        if !entry.contains(PageTableEntry::PRESENT) {
            return Err(Error::MemoryAccess {
                address: va,
                space: AddressSpace::Virtual,
                fault: MemoryFault::NotPresent,
            });
        }

        let leaf = depth + 1 == levels.len();
        if leaf || (level.huge && entry.contains(PageTableEntry::HUGE)) {
            let page_mask = (1u64 << level.shift) - 1;
            let frame = entry.frame(mode) & !page_mask;
            return Ok(GuestPhysicalAddress::new(frame | (va & page_mask)));
        }

        table = entry.frame(mode);
    }

    // Every paging mode has at least one level and the last level is always a leaf.
    Err(Error::MemoryAccess {
        address: va,
        space: AddressSpace::Virtual,
        fault: MemoryFault::NotPresent,
    })
}

/// Number of bytes from `va` to the end of its 4 KiB page.
#[must_use]
pub fn bytes_left_in_page(va: u64) -> u64 {
    (1u64 << PAGE_SHIFT) - (va & ((1u64 << PAGE_SHIFT) - 1))
}
