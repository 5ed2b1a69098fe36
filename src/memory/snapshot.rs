use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::{
    memory::{GuestPhysicalAddress, MemoryChannel, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE},
    Error, MemoryFault, Result,
};

type Page = Box<[u8; PAGE_SIZE as usize]>;

struct InjectedFault {
    fault: MemoryFault,
    remaining: Option<u32>,
}

/// Guest physical memory held in host memory.
///
/// Pages are stored sparsely; reading a page that was never loaded fails with
/// [`MemoryFault::Unmapped`]. Faults can be injected per page to model swapped-out or busy
/// memory. Each page sits behind its own shard lock, so accesses to the same page are
/// serialized while different pages proceed in parallel.
#[derive(Default)]
pub struct SnapshotMemory {
    pages: DashMap<u64, Page>,
    faults: DashMap<u64, InjectedFault>,
    epoch: AtomicU64,
}

impl SnapshotMemory {
    /// Create an empty memory image
    pub fn new() -> SnapshotMemory {
        SnapshotMemory::default()
    }

    /// Create a memory image holding `data` at physical address `base`.
    ///
    /// ## Arguments
    /// * 'base' - Physical address of the first byte
    /// * 'data' - The bytes to load
    ///
    /// # Errors
    /// Returns [`crate::Error::AddressOverflow`] if the data does not fit below the top of the
    /// physical address space.
    pub fn with_data(base: u64, data: &[u8]) -> Result<SnapshotMemory> {
        let memory = SnapshotMemory::new();
        memory.load(base, data)?;
        Ok(memory)
    }

    /// Copies `data` into guest memory at `address`, mapping pages as needed.
    ///
    /// # Errors
    /// Returns [`crate::Error::AddressOverflow`] if the range leaves the physical address space.
    pub fn load(&self, address: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        GuestPhysicalAddress::new(address).offset(data.len() as u64 - 1)?;

        let mut done = 0usize;
        while done < data.len() {
            let current = address + done as u64;
            let in_page = (current & PAGE_MASK) as usize;
            let chunk = (PAGE_SIZE as usize - in_page).min(data.len() - done);

            let mut page = self
                .pages
                .entry(current >> PAGE_SHIFT)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
            page[in_page..in_page + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Removes the page containing `address`.
    pub fn unmap(&self, address: u64) {
        self.pages.remove(&(address >> PAGE_SHIFT));
    }

    /// Makes accesses to the page containing `address` fail with `fault`.
    ///
    /// With `times` set, the fault clears after that many failed accesses; otherwise it stays
    /// until [`SnapshotMemory::clear_fault`].
    pub fn inject_fault(&self, address: u64, fault: MemoryFault, times: Option<u32>) {
        self.faults.insert(
            address >> PAGE_SHIFT,
            InjectedFault {
                fault,
                remaining: times,
            },
        );
    }

    /// Removes an injected fault.
    pub fn clear_fault(&self, address: u64) {
        self.faults.remove(&(address >> PAGE_SHIFT));
    }

    /// Marks all cached views of this memory as stale, as happens when the guest resumes.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of mapped pages
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn check_fault(&self, page: u64) -> std::result::Result<(), MemoryFault> {
        let Some(mut injected) = self.faults.get_mut(&page) else {
            return Ok(());
        };
        let fault = injected.fault;
        match injected.remaining.as_mut() {
            None => return Err(fault),
            Some(remaining) => *remaining = remaining.saturating_sub(1),
        }
        let exhausted = injected.remaining == Some(0);
        drop(injected);
        if exhausted {
            self.faults.remove(&page);
        }
        Err(fault)
    }

    /// Walks `[address, address + len)` page by page.
    fn chunks<F>(&self, address: u64, len: usize, mut op: F) -> std::result::Result<(), MemoryFault>
    where
        F: FnMut(u64, usize, std::ops::Range<usize>) -> std::result::Result<(), MemoryFault>,
    {
        let mut done = 0usize;
        while done < len {
            let Some(current) = address.checked_add(done as u64) else {
                return Err(MemoryFault::Unmapped);
            };
            let in_page = (current & PAGE_MASK) as usize;
            let chunk = (PAGE_SIZE as usize - in_page).min(len - done);
            let page = current >> PAGE_SHIFT;

            self.check_fault(page)?;
            op(page, done, in_page..in_page + chunk)?;
            done += chunk;
        }
        Ok(())
    }
}

impl MemoryChannel for SnapshotMemory {
    fn read_physical(
        &self,
        address: GuestPhysicalAddress,
        buffer: &mut [u8],
    ) -> std::result::Result<(), MemoryFault> {
        self.chunks(address.value(), buffer.len(), |page, done, range| {
            let Some(data) = self.pages.get(&page) else {
                return Err(MemoryFault::Unmapped);
            };
            let len = range.len();
            buffer[done..done + len].copy_from_slice(&data[range]);
            Ok(())
        })
    }

    fn write_physical(
        &self,
        address: GuestPhysicalAddress,
        data: &[u8],
    ) -> std::result::Result<(), MemoryFault> {
        self.chunks(address.value(), data.len(), |page, done, range| {
            let Some(mut target) = self.pages.get_mut(&page) else {
                return Err(MemoryFault::Unmapped);
            };
            let len = range.len();
            target[range].copy_from_slice(&data[done..done + len]);
            Ok(())
        })
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SnapshotMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotMemory")
            .field("pages", &self.pages.len())
            .field("faults", &self.faults.len())
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl TryFrom<Vec<u8>> for SnapshotMemory {
    type Error = Error;

    /// Loads a flat physical memory image starting at address zero.
    fn try_from(data: Vec<u8>) -> Result<Self> {
        SnapshotMemory::with_data(0, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(memory: &SnapshotMemory, address: u64, len: usize) -> std::result::Result<Vec<u8>, MemoryFault> {
        let mut buffer = vec![0u8; len];
        memory.read_physical(GuestPhysicalAddress::new(address), &mut buffer)?;
        Ok(buffer)
    }

    #[test]
    fn memory() {
        let mut data = vec![0xCC_u8; 0x1800];
        data[0x0ffe..0x1003].copy_from_slice(&[0xBB; 5]);

        let memory = SnapshotMemory::with_data(0x4000, &data).unwrap();
        assert_eq!(memory.page_count(), 2);

        assert_eq!(read(&memory, 0x4ffe, 5).unwrap(), vec![0xBB; 5]);
        assert_eq!(read(&memory, 0x4000, 1).unwrap(), vec![0xCC]);
        assert_eq!(read(&memory, 0x3fff, 2), Err(MemoryFault::Unmapped));
        // The tail of the second page was mapped with zeroes.
        assert_eq!(read(&memory, 0x5ff0, 4).unwrap(), vec![0; 4]);
        assert_eq!(read(&memory, 0x6000, 1), Err(MemoryFault::Unmapped));
    }

    #[test]
    fn write_spans_pages() {
        let memory = SnapshotMemory::with_data(0x1000, &[0u8; 0x2000]).unwrap();
        memory
            .write_physical(GuestPhysicalAddress::new(0x1ffe), &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(read(&memory, 0x1ffe, 4).unwrap(), vec![1, 2, 3, 4]);

        assert_eq!(
            memory.write_physical(GuestPhysicalAddress::new(0x2ffe), &[1, 2, 3, 4]),
            Err(MemoryFault::Unmapped)
        );
    }

    #[test]
    fn injected_faults() {
        let memory = SnapshotMemory::with_data(0x1000, &[7u8; 16]).unwrap();

        memory.inject_fault(0x1008, MemoryFault::PermissionDenied, None);
        assert_eq!(read(&memory, 0x1000, 1), Err(MemoryFault::PermissionDenied));
        assert_eq!(read(&memory, 0x1000, 1), Err(MemoryFault::PermissionDenied));
        memory.clear_fault(0x1000);
        assert_eq!(read(&memory, 0x1000, 1).unwrap(), vec![7]);

        memory.inject_fault(0x1000, MemoryFault::Transient, Some(1));
        assert_eq!(read(&memory, 0x1000, 1), Err(MemoryFault::Transient));
        assert_eq!(read(&memory, 0x1000, 1).unwrap(), vec![7]);
    }

    #[test]
    fn unmap_and_epoch() {
        let memory = SnapshotMemory::try_from(vec![1u8; 0x2000]).unwrap();
        assert_eq!(memory.epoch(), 0);
        memory.unmap(0x1000);
        assert_eq!(read(&memory, 0x1000, 1), Err(MemoryFault::Unmapped));
        assert_eq!(memory.advance_epoch(), 1);
        assert_eq!(memory.epoch(), 1);
    }

    #[test]
    fn load_rejects_overflow() {
        let memory = SnapshotMemory::new();
        assert!(matches!(
            memory.load(u64::MAX, &[1, 2]),
            Err(Error::AddressOverflow { .. })
        ));
        assert_eq!(memory.page_count(), 0);
    }
}
