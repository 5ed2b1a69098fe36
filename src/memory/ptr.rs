//! Typed overlays over guest memory.
//!
//! A [`GuestPtr<T>`] is a non-owning view of `count` consecutive `T` values at a guest address.
//! It is the building block every OS-structure overlay in this crate is made from.
//!
//! # Lifecycle
//!
//! - **Construction** records the address and bound. It never touches guest memory.
//! - **First access** fetches the whole range through the [`MemoryChannel`] (page by page for
//!   virtual addresses) and caches it. Later reads are served from the cache.
//! - **Writes** update the cache and mark the bytes dirty, so a later read through the same
//!   overlay sees them immediately. With [`WritePolicy::Deferred`] they reach the guest on
//!   [`GuestPtr::commit`]; with [`WritePolicy::WriteThrough`] inside `set` itself.
//! - **Staleness** is explicit. [`GuestPtr::is_stale`] compares the cache against the channel's
//!   epoch, and [`GuestPtr::refresh`] drops a clean cache so the next access refetches.
//! - **Drop** flushes pending writes. A failed flush is logged; it cannot be reported otherwise.
//!
//! Every failure is an error: accesses past `count` are [`crate::Error::OutOfBounds`], channel
//! failures are [`crate::Error::MemoryAccess`]. Nothing is ever zero-filled.
//!
//! The cache lives in a [`RefCell`], so an overlay is `Send` but not `Sync`: it belongs to the
//! handler thread that created it.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use vmscope::memory::{GuestAddress, GuestPhysicalAddress, GuestPtr, MemoryChannel, SnapshotMemory};
//!
//! let memory: Arc<dyn MemoryChannel> =
//!     Arc::new(SnapshotMemory::with_data(0x1000, &[1, 0, 2, 0, 3, 0])?);
//! let base = GuestAddress::from(GuestPhysicalAddress::new(0x1000));
//!
//! let values = GuestPtr::<u16>::new(memory, base, 3)?;
//! assert_eq!(values.read_all()?, vec![1, 2, 3]);
//!
//! values.set(1, 0x2222)?;
//! assert_eq!(values.get(1)?, 0x2222);
//! values.commit()?;
//! # Ok::<(), vmscope::Error>(())
//! ```

use std::{cell::RefCell, fmt, marker::PhantomData, mem::size_of, sync::Arc};

use crate::{
    arch::x86::PagingMode,
    config::WritePolicy,
    memory::{read_guest, read_le, write_guest, write_le_at, DirtyMap, GuestAddress, GuestValue, MemoryChannel},
    Error::{self, OutOfBounds},
    Result,
};

struct Cache {
    bytes: Vec<u8>,
    dirty: DirtyMap,
    epoch: u64,
}

/// A typed, bounds-checked, lazily fetched view of `count` values of `T` in guest memory.
pub struct GuestPtr<T: GuestValue> {
    channel: Arc<dyn MemoryChannel>,
    address: GuestAddress,
    count: usize,
    byte_len: usize,
    policy: WritePolicy,
    cache: RefCell<Option<Cache>>,
    _marker: PhantomData<T>,
}

impl<T: GuestValue> GuestPtr<T> {
    /// Creates an overlay of `count` elements at `address`. Guest memory is not accessed.
    ///
    /// # Errors
    /// - [`crate::Error::NullAddress`] if `address` is virtual address 0 under paging. Without
    ///   paging virtual 0 is physical 0 and is accepted, as is physical 0 itself.
    /// - [`crate::Error::AddressOverflow`] if the range does not fit in the address space
    pub fn new(channel: Arc<dyn MemoryChannel>, address: GuestAddress, count: usize) -> Result<Self> {
        Self::with_policy(channel, address, count, WritePolicy::default())
    }

    /// Creates an overlay with an explicit write discipline.
    ///
    /// # Errors
    /// As for [`GuestPtr::new`].
    pub fn with_policy(
        channel: Arc<dyn MemoryChannel>,
        address: GuestAddress,
        count: usize,
        policy: WritePolicy,
    ) -> Result<Self> {
        if let GuestAddress::Virtual(va) = address {
            if va.value() == 0 && va.directory().mode != PagingMode::Disabled {
                return Err(Error::NullAddress);
            }
        }
        let Some(byte_len) = count.checked_mul(size_of::<T>()) else {
            return Err(Error::AddressOverflow {
                address: address.value(),
                offset: u64::MAX,
            });
        };
        if byte_len > 0 {
            address.offset(byte_len as u64 - 1)?;
        }

        Ok(GuestPtr {
            channel,
            address,
            count,
            byte_len,
            policy,
            cache: RefCell::new(None),
            _marker: PhantomData,
        })
    }

    /// Base address of the overlay
    pub fn address(&self) -> GuestAddress {
        self.address
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if the overlay covers no elements
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Size of the overlay in bytes
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// The channel this overlay reads through
    pub fn channel(&self) -> &Arc<dyn MemoryChannel> {
        &self.channel
    }

    /// The write discipline of this overlay
    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    fn ensure_cached(&self) -> Result<()> {
        if self.cache.borrow().is_some() {
            return Ok(());
        }

        let epoch = self.channel.epoch();
        let mut bytes = vec![0u8; self.byte_len];
        read_guest(self.channel.as_ref(), self.address, &mut bytes)?;
        log::debug!("fetched {} bytes at {}", self.byte_len, self.address);

        *self.cache.borrow_mut() = Some(Cache {
            bytes,
            dirty: DirtyMap::new(self.byte_len),
            epoch,
        });
        Ok(())
    }

    fn check_range(&self, byte_offset: usize, len: usize) -> Result<()> {
        match byte_offset.checked_add(len) {
            Some(end) if end <= self.byte_len => Ok(()),
            _ => Err(OutOfBounds),
        }
    }

    /// Reads element `index`.
    ///
    /// # Errors
    /// [`crate::Error::OutOfBounds`] if `index >= len()`, otherwise any error of the fetch.
    pub fn get(&self, index: usize) -> Result<T> {
        if index >= self.count {
            return Err(OutOfBounds);
        }
        self.read_at(index * size_of::<T>())
    }

    /// Reads every element.
    ///
    /// # Errors
    /// Any error of the fetch.
    pub fn read_all(&self) -> Result<Vec<T>> {
        (0..self.count).map(|index| self.get(index)).collect()
    }

    /// Reads a `U` at `byte_offset` from the start of the overlay.
    ///
    /// Structure overlays use this to decode fields at fixed offsets.
    ///
    /// # Errors
    /// [`crate::Error::OutOfBounds`] if the field does not lie entirely inside the overlay.
    pub fn read_at<U: GuestValue>(&self, byte_offset: usize) -> Result<U> {
        self.check_range(byte_offset, size_of::<U>())?;
        self.ensure_cached()?;

        let cache = self.cache.borrow();
        let Some(cache) = cache.as_ref() else {
            return Err(Error::InvalidMethod("overlay cache vanished during read"));
        };
        read_le(&cache.bytes[byte_offset..])
    }

    /// Writes element `index`.
    ///
    /// # Errors
    /// [`crate::Error::OutOfBounds`] if `index >= len()`, otherwise any error of the fetch (or,
    /// with [`WritePolicy::WriteThrough`], of the flush).
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        if index >= self.count {
            return Err(OutOfBounds);
        }
        self.write_at(index * size_of::<T>(), value)
    }

    /// Writes a `U` at `byte_offset` from the start of the overlay.
    ///
    /// With [`WritePolicy::WriteThrough`] a failed flush leaves the overlay as it was before
    /// the call: the value is neither visible to reads nor flushed later.
    ///
    /// # Errors
    /// As for [`GuestPtr::set`].
    pub fn write_at<U: GuestValue>(&self, byte_offset: usize, value: U) -> Result<()> {
        let len = size_of::<U>();
        self.check_range(byte_offset, len)?;
        self.ensure_cached()?;

        let (previous, was_dirty) = {
            let mut cache = self.cache.borrow_mut();
            let Some(cache) = cache.as_mut() else {
                return Err(Error::InvalidMethod("overlay cache vanished during write"));
            };
            let previous = cache.bytes[byte_offset..byte_offset + len].to_vec();
            let was_dirty = (byte_offset..byte_offset + len).any(|index| cache.dirty.contains(index));
            let mut offset = byte_offset;
            write_le_at(&mut cache.bytes, &mut offset, value)?;
            cache.dirty.mark(byte_offset, len)?;
            (previous, was_dirty)
        };

        if self.policy == WritePolicy::WriteThrough {
            if let Err(error) = self.commit() {
                self.rollback(byte_offset, &previous, was_dirty);
                return Err(error);
            }
        }
        Ok(())
    }

    fn rollback(&self, byte_offset: usize, previous: &[u8], was_dirty: bool) {
        let mut cache = self.cache.borrow_mut();
        if let Some(cache) = cache.as_mut() {
            cache.bytes[byte_offset..byte_offset + previous.len()].copy_from_slice(previous);
            if !was_dirty {
                cache.dirty.clear_range(byte_offset, previous.len());
            }
        }
    }

    /// Returns a copy of the overlay's bytes.
    ///
    /// # Errors
    /// Any error of the fetch.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        self.ensure_cached()?;
        let cache = self.cache.borrow();
        Ok(cache.as_ref().map(|cache| cache.bytes.clone()).unwrap_or_default())
    }

    /// Flushes pending writes to guest memory.
    ///
    /// Dirty bytes are written as maximal contiguous runs. If a run fails, it and every later
    /// run stay dirty so a subsequent `commit` can retry them.
    ///
    /// # Errors
    /// Any error of the channel while writing.
    pub fn commit(&self) -> Result<()> {
        let mut guard = self.cache.borrow_mut();
        let Some(cache) = guard.as_mut() else {
            return Ok(());
        };

        let runs: Vec<_> = cache.dirty.runs().collect();
        for run in runs {
            let target = self.address.offset(run.start as u64)?;
            write_guest(self.channel.as_ref(), target, &cache.bytes[run.clone()])?;
            cache.dirty.clear_range(run.start, run.len());
        }
        Ok(())
    }

    /// Drops the cache so the next access fetches fresh bytes.
    ///
    /// # Errors
    /// [`crate::Error::InvalidMethod`] if uncommitted writes exist; commit or discard them first.
    pub fn refresh(&self) -> Result<()> {
        let mut cache = self.cache.borrow_mut();
        if cache.as_ref().is_some_and(|cache| !cache.dirty.is_empty()) {
            return Err(Error::InvalidMethod(
                "refresh of an overlay with uncommitted writes",
            ));
        }
        *cache = None;
        Ok(())
    }

    /// Drops the cache together with any uncommitted writes.
    pub fn discard(&self) {
        *self.cache.borrow_mut() = None;
    }

    /// Returns `true` once the bytes have been fetched.
    pub fn is_cached(&self) -> bool {
        self.cache.borrow().is_some()
    }

    /// Returns `true` if writes are waiting for [`GuestPtr::commit`].
    pub fn is_dirty(&self) -> bool {
        self.cache
            .borrow()
            .as_ref()
            .is_some_and(|cache| !cache.dirty.is_empty())
    }

    /// Returns `true` if the guest may have changed the memory since it was fetched.
    ///
    /// An overlay that has not fetched yet is never stale.
    pub fn is_stale(&self) -> bool {
        let epoch = self.channel.epoch();
        self.cache
            .borrow()
            .as_ref()
            .is_some_and(|cache| cache.epoch != epoch)
    }

    /// A new overlay over `count` elements starting at element `start`.
    ///
    /// The sub-view has its own cache and does not see uncommitted writes of `self`.
    ///
    /// # Errors
    /// [`crate::Error::OutOfBounds`] if the range is not inside `self`.
    pub fn subview(&self, start: usize, count: usize) -> Result<GuestPtr<T>> {
        match start.checked_add(count) {
            Some(end) if end <= self.count => {}
            _ => return Err(OutOfBounds),
        }
        self.view_at(start * size_of::<T>(), count)
    }

    /// A new overlay of `count` values of `U` starting `byte_offset` bytes into `self`.
    ///
    /// Structure overlays use this to hand out bounded views of variable-length payloads.
    ///
    /// # Errors
    /// [`crate::Error::OutOfBounds`] if the range is not inside `self`.
    pub fn view_at<U: GuestValue>(&self, byte_offset: usize, count: usize) -> Result<GuestPtr<U>> {
        let Some(len) = count.checked_mul(size_of::<U>()) else {
            return Err(OutOfBounds);
        };
        self.check_range(byte_offset, len)?;
        GuestPtr::with_policy(
            self.channel.clone(),
            self.address.offset(byte_offset as u64)?,
            count,
            self.policy,
        )
    }
}

impl<T: GuestValue> Drop for GuestPtr<T> {
    fn drop(&mut self) {
        if !self.is_dirty() {
            return;
        }
        if let Err(error) = self.commit() {
            log::error!(
                "dropping overlay at {} with uncommitted writes: {error}",
                self.address
            );
        }
    }
}

impl<T: GuestValue> fmt::Debug for GuestPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestPtr")
            .field("address", &self.address)
            .field("count", &self.count)
            .field("cached", &self.is_cached())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::x86::{PageDirectory, PageTableEntry, PagingMode},
        memory::{GuestPhysicalAddress, GuestVirtualAddress, SnapshotMemory},
        MemoryFault,
    };

    fn physical(address: u64) -> GuestAddress {
        GuestAddress::Physical(GuestPhysicalAddress::new(address))
    }

    fn snapshot(base: u64, data: &[u8]) -> Arc<SnapshotMemory> {
        Arc::new(SnapshotMemory::with_data(base, data).unwrap())
    }

    #[test]
    fn construction_does_not_fault() {
        let memory: Arc<dyn MemoryChannel> = Arc::new(SnapshotMemory::new());
        let ptr = GuestPtr::<u64>::new(memory, physical(0xdead_0000), 4).unwrap();
        assert!(!ptr.is_cached());
        assert_eq!(ptr.byte_len(), 32);

        match ptr.get(0) {
            Err(Error::MemoryAccess { fault, .. }) => assert_eq!(fault, MemoryFault::Unmapped),
            other => panic!("Expected MemoryAccess, got {other:?}"),
        }
    }

    #[test]
    fn values_decode_little_endian() {
        let memory = snapshot(0x1000, &[0x78, 0x56, 0x34, 0x12, 0xff, 0xff, 0xff, 0xff]);
        let ptr = GuestPtr::<u32>::new(memory, physical(0x1000), 2).unwrap();
        assert_eq!(ptr.read_all().unwrap(), vec![0x1234_5678, 0xffff_ffff]);
        assert_eq!(ptr.read_at::<u16>(2).unwrap(), 0x1234);
        assert_eq!(ptr.read_at::<i8>(7).unwrap(), -1);
    }

    #[test]
    fn bounds_are_enforced() {
        let memory = snapshot(0x1000, &[0u8; 16]);
        let ptr = GuestPtr::<u32>::new(memory, physical(0x1000), 2).unwrap();

        assert!(matches!(ptr.get(2), Err(OutOfBounds)));
        assert!(matches!(ptr.set(2, 1), Err(OutOfBounds)));
        assert!(matches!(ptr.read_at::<u32>(5), Err(OutOfBounds)));
        assert!(matches!(ptr.read_at::<u8>(usize::MAX), Err(OutOfBounds)));
        // Out-of-bounds accesses do not fetch.
        assert!(!ptr.is_cached());
    }

    #[test]
    fn read_your_writes_before_commit() {
        let memory = snapshot(0x1000, &[0u8; 8]);
        let ptr = GuestPtr::<u16>::new(memory.clone(), physical(0x1000), 4).unwrap();

        ptr.set(1, 0xbeef).unwrap();
        assert_eq!(ptr.get(1).unwrap(), 0xbeef);
        assert!(ptr.is_dirty());

        let mut raw = [0u8; 2];
        memory
            .read_physical(GuestPhysicalAddress::new(0x1002), &mut raw)
            .unwrap();
        assert_eq!(raw, [0, 0]);

        ptr.commit().unwrap();
        assert!(!ptr.is_dirty());
        memory
            .read_physical(GuestPhysicalAddress::new(0x1002), &mut raw)
            .unwrap();
        assert_eq!(raw, [0xef, 0xbe]);
    }

    #[test]
    fn write_through_flushes_immediately() {
        let memory = snapshot(0x1000, &[0u8; 4]);
        let ptr =
            GuestPtr::<u32>::with_policy(memory.clone(), physical(0x1000), 1, WritePolicy::WriteThrough)
                .unwrap();
        ptr.set(0, 0x0102_0304).unwrap();
        assert!(!ptr.is_dirty());

        let mut raw = [0u8; 4];
        memory
            .read_physical(GuestPhysicalAddress::new(0x1000), &mut raw)
            .unwrap();
        assert_eq!(raw, [4, 3, 2, 1]);
    }

    #[test]
    fn failed_write_through_is_not_applied() {
        let memory = snapshot(0x1000, &[0u8; 4]);
        {
            let ptr = GuestPtr::<u8>::with_policy(
                memory.clone(),
                physical(0x1000),
                4,
                WritePolicy::WriteThrough,
            )
            .unwrap();
            assert_eq!(ptr.get(0).unwrap(), 0);

            memory.inject_fault(0x1000, MemoryFault::Transient, None);
            assert!(ptr.set(0, 0x41).is_err());
            memory.clear_fault(0x1000);

            assert_eq!(ptr.get(0).unwrap(), 0);
            assert!(!ptr.is_dirty());
        }

        let mut raw = [0u8; 1];
        memory
            .read_physical(GuestPhysicalAddress::new(0x1000), &mut raw)
            .unwrap();
        assert_eq!(raw, [0]);
    }

    #[test]
    fn drop_flushes_pending_writes() {
        let memory = snapshot(0x1000, &[0u8; 4]);
        {
            let ptr = GuestPtr::<u8>::new(memory.clone(), physical(0x1000), 4).unwrap();
            ptr.set(3, 0x7f).unwrap();
        }
        let mut raw = [0u8; 1];
        memory
            .read_physical(GuestPhysicalAddress::new(0x1003), &mut raw)
            .unwrap();
        assert_eq!(raw, [0x7f]);
    }

    #[test]
    fn failed_commit_keeps_writes_pending() {
        let memory = snapshot(0x1000, &[0u8; 4]);
        let ptr = GuestPtr::<u8>::new(memory.clone(), physical(0x1000), 4).unwrap();
        ptr.set(0, 1).unwrap();

        memory.inject_fault(0x1000, MemoryFault::PermissionDenied, None);
        assert!(matches!(ptr.commit(), Err(Error::MemoryAccess { .. })));
        assert!(ptr.is_dirty());
        assert_eq!(ptr.get(0).unwrap(), 1);

        memory.clear_fault(0x1000);
        ptr.commit().unwrap();
        assert!(!ptr.is_dirty());
    }

    #[test]
    fn staleness_and_refresh() {
        let memory = snapshot(0x1000, &[1u8; 4]);
        let ptr = GuestPtr::<u8>::new(memory.clone(), physical(0x1000), 4).unwrap();
        assert!(!ptr.is_stale());
        assert_eq!(ptr.get(0).unwrap(), 1);

        // The guest changes memory behind the overlay and resumes.
        memory.load(0x1000, &[9]).unwrap();
        memory.advance_epoch();
        assert!(ptr.is_stale());
        assert_eq!(ptr.get(0).unwrap(), 1);

        ptr.refresh().unwrap();
        assert!(!ptr.is_cached());
        assert_eq!(ptr.get(0).unwrap(), 9);
        assert!(!ptr.is_stale());
    }

    #[test]
    fn refresh_refuses_to_drop_writes() {
        let memory = snapshot(0x1000, &[0u8; 4]);
        let ptr = GuestPtr::<u8>::new(memory, physical(0x1000), 4).unwrap();
        ptr.set(0, 5).unwrap();
        assert!(matches!(ptr.refresh(), Err(Error::InvalidMethod(_))));

        ptr.discard();
        assert!(!ptr.is_dirty());
        assert_eq!(ptr.get(0).unwrap(), 0);
    }

    #[test]
    fn views_are_bounded() {
        let memory = snapshot(0x1000, &[0, 1, 2, 3, 4, 5, 6, 7]);
        let ptr = GuestPtr::<u8>::new(memory, physical(0x1000), 8).unwrap();

        let tail = ptr.subview(4, 4).unwrap();
        assert_eq!(tail.read_all().unwrap(), vec![4, 5, 6, 7]);
        assert!(matches!(ptr.subview(5, 4), Err(OutOfBounds)));

        let word = ptr.view_at::<u16>(6, 1).unwrap();
        assert_eq!(word.get(0).unwrap(), 0x0706);
        assert!(matches!(ptr.view_at::<u32>(6, 1), Err(OutOfBounds)));
    }

    #[test]
    fn virtual_overlay_spans_pages() {
        let memory = SnapshotMemory::new();
        let flags = PageTableEntry::PRESENT.bits();
        // Long mode, va 0x1ffc..0x2004 -> pages 0x5000 and 0x8000
        memory.load(0x1000, &(0x2000 | flags).to_le_bytes()).unwrap();
        memory.load(0x2000, &(0x3000 | flags).to_le_bytes()).unwrap();
        memory.load(0x3000, &(0x4000 | flags).to_le_bytes()).unwrap();
        memory.load(0x4000 + 8, &(0x5000 | flags).to_le_bytes()).unwrap();
        memory.load(0x4000 + 16, &(0x8000 | flags).to_le_bytes()).unwrap();
        memory.load(0x5ffc, &[1, 2, 3, 4]).unwrap();
        memory.load(0x8000, &[5, 6, 7, 8]).unwrap();

        let directory = PageDirectory::new(GuestPhysicalAddress::new(0x1000), PagingMode::Long4);
        let va = GuestVirtualAddress::new(0x1ffc, directory).unwrap();
        let memory = Arc::new(memory);
        let ptr = GuestPtr::<u8>::new(memory.clone(), GuestAddress::Virtual(va), 8).unwrap();
        assert_eq!(ptr.read_all().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);

        ptr.set(4, 0x55).unwrap();
        ptr.commit().unwrap();
        let mut raw = [0u8; 1];
        memory
            .read_physical(GuestPhysicalAddress::new(0x8000), &mut raw)
            .unwrap();
        assert_eq!(raw, [0x55]);

        // An unmapped second page fails the whole read.
        memory.load(0x4000 + 16, &0u64.to_le_bytes()).unwrap();
        let ptr = GuestPtr::<u8>::new(memory, GuestAddress::Virtual(va), 8).unwrap();
        match ptr.get(0) {
            Err(Error::MemoryAccess { address, fault, .. }) => {
                assert_eq!(address, 0x2000);
                assert_eq!(fault, MemoryFault::NotPresent);
            }
            other => panic!("Expected NotPresent, got {other:?}"),
        }
    }

    #[test]
    fn null_and_overflowing_ranges() {
        let memory: Arc<dyn MemoryChannel> = Arc::new(SnapshotMemory::new());
        let directory = PageDirectory::new(GuestPhysicalAddress::new(0x1000), PagingMode::Long4);

        let null = GuestVirtualAddress::new(0, directory).unwrap();
        assert!(matches!(
            GuestPtr::<u8>::new(memory.clone(), GuestAddress::Virtual(null), 1),
            Err(Error::NullAddress)
        ));
        assert!(matches!(
            GuestPtr::<u64>::new(memory.clone(), physical(0x1000), usize::MAX),
            Err(Error::AddressOverflow { .. })
        ));

        // Physical address zero is a real location.
        assert!(GuestPtr::<u8>::new(memory.clone(), physical(0), 1).is_ok());
    }

    #[test]
    fn virtual_zero_without_paging_is_physical_zero() {
        let memory = snapshot(0, &[0x53, 0xff, 0x00, 0xf0]);
        let va = GuestVirtualAddress::new(0, PageDirectory::identity()).unwrap();

        // First real-mode interrupt vector, offset:segment
        let ivt = GuestPtr::<u16>::new(memory, GuestAddress::Virtual(va), 2).unwrap();
        assert_eq!(ivt.read_all().unwrap(), vec![0xff53, 0xf000]);
    }
}
