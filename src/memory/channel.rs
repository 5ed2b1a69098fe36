//! The memory-access channel contract.
//!
//! A [`MemoryChannel`] is the single point through which guest memory is read or written. The
//! hypervisor backend provides it; overlays only ever talk to guest memory through one.
//!
//! Channels operate on guest physical memory. [`read_guest`] and [`write_guest`] layer page-wise
//! virtual-to-physical translation on top, so callers can work in either address space.

use std::{sync::Arc, thread, time::Duration};

use crate::{
    arch::x86::{bytes_left_in_page, translate},
    memory::{AddressSpace, GuestAddress, GuestPhysicalAddress},
    Error, MemoryFault, Result,
};

/// Raw access to guest physical memory, provided by a hypervisor backend.
///
/// Implementations must be safe to share between VCPU handler threads. Concurrent accesses to
/// the same guest page must be serialized by the implementation unless the backend already
/// guarantees atomicity.
pub trait MemoryChannel: Send + Sync {
    /// Fills `buffer` from guest physical memory starting at `address`.
    ///
    /// # Errors
    /// Returns the fault that prevented the read. A failed read leaves `buffer` unspecified.
    fn read_physical(
        &self,
        address: GuestPhysicalAddress,
        buffer: &mut [u8],
    ) -> std::result::Result<(), MemoryFault>;

    /// Writes `data` to guest physical memory starting at `address`.
    ///
    /// # Errors
    /// Returns the fault that prevented the write.
    fn write_physical(
        &self,
        address: GuestPhysicalAddress,
        data: &[u8],
    ) -> std::result::Result<(), MemoryFault>;

    /// A counter that changes whenever the guest may have modified its memory, typically
    /// because a VCPU resumed. Caches compare it to detect staleness.
    fn epoch(&self) -> u64 {
        0
    }
}

impl<C: MemoryChannel + ?Sized> MemoryChannel for Arc<C> {
    fn read_physical(
        &self,
        address: GuestPhysicalAddress,
        buffer: &mut [u8],
    ) -> std::result::Result<(), MemoryFault> {
        (**self).read_physical(address, buffer)
    }

    fn write_physical(
        &self,
        address: GuestPhysicalAddress,
        data: &[u8],
    ) -> std::result::Result<(), MemoryFault> {
        (**self).write_physical(address, data)
    }

    fn epoch(&self) -> u64 {
        (**self).epoch()
    }
}

/// A channel that retries transient faults before reporting them.
///
/// Non-transient faults are returned immediately.
pub struct Retrying<C> {
    inner: C,
    retries: u32,
    backoff: Duration,
}

impl<C: MemoryChannel> Retrying<C> {
    /// Wraps `inner`, retrying each transient failure up to `retries` more times.
    pub fn new(inner: C, retries: u32) -> Self {
        Retrying {
            inner,
            retries,
            backoff: Duration::ZERO,
        }
    }

    /// Sleeps for `backoff` between attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// The wrapped channel
    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn attempt<F>(&self, address: GuestPhysicalAddress, mut op: F) -> std::result::Result<(), MemoryFault>
    where
        F: FnMut() -> std::result::Result<(), MemoryFault>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Err(MemoryFault::Transient) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!(
                        "transient fault at {address}, retry {attempt}/{}",
                        self.retries
                    );
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                }
                result => return result,
            }
        }
    }
}

impl<C: MemoryChannel> MemoryChannel for Retrying<C> {
    fn read_physical(
        &self,
        address: GuestPhysicalAddress,
        buffer: &mut [u8],
    ) -> std::result::Result<(), MemoryFault> {
        self.attempt(address, || self.inner.read_physical(address, buffer))
    }

    fn write_physical(
        &self,
        address: GuestPhysicalAddress,
        data: &[u8],
    ) -> std::result::Result<(), MemoryFault> {
        self.attempt(address, || self.inner.write_physical(address, data))
    }

    fn epoch(&self) -> u64 {
        self.inner.epoch()
    }
}

fn access_error(address: u64, space: AddressSpace, fault: MemoryFault) -> Error {
    Error::MemoryAccess {
        address,
        space,
        fault,
    }
}

/// Calls `op` once per physically contiguous chunk of `[address, address + len)`.
///
/// Physical ranges are a single chunk. Virtual ranges are split at page boundaries and each page
/// is translated on its own. `op` receives the physical address, the offset into the range and
/// the chunk length; faults it returns are reported at the caller's address.
fn for_each_chunk<F>(
    channel: &dyn MemoryChannel,
    address: GuestAddress,
    len: usize,
    mut op: F,
) -> Result<()>
where
    F: FnMut(GuestPhysicalAddress, usize, usize) -> std::result::Result<(), MemoryFault>,
{
    if len == 0 {
        return Ok(());
    }
    // The last byte of the range must still be addressable.
    address.offset(len as u64 - 1)?;

    match address {
        GuestAddress::Physical(base) => {
            op(base, 0, len).map_err(|fault| access_error(base.value(), AddressSpace::Physical, fault))
        }
        GuestAddress::Virtual(base) => {
            let mut done = 0usize;
            while done < len {
                let va = base.offset(done as u64)?;
                let chunk = (bytes_left_in_page(va.value()) as usize).min(len - done);
                let pa = translate(channel, va.directory(), va.value())?;
                op(pa, done, chunk)
                    .map_err(|fault| access_error(va.value(), AddressSpace::Virtual, fault))?;
                done += chunk;
            }
            Ok(())
        }
    }
}

/// Reads `buffer.len()` bytes of guest memory at `address`.
///
/// # Errors
/// Returns [`Error::MemoryAccess`] naming the first address that could not be read, or
/// [`Error::AddressOverflow`] if the range leaves the address space.
pub fn read_guest(channel: &dyn MemoryChannel, address: GuestAddress, buffer: &mut [u8]) -> Result<()> {
    let len = buffer.len();
    for_each_chunk(channel, address, len, |pa, offset, chunk| {
        channel.read_physical(pa, &mut buffer[offset..offset + chunk])
    })
}

/// Writes `data` to guest memory at `address`.
///
/// # Errors
/// As for [`read_guest`]. Chunks before the failing one may already have been written.
pub fn write_guest(channel: &dyn MemoryChannel, address: GuestAddress, data: &[u8]) -> Result<()> {
    for_each_chunk(channel, address, data.len(), |pa, offset, chunk| {
        channel.write_physical(pa, &data[offset..offset + chunk])
    })
}
