//! Terminated and counted strings in guest memory.
//!
//! The length of a guest string is itself guest data. Every scan here is capped: a terminator
//! that does not appear within `max_length` elements truncates the string at the cap instead of
//! reading on. Pages are read one at a time, so a string that ends just before an unmapped page
//! is still found; a page fault before the terminator is an error.

use std::{mem::size_of, sync::Arc};

use widestring::U16String;

use crate::{
    arch::x86::bytes_left_in_page,
    memory::{read_guest, read_le, GuestAddress, GuestPtr, GuestValue, MemoryChannel},
    Result,
};

/// Counts the elements before the first zero element at `address`, reading at most
/// `max_length` elements.
///
/// # Errors
/// Any error of the channel for a page read before the terminator (or the cap) was reached.
pub fn terminated_length<T>(
    channel: &dyn MemoryChannel,
    address: GuestAddress,
    max_length: usize,
) -> Result<usize>
where
    T: GuestValue + PartialEq + Default,
{
    let size = size_of::<T>();
    let mut found = 0usize;
    let mut consumed = 0u64;
    // Bytes of an element that straddles a page boundary.
    let mut pending: Vec<u8> = Vec::with_capacity(size * 2);

    while found < max_length {
        let allowed = (max_length - found).saturating_mul(size) - pending.len();
        let cursor = address.offset(consumed)?;
        let chunk_len = (bytes_left_in_page(cursor.value()) as usize).min(allowed);

        let mut chunk = vec![0u8; chunk_len];
        read_guest(channel, cursor, &mut chunk)?;
        pending.extend_from_slice(&chunk);
        consumed += chunk_len as u64;

        let mut offset = 0;
        while pending.len() - offset >= size {
            let value: T = read_le(&pending[offset..])?;
            if value == T::default() {
                return Ok(found);
            }
            found += 1;
            offset += size;
        }
        pending.drain(..offset);
    }

    log::debug!("string at {address} truncated at {max_length} elements");
    Ok(found)
}

/// Maps the NUL-terminated byte string at `address`, excluding the terminator.
///
/// # Errors
/// As for [`terminated_length`].
pub fn map_cstring(
    channel: Arc<dyn MemoryChannel>,
    address: GuestAddress,
    max_length: usize,
) -> Result<GuestPtr<u8>> {
    let length = terminated_length::<u8>(channel.as_ref(), address, max_length)?;
    GuestPtr::new(channel, address, length)
}

/// Maps the NUL-terminated UTF-16 string at `address`, excluding the terminator.
///
/// # Errors
/// As for [`terminated_length`].
pub fn map_wstring(
    channel: Arc<dyn MemoryChannel>,
    address: GuestAddress,
    max_length: usize,
) -> Result<GuestPtr<u16>> {
    let length = terminated_length::<u16>(channel.as_ref(), address, max_length)?;
    GuestPtr::new(channel, address, length)
}

/// Maps `count` elements whose count was read from the guest.
///
/// # Errors
/// [`crate::Error::Malformed`] if the declared size exceeds `max_bytes`.
pub fn map_counted<T: GuestValue>(
    channel: Arc<dyn MemoryChannel>,
    address: GuestAddress,
    count: u64,
    max_bytes: usize,
) -> Result<GuestPtr<T>> {
    let bytes = count.checked_mul(size_of::<T>() as u64);
    match bytes {
        Some(bytes) if bytes <= max_bytes as u64 => GuestPtr::new(channel, address, count as usize),
        _ => Err(malformed_error!(
            "Declared count {} at {} exceeds the limit of {} bytes",
            count,
            address,
            max_bytes
        )),
    }
}

impl GuestPtr<u8> {
    /// Decodes the bytes as text, replacing invalid UTF-8 sequences.
    ///
    /// # Errors
    /// Any error of the fetch.
    pub fn to_string_lossy(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.bytes()?).into_owned())
    }
}

impl GuestPtr<u16> {
    /// The UTF-16 code units of the string.
    ///
    /// # Errors
    /// Any error of the fetch.
    pub fn to_u16string(&self) -> Result<U16String> {
        Ok(U16String::from_vec(self.read_all()?))
    }

    /// Decodes the string, replacing unpaired surrogates.
    ///
    /// # Errors
    /// Any error of the fetch.
    pub fn to_string_lossy(&self) -> Result<String> {
        Ok(self.to_u16string()?.to_string_lossy())
    }
}
