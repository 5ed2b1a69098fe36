//! Little-endian value decoding for guest memory.
//!
//! Guest structures on x86 are little-endian. [`GuestValue`] describes the plain-old-data types
//! an overlay can be typed over, and the `read_le*` / `write_le*` helpers move them in and out of
//! byte buffers with bounds checks. The helpers never panic on short input; they return
//! [`crate::Error::OutOfBounds`].
//!
//! # Examples
//!
//! ```rust
//! use vmscope::memory::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 0x0102_u16)?;
//! write_le_at(&mut data, &mut offset, 0xdead_beef_u32)?;
//! assert_eq!(offset, 6);
//!
//! let mut offset = 0;
//! let first: u16 = read_le_at(&data, &mut offset)?;
//! let second: u32 = read_le_at(&data, &mut offset)?;
//! assert_eq!((first, second), (0x0102, 0xdead_beef));
//! # Ok::<(), vmscope::Error>(())
//! ```

use crate::{Error::OutOfBounds, Result};

/// A fixed-size value that can be decoded from, and encoded into, guest memory.
///
/// Each implementation defines a `Bytes` associated type, the byte array of exactly
/// `size_of::<Self>()` bytes that holds the little-endian encoding.
pub trait GuestValue: Sized + Copy {
    /// Byte array holding the encoded value.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decode from little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encode to little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_guest_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl GuestValue for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_guest_value!(u8, i8, u16, i16, u32, i32, u64, i64);

// Fixed-size byte arrays, e.g. the 8-byte name of a PE section.
impl<const N: usize> GuestValue for [u8; N] {
    type Bytes = [u8; N];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        bytes
    }

    fn to_le_bytes(self) -> Self::Bytes {
        self
    }
}

/// Reads a `T` from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `T`.
pub fn read_le<T: GuestValue>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a `T` at `offset` and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit inside `data`.
pub fn read_le_at<T: GuestValue>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Writes `value` at `offset` and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit inside `data`.
pub fn write_le_at<T: GuestValue>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let bytes = value.to_le_bytes();
    data[*offset..end].copy_from_slice(bytes.as_ref());
    *offset = end;

    Ok(())
}
