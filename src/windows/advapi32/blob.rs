use crate::{
    memory::{GuestAddress, GuestMemory, GuestPtr},
    windows::advapi32::{AlgId, BlobType},
    Result,
};

/// Size of `BLOBHEADER` / `PUBLICKEYSTRUC`.
pub const BLOB_HEADER_SIZE: usize = 8;

const TYPE_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 1;
const RESERVED_OFFSET: usize = 2;
const ALG_ID_OFFSET: usize = 4;

/// The header of a CryptoAPI key BLOB, followed by its key material.
///
/// ```text
/// 0x00  BYTE   bType
/// 0x01  BYTE   bVersion
/// 0x02  WORD   reserved
/// 0x04  ALG_ID aiKeyAlg
/// 0x08  ...    key material
/// ```
///
/// The total length comes from the guest (for example a `pdwDataLen` argument), so it is
/// checked against [`crate::config::MemoryConfig::max_structure_size`] before anything is
/// mapped, and the type tag is validated on construction.
#[derive(Debug)]
pub struct BlobHeader {
    data: GuestPtr<u8>,
    blob_type: BlobType,
}

impl BlobHeader {
    /// Maps the BLOB of `length` bytes at `address`.
    ///
    /// # Errors
    /// - [`crate::Error::Malformed`] if `length` is shorter than the header, larger than the
    ///   configured structure limit, or the type tag is not a known [`BlobType`]
    /// - Any error reading the type tag
    pub fn new(memory: &GuestMemory, address: impl Into<GuestAddress>, length: u64) -> Result<Self> {
        let limit = memory.config().max_structure_size;
        if length < BLOB_HEADER_SIZE as u64 {
            return Err(malformed_error!(
                "BLOB length {} is shorter than its header",
                length
            ));
        }
        if length > limit as u64 {
            return Err(malformed_error!(
                "BLOB length {} exceeds the limit of {} bytes",
                length,
                limit
            ));
        }

        // length <= limit, which is a usize
        let data = memory.map::<u8>(address, length as usize)?;
        Self::from_ptr(data)
    }

    /// Interprets an existing overlay as a BLOB. The overlay's length is the BLOB length.
    ///
    /// # Errors
    /// [`crate::Error::Malformed`] if the overlay is shorter than the header or the type tag is
    /// unknown.
    pub fn from_ptr(data: GuestPtr<u8>) -> Result<Self> {
        if data.len() < BLOB_HEADER_SIZE {
            return Err(malformed_error!(
                "BLOB length {} is shorter than its header",
                data.len()
            ));
        }

        let tag = data.get(TYPE_OFFSET)?;
        let Some(blob_type) = BlobType::from_repr(tag) else {
            return Err(malformed_error!("Unknown BLOB type {:#x}", tag));
        };

        Ok(BlobHeader { data, blob_type })
    }

    /// The validated BLOB type
    #[must_use]
    pub fn blob_type(&self) -> BlobType {
        self.blob_type
    }

    /// `bVersion`
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn version(&self) -> Result<u8> {
        self.data.get(VERSION_OFFSET)
    }

    /// `reserved`, which should be zero
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn reserved(&self) -> Result<u16> {
        self.data.read_at::<u16>(RESERVED_OFFSET)
    }

    /// `aiKeyAlg` as read from the guest
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn raw_algorithm(&self) -> Result<u32> {
        self.data.read_at::<u32>(ALG_ID_OFFSET)
    }

    /// `aiKeyAlg`
    ///
    /// # Errors
    /// [`crate::Error::Malformed`] if the identifier is not a known [`AlgId`], or any error
    /// reading guest memory.
    pub fn algorithm(&self) -> Result<AlgId> {
        let raw = self.raw_algorithm()?;
        AlgId::from_repr(raw).ok_or_else(|| malformed_error!("Unknown ALG_ID {:#x}", raw))
    }

    /// Total BLOB length, header included
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always `false`; a BLOB holds at least its header
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Guest address of the BLOB
    #[must_use]
    pub fn address(&self) -> GuestAddress {
        self.data.address()
    }

    /// The key material following the header.
    ///
    /// # Errors
    /// Address arithmetic errors only; the view is bounded by the BLOB length.
    pub fn key_data(&self) -> Result<GuestPtr<u8>> {
        self.data
            .subview(BLOB_HEADER_SIZE, self.data.len() - BLOB_HEADER_SIZE)
    }
}
