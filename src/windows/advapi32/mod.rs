//! CryptoAPI structures.

mod algid;
mod blob;

pub use algid::{AlgId, BlobType};
pub use blob::{BlobHeader, BLOB_HEADER_SIZE};
