//! Physical memory dumps mapped from disk.
//!
//! A [`DumpFile`] serves guest physical memory from a raw, flat dump (byte `n` of the file is
//! guest physical address `n`), as produced by most hypervisors' "dump guest memory" commands.
//! The file is memory-mapped read-only; writes go to a copy-on-write page overlay, so the dump
//! on disk is never modified.

use std::{fs, path::Path};

use dashmap::DashMap;
use memmap2::Mmap;

use crate::{
    memory::{GuestPhysicalAddress, MemoryChannel, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE},
    Error::{Error, FileError},
    MemoryFault, Result,
};

/// A raw physical memory dump, memory-mapped from disk.
#[derive(Debug)]
pub struct DumpFile {
    /// Memory-mapped dump data
    data: Mmap,
    /// Pages modified through the channel, by page frame number
    overlay: DashMap<u64, Box<[u8]>>,
}

impl DumpFile {
    /// Memory-maps the dump at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or
    /// [`crate::Error::Error`] if memory mapping fails.
    pub fn open(path: impl AsRef<Path>) -> Result<DumpFile> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(error) => return Err(FileError(error)),
        };

        let mmap = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(error) => return Err(Error(error.to_string())),
        };

        log::debug!("mapped physical memory dump of {} bytes", mmap.len());
        Ok(DumpFile {
            data: mmap,
            overlay: DashMap::new(),
        })
    }

    /// Size of the dumped physical address range in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the dump holds no memory
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of pages written through the channel
    pub fn modified_pages(&self) -> usize {
        self.overlay.len()
    }

    /// Bytes of page `page` as stored in the dump. The last page of a dump whose size is not
    /// page-aligned is shorter than a page.
    fn original(&self, page: u64) -> Option<&[u8]> {
        let start = usize::try_from(page.checked_mul(PAGE_SIZE)?).ok()?;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + PAGE_SIZE as usize).min(self.data.len());
        Some(&self.data[start..end])
    }

    fn walk<F>(&self, address: u64, len: usize, mut op: F) -> std::result::Result<(), MemoryFault>
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
            op(current >> PAGE_SHIFT, done, in_page..in_page + chunk)?;
            done += chunk;
        }
        Ok(())
    }
}

impl MemoryChannel for DumpFile {
    fn read_physical(
        &self,
        address: GuestPhysicalAddress,
        buffer: &mut [u8],
    ) -> std::result::Result<(), MemoryFault> {
        self.walk(address.value(), buffer.len(), |page, done, range| {
            let len = range.len();
            if let Some(modified) = self.overlay.get(&page) {
                let source = modified.get(range).ok_or(MemoryFault::Unmapped)?;
                buffer[done..done + len].copy_from_slice(source);
                return Ok(());
            }
            let original = self.original(page).ok_or(MemoryFault::Unmapped)?;
            let source = original.get(range).ok_or(MemoryFault::Unmapped)?;
            buffer[done..done + len].copy_from_slice(source);
            Ok(())
        })
    }

    fn write_physical(
        &self,
        address: GuestPhysicalAddress,
        data: &[u8],
    ) -> std::result::Result<(), MemoryFault> {
        self.walk(address.value(), data.len(), |page, done, range| {
            let original = self.original(page).ok_or(MemoryFault::Unmapped)?;
            if range.end > original.len() {
                return Err(MemoryFault::Unmapped);
            }
            let mut target = self
                .overlay
                .entry(page)
                .or_insert_with(|| original.to_vec().into_boxed_slice());
            let len = range.len();
            target[range].copy_from_slice(&data[done..done + len]);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn temp_dump(name: &str, data: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("vmscope_{}_{name}.bin", std::process::id()));
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn dump_reads_and_overlays_writes() {
        let mut data = vec![0u8; 0x2000];
        data[0x1000..0x1004].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let path = temp_dump("overlay", &data);

        let dump = DumpFile::open(&path).unwrap();
        assert_eq!(dump.len(), 0x2000);

        let mut buffer = [0u8; 4];
        dump.read_physical(GuestPhysicalAddress::new(0x1000), &mut buffer)
            .unwrap();
        assert_eq!(buffer, [0xde, 0xad, 0xbe, 0xef]);

        dump.write_physical(GuestPhysicalAddress::new(0x0ffe), &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(dump.modified_pages(), 2);
        dump.read_physical(GuestPhysicalAddress::new(0x0ffe), &mut buffer)
            .unwrap();
        assert_eq!(buffer, [1, 2, 3, 4]);

        // The file itself is untouched.
        assert_eq!(std::fs::read(&path).unwrap()[0x1000..0x1004], [0xde, 0xad, 0xbe, 0xef]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn dump_bounds() {
        let path = temp_dump("bounds", &[0x11u8; 0x1800]);
        let dump = DumpFile::open(&path).unwrap();

        let mut buffer = [0u8; 4];
        assert!(dump
            .read_physical(GuestPhysicalAddress::new(0x17fc), &mut buffer)
            .is_ok());
        assert_eq!(
            dump.read_physical(GuestPhysicalAddress::new(0x17fe), &mut buffer),
            Err(MemoryFault::Unmapped)
        );
        assert_eq!(
            dump.write_physical(GuestPhysicalAddress::new(0x1800), &[0]),
            Err(MemoryFault::Unmapped)
        );
        assert_eq!(
            dump.read_physical(GuestPhysicalAddress::new(u64::MAX), &mut buffer),
            Err(MemoryFault::Unmapped)
        );

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn dump_missing_file() {
        match DumpFile::open("/nonexistent/path/to/memory.raw") {
            Err(FileError(io_error)) => {
                assert_eq!(io_error.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected FileError"),
        }
    }
}
