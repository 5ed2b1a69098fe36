use bitflags::bitflags;

use crate::{
    memory::{GuestAddress, GuestMemory, GuestPtr},
    Result,
};

/// Size of `IMAGE_SECTION_HEADER`
pub const IMAGE_SIZEOF_SECTION_HEADER: usize = 0x28;
/// Largest section count the Windows loader accepts
pub const MAX_SECTIONS: u16 = 96;

const NAME_LENGTH: usize = 8;
const VIRTUAL_SIZE_OFFSET: usize = 0x08;
const VIRTUAL_ADDRESS_OFFSET: usize = 0x0c;
const SIZE_OF_RAW_DATA_OFFSET: usize = 0x10;
const POINTER_TO_RAW_DATA_OFFSET: usize = 0x14;
const POINTER_TO_RELOCATIONS_OFFSET: usize = 0x18;
const POINTER_TO_LINENUMBERS_OFFSET: usize = 0x1c;
const NUMBER_OF_RELOCATIONS_OFFSET: usize = 0x20;
const NUMBER_OF_LINENUMBERS_OFFSET: usize = 0x22;
const CHARACTERISTICS_OFFSET: usize = 0x24;

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
    /// `IMAGE_SCN_*` section flags
    pub struct SectionCharacteristics : u32 {
        /// Executable code
        const CNT_CODE = 0x0000_0020;
        /// Initialized data
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// Uninitialized data
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// Comments or other information
        const LNK_INFO = 0x0000_0200;
        /// Not part of the image
        const LNK_REMOVE = 0x0000_0800;
        /// COMDAT data
        const LNK_COMDAT = 0x0000_1000;
        /// Data referenced through the global pointer
        const GPREL = 0x0000_8000;
        /// Extended relocations
        const LNK_NRELOC_OVFL = 0x0100_0000;
        /// Can be discarded
        const MEM_DISCARDABLE = 0x0200_0000;
        /// Cannot be cached
        const MEM_NOT_CACHED = 0x0400_0000;
        /// Not pageable
        const MEM_NOT_PAGED = 0x0800_0000;
        /// Shared between processes
        const MEM_SHARED = 0x1000_0000;
        /// Executable
        const MEM_EXECUTE = 0x2000_0000;
        /// Readable
        const MEM_READ = 0x4000_0000;
        /// Writable
        const MEM_WRITE = 0x8000_0000;
    }
}

/// An `IMAGE_SECTION_HEADER` in guest memory.
///
/// The name is decoded once, on construction, from the 8-byte field up to the first NUL.
/// Every other field is read from the overlay on access.
#[derive(Debug)]
pub struct ImageSectionHeader {
    image_base: GuestAddress,
    data: GuestPtr<u8>,
    name: String,
}

impl ImageSectionHeader {
    /// Maps the section header at `address` of the image loaded at `image_base`.
    ///
    /// # Errors
    /// Any error mapping or reading the name.
    pub fn new(
        memory: &GuestMemory,
        image_base: impl Into<GuestAddress>,
        address: impl Into<GuestAddress>,
    ) -> Result<Self> {
        let data = memory.map::<u8>(address, IMAGE_SIZEOF_SECTION_HEADER)?;
        Self::from_ptr(image_base.into(), data)
    }

    /// Interprets an existing overlay as a section header.
    ///
    /// # Errors
    /// [`crate::Error::OutOfBounds`] if the overlay is shorter than a section header, or any
    /// error reading the name.
    pub fn from_ptr(image_base: GuestAddress, data: GuestPtr<u8>) -> Result<Self> {
        if data.len() < IMAGE_SIZEOF_SECTION_HEADER {
            return Err(crate::Error::OutOfBounds);
        }
        let raw = data.read_at::<[u8; NAME_LENGTH]>(0)?;

        let length = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LENGTH);
        let name = String::from_utf8_lossy(&raw[..length]).into_owned();
        Ok(ImageSectionHeader {
            image_base,
            data,
            name,
        })
    }

    /// Section name, e.g. `.text`
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Guest address of the header itself
    #[must_use]
    pub fn address(&self) -> GuestAddress {
        self.data.address()
    }

    /// `Misc.VirtualSize`
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn virtual_size(&self) -> Result<u32> {
        self.data.read_at(VIRTUAL_SIZE_OFFSET)
    }

    /// `VirtualAddress`, the section's RVA
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn relative_virtual_address(&self) -> Result<u32> {
        self.data.read_at(VIRTUAL_ADDRESS_OFFSET)
    }

    /// Where the section is mapped: the image base plus the section's RVA.
    ///
    /// # Errors
    /// [`crate::Error::AddressOverflow`] if the RVA moves past the end of the address space,
    /// or any error reading guest memory.
    pub fn virtual_address(&self) -> Result<GuestAddress> {
        let rva = self.relative_virtual_address()?;
        self.image_base.offset(u64::from(rva))
    }

    /// `SizeOfRawData`
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn size_of_raw_data(&self) -> Result<u32> {
        self.data.read_at(SIZE_OF_RAW_DATA_OFFSET)
    }

    /// `PointerToRawData`, the file offset of the section's first page
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn pointer_to_raw_data(&self) -> Result<u32> {
        self.data.read_at(POINTER_TO_RAW_DATA_OFFSET)
    }

    /// `PointerToRelocations`, zero for images
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn pointer_to_relocations(&self) -> Result<u32> {
        self.data.read_at(POINTER_TO_RELOCATIONS_OFFSET)
    }

    /// `PointerToLinenumbers`, zero for images
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn pointer_to_linenumbers(&self) -> Result<u32> {
        self.data.read_at(POINTER_TO_LINENUMBERS_OFFSET)
    }

    /// `NumberOfRelocations`
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn number_of_relocations(&self) -> Result<u16> {
        self.data.read_at(NUMBER_OF_RELOCATIONS_OFFSET)
    }

    /// `NumberOfLinenumbers`
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn number_of_linenumbers(&self) -> Result<u16> {
        self.data.read_at(NUMBER_OF_LINENUMBERS_OFFSET)
    }

    /// Section flags. Unknown bits are kept.
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn characteristics(&self) -> Result<SectionCharacteristics> {
        let raw: u32 = self.data.read_at(CHARACTERISTICS_OFFSET)?;
        Ok(SectionCharacteristics::from_bits_retain(raw))
    }

    /// Returns `true` if `rva` falls inside the section's virtual extent.
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn contains_rva(&self, rva: u32) -> Result<bool> {
        let start = u64::from(self.relative_virtual_address()?);
        let end = start + u64::from(self.virtual_size()?);
        Ok((start..end).contains(&u64::from(rva)))
    }
}

/// The section table of a mapped PE image.
///
/// The section count comes from the guest's `IMAGE_FILE_HEADER` and is checked against
/// [`MAX_SECTIONS`] before the table is mapped.
#[derive(Debug)]
pub struct SectionTable {
    sections: Vec<ImageSectionHeader>,
}

impl SectionTable {
    /// Maps `count` consecutive section headers starting at `address`.
    ///
    /// # Errors
    /// - [`crate::Error::Malformed`] if `count` exceeds [`MAX_SECTIONS`]
    /// - Any error mapping the table or reading a section name
    pub fn new(
        memory: &GuestMemory,
        image_base: impl Into<GuestAddress>,
        address: impl Into<GuestAddress>,
        count: u16,
    ) -> Result<Self> {
        if count > MAX_SECTIONS {
            return Err(malformed_error!(
                "Section count {} exceeds the PE limit of {}",
                count,
                MAX_SECTIONS
            ));
        }

        let image_base = image_base.into();
        let table = memory.map::<u8>(address, usize::from(count) * IMAGE_SIZEOF_SECTION_HEADER)?;
        let sections = (0..usize::from(count))
            .map(|index| {
                let data = table.subview(
                    index * IMAGE_SIZEOF_SECTION_HEADER,
                    IMAGE_SIZEOF_SECTION_HEADER,
                )?;
                ImageSectionHeader::from_ptr(image_base, data)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SectionTable { sections })
    }

    /// Number of sections
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Returns `true` if the image has no sections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Section `index`, in table order
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ImageSectionHeader> {
        self.sections.get(index)
    }

    /// Iterates the sections in table order
    pub fn iter(&self) -> std::slice::Iter<'_, ImageSectionHeader> {
        self.sections.iter()
    }

    /// The first section called `name`
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&ImageSectionHeader> {
        self.sections.iter().find(|section| section.name() == name)
    }

    /// The section whose virtual extent contains `rva`.
    ///
    /// # Errors
    /// Any error reading guest memory.
    pub fn section_for_rva(&self, rva: u32) -> Result<Option<&ImageSectionHeader>> {
        for section in &self.sections {
            if section.contains_rva(rva)? {
                return Ok(Some(section));
            }
        }
        Ok(None)
    }
}

impl<'a> IntoIterator for &'a SectionTable {
    type Item = &'a ImageSectionHeader;
    type IntoIter = std::slice::Iter<'a, ImageSectionHeader>;

    fn into_iter(self) -> Self::IntoIter {
        self.sections.iter()
    }
}
