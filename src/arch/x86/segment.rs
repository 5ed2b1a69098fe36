use crate::{Error, Result};

/// A segment selector as loaded into a segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SegmentSelector(u16);

impl SegmentSelector {
    /// Wraps a raw selector value.
    #[must_use]
    pub const fn new(value: u16) -> Self {
        SegmentSelector(value)
    }

    /// Descriptor table index
    #[must_use]
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    /// `true` if the selector refers to the LDT
    #[must_use]
    pub const fn table_indicator(self) -> bool {
        self.0 & 0x4 != 0
    }

    /// Requested privilege level
    #[must_use]
    pub const fn rpl(self) -> u8 {
        (self.0 & 0x3) as u8
    }

    /// The raw selector
    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }
}

/// The hidden part of a segment register.
///
/// Several descriptor bits only have a meaning for code or data segments (S bit set). Reading
/// them from a system segment (TSS, LDT, gates) fails with [`Error::InvalidMethod`], as does
/// reading a code-only bit from a data segment and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    selector: SegmentSelector,
    base: u64,
    limit: u32,
    kind: u8,
    present: bool,
    dpl: u8,
    db: bool,
    s: bool,
    long: bool,
    granularity: bool,
    avl: bool,
}

impl Segment {
    /// Builds a segment from the access-rights word used by VMX and KVM
    /// (type in bits 0..4, S bit 4, DPL bits 5..7, P bit 7, AVL bit 12, L bit 13, D/B bit 14,
    /// G bit 15).
    #[must_use]
    pub const fn from_access_rights(
        selector: SegmentSelector,
        base: u64,
        limit: u32,
        access_rights: u32,
    ) -> Self {
        Segment {
            selector,
            base,
            limit,
            kind: (access_rights & 0xf) as u8,
            s: access_rights & (1 << 4) != 0,
            dpl: ((access_rights >> 5) & 0x3) as u8,
            present: access_rights & (1 << 7) != 0,
            avl: access_rights & (1 << 12) != 0,
            long: access_rights & (1 << 13) != 0,
            db: access_rights & (1 << 14) != 0,
            granularity: access_rights & (1 << 15) != 0,
        }
    }

    /// Segment base address
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Segment limit
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// The selector
    #[must_use]
    pub const fn selector(&self) -> SegmentSelector {
        self.selector
    }

    /// Present bit
    #[must_use]
    pub const fn present(&self) -> bool {
        self.present
    }

    /// Descriptor privilege level
    #[must_use]
    pub const fn dpl(&self) -> u8 {
        self.dpl
    }

    /// `true` for code and data segments, `false` for system segments
    #[must_use]
    pub const fn s(&self) -> bool {
        self.s
    }

    /// The 4-bit descriptor type
    #[must_use]
    pub const fn kind(&self) -> u8 {
        self.kind
    }

    fn verify_s(&self) -> Result<()> {
        if !self.s {
            return Err(Error::InvalidMethod("attribute of a system segment"));
        }
        Ok(())
    }

    fn verify_code(&self) -> Result<()> {
        if !self.code()? {
            return Err(Error::InvalidMethod("code attribute of a data segment"));
        }
        Ok(())
    }

    fn verify_data(&self) -> Result<()> {
        if self.code()? {
            return Err(Error::InvalidMethod("data attribute of a code segment"));
        }
        Ok(())
    }

    /// Granularity bit
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] for system segments.
    pub fn granularity(&self) -> Result<bool> {
        self.verify_s()?;
        Ok(self.granularity)
    }

    /// Default operation size bit
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] for system segments.
    pub fn db(&self) -> Result<bool> {
        self.verify_s()?;
        Ok(self.db)
    }

    /// 64-bit code segment bit
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] for system segments.
    pub fn long_mode(&self) -> Result<bool> {
        self.verify_s()?;
        Ok(self.long)
    }

    /// Available-for-software bit
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] for system segments.
    pub fn avl(&self) -> Result<bool> {
        self.verify_s()?;
        Ok(self.avl)
    }

    /// `true` for code segments
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] for system segments.
    pub fn code(&self) -> Result<bool> {
        self.verify_s()?;
        Ok(self.kind & 0x8 != 0)
    }

    /// `true` for data segments
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] for system segments.
    pub fn data(&self) -> Result<bool> {
        Ok(!self.code()?)
    }

    /// Accessed bit
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] for system segments.
    pub fn accessed(&self) -> Result<bool> {
        self.verify_s()?;
        Ok(self.kind & 0x1 != 0)
    }

    /// Expand-down bit of a data segment
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] unless this is a data segment.
    pub fn expand_down(&self) -> Result<bool> {
        self.verify_data()?;
        Ok(self.kind & 0x4 != 0)
    }

    /// Writable bit of a data segment
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] unless this is a data segment.
    pub fn writable(&self) -> Result<bool> {
        self.verify_data()?;
        Ok(self.kind & 0x2 != 0)
    }

    /// Conforming bit of a code segment
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] unless this is a code segment.
    pub fn conforming(&self) -> Result<bool> {
        self.verify_code()?;
        Ok(self.kind & 0x4 != 0)
    }

    /// Readable bit of a code segment
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] unless this is a code segment.
    pub fn readable(&self) -> Result<bool> {
        self.verify_code()?;
        Ok(self.kind & 0x2 != 0)
    }
}
