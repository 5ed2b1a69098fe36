use strum::{EnumCount, EnumIter, FromRepr};

/// x86 exception vectors.
///
/// The string form of each vector is its conventional short name (`PAGE_FAULT`, `GP_FAULT`, ...).
/// Vectors outside the architecturally defined range map to [`Exception::Unknown`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, EnumIter, EnumCount, FromRepr,
)]
#[repr(u8)]
pub enum Exception {
    /// #DE
    #[strum(serialize = "DIVIDE_ERROR")]
    DivideError = 0,
    /// #DB
    #[strum(serialize = "DEBUG")]
    Debug = 1,
    /// Non-maskable interrupt
    #[strum(serialize = "NMI")]
    Nmi = 2,
    /// #BP, raised by `int3`
    #[strum(serialize = "INT3")]
    Int3 = 3,
    /// #OF
    #[strum(serialize = "OVERFLOW")]
    Overflow = 4,
    /// #BR
    #[strum(serialize = "BOUNDS")]
    Bounds = 5,
    /// #UD
    #[strum(serialize = "INVALID_OP")]
    InvalidOp = 6,
    /// #NM
    #[strum(serialize = "NO_DEVICE")]
    NoDevice = 7,
    /// #DF
    #[strum(serialize = "DOUBLE_FAULT")]
    DoubleFault = 8,
    /// Coprocessor segment overrun
    #[strum(serialize = "COPRO_SEG")]
    CoproSeg = 9,
    /// #TS
    #[strum(serialize = "INVALID_TSS")]
    InvalidTss = 10,
    /// #NP
    #[strum(serialize = "NO_SEGMENT")]
    NoSegment = 11,
    /// #SS
    #[strum(serialize = "STACK_ERROR")]
    StackError = 12,
    /// #GP
    #[strum(serialize = "GP_FAULT")]
    GpFault = 13,
    /// #PF
    #[strum(serialize = "PAGE_FAULT")]
    PageFault = 14,
    /// Reserved vector 15
    #[strum(serialize = "SPURIOUS_INT")]
    SpuriousInt = 15,
    /// #MF
    #[strum(serialize = "COPRO_ERROR")]
    CoproError = 16,
    /// #AC
    #[strum(serialize = "ALIGNMENT_CHECK")]
    AlignmentCheck = 17,
    /// #MC
    #[strum(serialize = "MACHINE_CHECK")]
    MachineCheck = 18,
    /// #XM
    #[strum(serialize = "SIMD_ERROR")]
    SimdError = 19,
    /// Any other vector
    #[strum(serialize = "UNKNOWN")]
    Unknown = 0xff,
}

impl Exception {
    /// Maps a raw vector number.
    #[must_use]
    pub fn from_vector(vector: u8) -> Self {
        match Exception::from_repr(vector) {
            Some(exception) => exception,
            None => Exception::Unknown,
        }
    }

    /// The raw vector number. [`Exception::Unknown`] has no vector and returns `None`.
    #[must_use]
    pub fn vector(self) -> Option<u8> {
        match self {
            Exception::Unknown => None,
            other => Some(other as u8),
        }
    }

    /// Returns `true` if the CPU pushes an error code for this exception.
    #[must_use]
    pub fn has_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::NoSegment
                | Exception::StackError
                | Exception::GpFault
                | Exception::PageFault
                | Exception::AlignmentCheck
        )
    }
}
