use bitflags::bitflags;

use crate::{arch::x86::Exception, event::FastCallType, memory::GuestPhysicalAddress};

/// Details of an exception event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEvent {
    /// The exception that was raised
    pub vector: Exception,
    /// The error code pushed by the CPU, for exceptions that have one
    pub error_code: Option<u32>,
}

impl ExceptionEvent {
    /// Creates the details for `vector`. The error code is dropped for vectors that never push
    /// one.
    #[must_use]
    pub fn new(vector: Exception, error_code: Option<u32>) -> Self {
        ExceptionEvent {
            vector,
            error_code: error_code.filter(|_| vector.has_error_code()),
        }
    }

    /// The exception vector
    #[must_use]
    pub fn vector(&self) -> Exception {
        self.vector
    }
}

/// Details of a fast system call or its return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemCallEvent {
    /// The instruction that was executed
    pub instruction: FastCallType,
    /// RAX at the time of the call
    pub raw_index: u64,
    /// Where the call returns to
    pub return_address: u64,
}

/// Details of a control register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegisterEvent {
    /// Control register number (0, 2, 3, 4 or 8)
    pub index: u8,
    /// The value read, or the value about to be written
    pub value: u64,
}

/// Details of an MSR access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrAccessEvent {
    /// MSR index (ECX)
    pub index: u32,
    /// The value read, or the value about to be written
    pub value: u64,
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
    /// Access types of a memory access event
    pub struct MemAccessType : u8 {
        /// Data read
        const READ = 0x1;
        /// Data write
        const WRITE = 0x2;
        /// Instruction fetch
        const EXECUTE = 0x4;
    }
}

/// Details of a memory access violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccessEvent {
    /// The guest physical address that was accessed
    pub physical_address: GuestPhysicalAddress,
    /// The linear address, when the hardware reported one
    pub virtual_address: Option<u64>,
    /// What kind of access trapped
    pub access: MemAccessType,
}

impl MemAccessEvent {
    #[allow(missing_docs)]
    #[must_use]
    pub fn read_violation(&self) -> bool {
        self.access.contains(MemAccessType::READ)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn write_violation(&self) -> bool {
        self.access.contains(MemAccessType::WRITE)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn execute_violation(&self) -> bool {
        self.access.contains(MemAccessType::EXECUTE)
    }
}
