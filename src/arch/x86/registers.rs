use bitflags::bitflags;

use crate::{
    arch::x86::{PageDirectory, PagingMode, Segment},
    memory::GuestPhysicalAddress,
};

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
    /// Control register 0
    pub struct Cr0 : u64 {
        /// Protected mode enable
        const PE = 1 << 0;
        /// Monitor coprocessor
        const MP = 1 << 1;
        /// x87 emulation
        const EM = 1 << 2;
        /// Task switched
        const TS = 1 << 3;
        /// Extension type
        const ET = 1 << 4;
        /// Numeric error reporting
        const NE = 1 << 5;
        /// Supervisor writes honour read-only pages
        const WP = 1 << 16;
        /// Alignment mask
        const AM = 1 << 18;
        /// Not write-through
        const NW = 1 << 29;
        /// Cache disable
        const CD = 1 << 30;
        /// Paging enable
        const PG = 1 << 31;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
    /// Control register 4
    pub struct Cr4 : u64 {
        /// Virtual-8086 mode extensions
        const VME = 1 << 0;
        /// Protected-mode virtual interrupts
        const PVI = 1 << 1;
        /// Time stamp disable
        const TSD = 1 << 2;
        /// Debugging extensions
        const DE = 1 << 3;
        /// Page size extensions
        const PSE = 1 << 4;
        /// Physical address extension
        const PAE = 1 << 5;
        /// Machine check enable
        const MCE = 1 << 6;
        /// Page global enable
        const PGE = 1 << 7;
        /// Performance counter enable
        const PCE = 1 << 8;
        /// FXSAVE/FXRSTOR support
        const OSFXSR = 1 << 9;
        /// Unmasked SIMD exceptions
        const OSXMMEXCPT = 1 << 10;
        /// User-mode instruction prevention
        const UMIP = 1 << 11;
        /// 57-bit linear addresses
        const LA57 = 1 << 12;
        /// VMX enable
        const VMXE = 1 << 13;
        /// SMX enable
        const SMXE = 1 << 14;
        /// FSGSBASE instructions
        const FSGSBASE = 1 << 16;
        /// Process-context identifiers
        const PCIDE = 1 << 17;
        /// XSAVE enable
        const OSXSAVE = 1 << 18;
        /// Supervisor-mode execution prevention
        const SMEP = 1 << 20;
        /// Supervisor-mode access prevention
        const SMAP = 1 << 21;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
    /// Extended feature enable register (MSR 0xC0000080)
    pub struct Efer : u64 {
        /// SYSCALL/SYSRET enable
        const SCE = 1 << 0;
        /// Long mode enable
        const LME = 1 << 8;
        /// Long mode active
        const LMA = 1 << 10;
        /// No-execute enable
        const NXE = 1 << 11;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
    /// The RFLAGS register
    pub struct RFlags : u64 {
        /// Carry
        const CF = 1 << 0;
        /// Parity
        const PF = 1 << 2;
        /// Auxiliary carry
        const AF = 1 << 4;
        /// Zero
        const ZF = 1 << 6;
        /// Sign
        const SF = 1 << 7;
        /// Trap (single step)
        const TF = 1 << 8;
        /// Interrupt enable
        const IF = 1 << 9;
        /// Direction
        const DF = 1 << 10;
        /// Overflow
        const OF = 1 << 11;
        /// Nested task
        const NT = 1 << 14;
        /// Resume
        const RF = 1 << 16;
        /// Virtual-8086 mode
        const VM = 1 << 17;
        /// Alignment check
        const AC = 1 << 18;
        /// Virtual interrupt
        const VIF = 1 << 19;
        /// Virtual interrupt pending
        const VIP = 1 << 20;
        /// CPUID available
        const ID = 1 << 21;
    }
}

/// Base and limit of the GDT or IDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    /// Linear base address
    pub base: u64,
    /// Table limit in bytes
    pub limit: u32,
}

/// A snapshot of a VCPU's architectural state at the time of an event.
///
/// Events hold their snapshot immutably; it describes the VCPU at the moment it trapped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: RFlags,

    pub cr0: Cr0,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: Cr4,
    pub cr8: u64,
    pub efer: Efer,

    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldt: Segment,

    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
}

impl Registers {
    /// The paging mode selected by CR0.PG, EFER.LMA and CR4.PAE.
    #[must_use]
    pub fn paging_mode(&self) -> PagingMode {
        if !self.cr0.contains(Cr0::PG) {
            PagingMode::Disabled
        } else if self.efer.contains(Efer::LMA) {
            PagingMode::Long4
        } else if self.cr4.contains(Cr4::PAE) {
            PagingMode::Pae
        } else {
            PagingMode::Legacy32
        }
    }

    /// The page tables virtual addresses of this VCPU are translated through.
    #[must_use]
    pub fn page_directory(&self) -> PageDirectory {
        PageDirectory::new(GuestPhysicalAddress::new(self.cr3), self.paging_mode())
    }

    /// Returns `true` if the VCPU executes 64-bit code.
    #[must_use]
    pub fn is_64bit_code(&self) -> bool {
        self.efer.contains(Efer::LMA) && self.cs.long_mode().unwrap_or(false)
    }

    /// Current privilege level, taken from the CS selector.
    #[must_use]
    pub fn cpl(&self) -> u8 {
        self.cs.selector().rpl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::SegmentSelector;

    #[test]
    fn paging_mode_selection() {
        let mut regs = Registers::default();
        assert_eq!(regs.paging_mode(), PagingMode::Disabled);

        regs.cr0 = Cr0::PE | Cr0::PG;
        assert_eq!(regs.paging_mode(), PagingMode::Legacy32);

        regs.cr4 = Cr4::PAE;
        assert_eq!(regs.paging_mode(), PagingMode::Pae);

        regs.efer = Efer::LME | Efer::LMA;
        regs.cr3 = 0x1ad000;
        let directory = regs.page_directory();
        assert_eq!(directory.mode, PagingMode::Long4);
        assert_eq!(directory.base.value(), 0x1ad000);
    }

    #[test]
    fn code_width_and_privilege() {
        let mut regs = Registers {
            cr0: Cr0::PE | Cr0::PG,
            cr4: Cr4::PAE,
            efer: Efer::LME | Efer::LMA,
            ..Default::default()
        };
        regs.cs = Segment::from_access_rights(
            SegmentSelector::new(0x33),
            0,
            0,
            0xb | 1 << 4 | 3 << 5 | 1 << 7 | 1 << 13,
        );
        assert!(regs.is_64bit_code());
        assert_eq!(regs.cpl(), 3);

        // Compatibility mode: long mode active, CS.L clear.
        regs.cs = Segment::from_access_rights(SegmentSelector::new(0x23), 0, 0, 0xb | 1 << 4 | 1 << 7);
        assert!(!regs.is_64bit_code());
    }
}
