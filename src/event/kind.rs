use strum::{EnumCount, EnumIter};

/// The kind of an intercepted VM occurrence.
///
/// The string form is the conventional upper-case name, e.g. `EVENT_FAST_SYSCALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, EnumIter, EnumCount)]
pub enum EventType {
    /// SYSCALL or SYSENTER executed
    #[strum(serialize = "EVENT_FAST_SYSCALL")]
    FastSyscall,
    /// SYSRET or SYSEXIT executed
    #[strum(serialize = "EVENT_FAST_SYSCALL_RET")]
    FastSyscallRet,
    /// Software interrupt (`int n`)
    #[strum(serialize = "EVENT_SW_INT")]
    SwInt,
    /// Return from a software interrupt
    #[strum(serialize = "EVENT_SW_IRET")]
    SwIret,
    /// Control register read
    #[strum(serialize = "EVENT_CR_READ")]
    CrRead,
    /// Control register write
    #[strum(serialize = "EVENT_CR_WRITE")]
    CrWrite,
    /// RDMSR
    #[strum(serialize = "EVENT_MSR_READ")]
    MsrRead,
    /// WRMSR
    #[strum(serialize = "EVENT_MSR_WRITE")]
    MsrWrite,
    /// CPU exception
    #[strum(serialize = "EVENT_EXCEPTION")]
    Exception,
    /// Access to a page whose permissions were restricted by the hypervisor
    #[strum(serialize = "EVENT_MEM_ACCESS")]
    MemAccess,
    /// Single-step trap
    #[strum(serialize = "EVENT_SINGLE_STEP")]
    SingleStep,
    /// Hypercall from the guest
    #[strum(serialize = "EVENT_HYPERCALL")]
    Hypercall,
    /// The guest is rebooting
    #[strum(serialize = "EVENT_REBOOT")]
    Reboot,
    /// The guest is shutting down
    #[strum(serialize = "EVENT_SHUTDOWN")]
    Shutdown,
    /// Anything the backend could not classify
    #[strum(serialize = "EVENT_UNKNOWN")]
    Unknown,
}

/// The instruction behind a fast system call event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, EnumIter)]
pub enum FastCallType {
    #[allow(missing_docs)]
    #[strum(serialize = "FASTCALL_SYSCALL")]
    Syscall,
    #[allow(missing_docs)]
    #[strum(serialize = "FASTCALL_SYSRET")]
    Sysret,
    #[allow(missing_docs)]
    #[strum(serialize = "FASTCALL_SYSENTER")]
    Sysenter,
    #[allow(missing_docs)]
    #[strum(serialize = "FASTCALL_SYSEXIT")]
    Sysexit,
    #[allow(missing_docs)]
    #[strum(serialize = "FASTCALL_UNKNOWN")]
    Unknown,
}

impl FastCallType {
    /// Returns `true` for the return half of the pair (SYSRET, SYSEXIT).
    #[must_use]
    pub fn is_return(self) -> bool {
        matches!(self, FastCallType::Sysret | FastCallType::Sysexit)
    }
}
