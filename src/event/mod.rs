//! Intercepted VM occurrences and their delivery.
//!
//! An [`Event`] describes one occurrence on one VCPU: which domain and VCPU trapped, the
//! register snapshot at the time, and an [`EventDetail`] carrying only the fields that are valid
//! for that kind of event. Richer facets are exposed as capabilities: [`Event::exception`],
//! [`Event::system_call`] and friends fail with [`crate::Error::InvalidMethod`] when the event is
//! of a different kind, and the `as_*` forms return `None` instead, for callers that want to
//! probe first.
//!
//! # Key Components
//!
//! - [`Event`] / [`EventDetail`] / [`EventType`] - The event model
//! - [`EventCallback`] - Consumer contract
//! - [`context`] - The calling thread's active event
//! - [`EventDispatcher`] / [`EventSource`] - Per-VCPU delivery loop
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use vmscope::arch::x86::{Exception, Registers};
//! use vmscope::event::{Event, EventDetail, EventType, ExceptionEvent};
//!
//! let event = Event::new(
//!     1,
//!     7,
//!     0,
//!     Arc::new(Registers::default()),
//!     EventDetail::Exception(ExceptionEvent::new(Exception::PageFault, Some(2))),
//! );
//! assert_eq!(event.kind(), EventType::Exception);
//! assert_eq!(event.exception()?.vector(), Exception::PageFault);
//! assert!(event.system_call().is_err());
//! # Ok::<(), vmscope::Error>(())
//! ```

mod callback;
mod capability;
pub mod context;
mod dispatch;
mod kind;

use std::{fmt, sync::Arc};

pub use callback::EventCallback;
pub use capability::{
    ControlRegisterEvent, ExceptionEvent, MemAccessEvent, MemAccessType, MsrAccessEvent,
    SystemCallEvent,
};
pub use dispatch::{EventDispatcher, EventSource, ReplaySource};
pub use kind::{EventType, FastCallType};

use crate::{arch::x86::Registers, Error, Result};

/// The kind-specific part of an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EventDetail {
    FastSyscall(SystemCallEvent),
    FastSyscallRet(SystemCallEvent),
    /// Software interrupt with its vector
    SwInt(u8),
    SwIret,
    CrRead(ControlRegisterEvent),
    CrWrite(ControlRegisterEvent),
    MsrRead(MsrAccessEvent),
    MsrWrite(MsrAccessEvent),
    Exception(ExceptionEvent),
    MemAccess(MemAccessEvent),
    SingleStep,
    Hypercall,
    Reboot,
    Shutdown,
    Unknown,
}

impl EventDetail {
    /// The [`EventType`] this detail belongs to
    #[must_use]
    pub fn kind(&self) -> EventType {
        match self {
            EventDetail::FastSyscall(_) => EventType::FastSyscall,
            EventDetail::FastSyscallRet(_) => EventType::FastSyscallRet,
            EventDetail::SwInt(_) => EventType::SwInt,
            EventDetail::SwIret => EventType::SwIret,
            EventDetail::CrRead(_) => EventType::CrRead,
            EventDetail::CrWrite(_) => EventType::CrWrite,
            EventDetail::MsrRead(_) => EventType::MsrRead,
            EventDetail::MsrWrite(_) => EventType::MsrWrite,
            EventDetail::Exception(_) => EventType::Exception,
            EventDetail::MemAccess(_) => EventType::MemAccess,
            EventDetail::SingleStep => EventType::SingleStep,
            EventDetail::Hypercall => EventType::Hypercall,
            EventDetail::Reboot => EventType::Reboot,
            EventDetail::Shutdown => EventType::Shutdown,
            EventDetail::Unknown => EventType::Unknown,
        }
    }
}

/// A single intercepted VM occurrence.
///
/// The register snapshot is shared and immutable; it describes the VCPU at the moment the
/// event was raised.
#[derive(Debug, Clone)]
pub struct Event {
    id: u64,
    domain_id: u32,
    vcpu: u32,
    registers: Arc<Registers>,
    detail: EventDetail,
}

impl Event {
    /// Creates an event.
    #[must_use]
    pub fn new(
        id: u64,
        domain_id: u32,
        vcpu: u32,
        registers: Arc<Registers>,
        detail: EventDetail,
    ) -> Self {
        Event {
            id,
            domain_id,
            vcpu,
            registers,
            detail,
        }
    }

    /// Unique identifier assigned by the event source
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The domain the event was raised in
    #[must_use]
    pub fn domain_id(&self) -> u32 {
        self.domain_id
    }

    /// The VCPU that trapped
    #[must_use]
    pub fn vcpu(&self) -> u32 {
        self.vcpu
    }

    /// Register state at the time of the event
    #[must_use]
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// The kind of the event
    #[must_use]
    pub fn kind(&self) -> EventType {
        self.detail.kind()
    }

    /// The kind-specific details
    #[must_use]
    pub fn detail(&self) -> &EventDetail {
        &self.detail
    }

    /// Exception details, if this is an exception event
    #[must_use]
    pub fn as_exception(&self) -> Option<&ExceptionEvent> {
        match &self.detail {
            EventDetail::Exception(exception) => Some(exception),
            _ => None,
        }
    }

    /// System call details, for fast system calls and their returns
    #[must_use]
    pub fn as_system_call(&self) -> Option<&SystemCallEvent> {
        match &self.detail {
            EventDetail::FastSyscall(call) | EventDetail::FastSyscallRet(call) => Some(call),
            _ => None,
        }
    }

    /// Control register details, for CR reads and writes
    #[must_use]
    pub fn as_control_register(&self) -> Option<&ControlRegisterEvent> {
        match &self.detail {
            EventDetail::CrRead(cr) | EventDetail::CrWrite(cr) => Some(cr),
            _ => None,
        }
    }

    /// MSR details, for MSR reads and writes
    #[must_use]
    pub fn as_msr(&self) -> Option<&MsrAccessEvent> {
        match &self.detail {
            EventDetail::MsrRead(msr) | EventDetail::MsrWrite(msr) => Some(msr),
            _ => None,
        }
    }

    /// Memory access details
    #[must_use]
    pub fn as_mem_access(&self) -> Option<&MemAccessEvent> {
        match &self.detail {
            EventDetail::MemAccess(access) => Some(access),
            _ => None,
        }
    }

    /// Exception details.
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] if this is not an exception event.
    pub fn exception(&self) -> Result<&ExceptionEvent> {
        self.as_exception()
            .ok_or(Error::InvalidMethod("exception() on a non-exception event"))
    }

    /// System call details.
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] unless this is a fast system call or return event.
    pub fn system_call(&self) -> Result<&SystemCallEvent> {
        self.as_system_call()
            .ok_or(Error::InvalidMethod("system_call() on a non-syscall event"))
    }

    /// Control register details.
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] unless this is a CR access event.
    pub fn control_register(&self) -> Result<&ControlRegisterEvent> {
        self.as_control_register().ok_or(Error::InvalidMethod(
            "control_register() on a non-CR event",
        ))
    }

    /// MSR details.
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] unless this is an MSR access event.
    pub fn msr(&self) -> Result<&MsrAccessEvent> {
        self.as_msr()
            .ok_or(Error::InvalidMethod("msr() on a non-MSR event"))
    }

    /// Memory access details.
    ///
    /// # Errors
    /// [`Error::InvalidMethod`] unless this is a memory access event.
    pub fn mem_access(&self) -> Result<&MemAccessEvent> {
        self.as_mem_access().ok_or(Error::InvalidMethod(
            "mem_access() on a non-memory-access event",
        ))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} domain {} vcpu {}",
            self.id,
            self.kind(),
            self.domain_id,
            self.vcpu
        )?;
        if let Some(exception) = self.as_exception() {
            write!(f, " {}", exception.vector)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arch::x86::Exception, memory::GuestPhysicalAddress};

    fn event(detail: EventDetail) -> Event {
        Event::new(3, 1, 2, Arc::new(Registers::default()), detail)
    }

    #[test]
    fn exception_capability() {
        let e = event(EventDetail::Exception(ExceptionEvent::new(
            Exception::GpFault,
            Some(0x10),
        )));
        assert_eq!(e.kind(), EventType::Exception);
        assert_eq!(e.exception().unwrap().vector(), Exception::GpFault);
        assert_eq!(e.exception().unwrap().error_code, Some(0x10));
        assert!(matches!(e.msr(), Err(Error::InvalidMethod(_))));
        assert!(e.as_system_call().is_none());
        assert_eq!(e.to_string(), "#3 EVENT_EXCEPTION domain 1 vcpu 2 GP_FAULT");
    }

    #[test]
    fn error_code_only_for_vectors_that_push_one() {
        let breakpoint = ExceptionEvent::new(Exception::Int3, Some(5));
        assert_eq!(breakpoint.error_code, None);
    }

    #[test]
    fn non_exception_events_refuse_vector() {
        let e = event(EventDetail::SingleStep);
        assert!(matches!(e.exception(), Err(Error::InvalidMethod(_))));
        assert!(e.as_exception().is_none());
    }

    #[test]
    fn shared_capabilities() {
        let call = SystemCallEvent {
            instruction: FastCallType::Sysret,
            raw_index: 0x55,
            return_address: 0x7ff6_0000_1000,
        };
        let e = event(EventDetail::FastSyscallRet(call));
        assert_eq!(e.system_call().unwrap().raw_index, 0x55);
        assert_eq!(e.kind(), EventType::FastSyscallRet);

        let e = event(EventDetail::CrWrite(ControlRegisterEvent {
            index: 3,
            value: 0x1ad000,
        }));
        assert_eq!(e.control_register().unwrap().value, 0x1ad000);

        let e = event(EventDetail::MemAccess(MemAccessEvent {
            physical_address: GuestPhysicalAddress::new(0x5000),
            virtual_address: None,
            access: MemAccessType::WRITE,
        }));
        let access = e.mem_access().unwrap();
        assert!(access.write_violation());
        assert!(!access.execute_violation());
    }
}
