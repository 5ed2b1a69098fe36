use std::fmt;

use thiserror::Error;

use crate::memory::AddressSpace;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The reason a memory-access channel could not satisfy a request.
///
/// Channels report one of these for every failed read or write. The overlay layer wraps it
/// into [`Error::MemoryAccess`] together with the guest address that was being accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum MemoryFault {
    /// The address is not backed by guest memory at all.
    #[strum(serialize = "unmapped")]
    Unmapped,
    /// A page-table entry along the translation path is not present.
    #[strum(serialize = "not present")]
    NotPresent,
    /// The backend refused the access (e.g. a write to a read-only mapping).
    #[strum(serialize = "permission denied")]
    PermissionDenied,
    /// The guest was mid-transition; the same access may succeed if retried.
    #[strum(serialize = "transient failure")]
    Transient,
}

/// Why hypervisor resolution failed.
///
/// Both reasons surface through the single [`Error::UnsupportedHypervisor`] kind, since the
/// remediation is the same, but tooling can still tell them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedReason {
    /// No backend is registered with the resolver.
    NoBackends,
    /// Every registered backend was probed and none attached. Holds `(backend, reason)` pairs
    /// in probe order.
    AttachFailed(Vec<(String, String)>),
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsupportedReason::NoBackends => write!(f, "no hypervisor backend is available"),
            UnsupportedReason::AttachFailed(attempts) => {
                write!(f, "no hypervisor backend attached")?;
                for (backend, reason) in attempts {
                    write!(f, "; {backend}: {reason}")?;
                }
                Ok(())
            }
        }
    }
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Contract violations
/// - [`Error::InvalidMethod`] - Operation called in a state that forbids it (no active event,
///   unsupported event capability, refresh with pending writes)
///
/// ## Guest memory
/// - [`Error::MemoryAccess`] - The memory-access channel could not satisfy a read or write
/// - [`Error::OutOfBounds`] - Access past the declared bound of an overlay
/// - [`Error::AddressOverflow`] - Address arithmetic left the guest address space
/// - [`Error::NullAddress`] - Overlay or translation rooted at a null address
///
/// ## Structural validation
/// - [`Error::Malformed`] - Guest-supplied structure is inconsistent or outside a known enumeration
///
/// ## Backends
/// - [`Error::UnsupportedHypervisor`] - No hypervisor backend attached
///
/// ## I/O and synchronization
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::LockError`] - Poisoned lock
///
/// # Examples
///
/// ```rust,no_run
/// use vmscope::{Error, MemoryFault};
///
/// fn report(result: vmscope::Result<u32>) {
///     match result {
///         Ok(value) => println!("value: {value:#x}"),
///         Err(Error::MemoryAccess { fault: MemoryFault::Transient, .. }) => {
///             eprintln!("guest busy, try again");
///         }
///         Err(Error::Malformed { message, .. }) => eprintln!("hostile structure: {message}"),
///         Err(e) => eprintln!("{e}"),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// An operation was called in a state that forbids it.
    ///
    /// Always a programming-contract violation: reading the active event when none is set,
    /// querying an event capability the event does not carry, refreshing an overlay that still
    /// holds uncommitted writes. Never retried.
    #[error("Invalid method - {0}")]
    InvalidMethod(&'static str),

    /// The memory-access channel could not satisfy a read or write.
    ///
    /// # Fields
    ///
    /// * `address` - Guest address being accessed, in the address space named by `space`
    /// * `space` - Whether `address` is a physical or virtual address
    /// * `fault` - Reason reported by the channel or the page walk
    #[error("Guest memory access failed at {space} address {address:#x}: {fault}")]
    MemoryAccess {
        /// The guest address that could not be accessed
        address: u64,
        /// The address space of `address`
        space: AddressSpace,
        /// What went wrong
        fault: MemoryFault,
    },

    /// The guest-declared structure is damaged or hostile.
    ///
    /// The error includes the source location where the malformation was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An access past the declared bound of an overlay was attempted.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// Guest address arithmetic would have wrapped or left the address space.
    #[error("Address {address:#x} + {offset:#x} leaves the guest address space")]
    AddressOverflow {
        /// The base address
        address: u64,
        /// The offset that was applied
        offset: u64,
    },

    /// An overlay or a translation was rooted at a null address or a null page directory.
    #[error("Null guest address")]
    NullAddress,

    /// No hypervisor backend could be attached.
    #[error("Unsupported hypervisor - {0}")]
    UnsupportedHypervisor(UnsupportedReason),

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// Failed to lock target.
    ///
    /// This error occurs when a mutex or rwlock was poisoned by a panicking holder.
    #[error("Failed to lock target")]
    LockError,
}

impl Error {
    /// Returns `true` if retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::MemoryAccess {
                fault: MemoryFault::Transient,
                ..
            }
        )
    }
}
