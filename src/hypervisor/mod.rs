//! Hypervisor backends and their resolution.
//!
//! A [`Hypervisor`] identifies a backend and attaches to its domains; a [`Domain`] exposes the
//! guest's physical memory channel and per-VCPU register state. [`HypervisorResolver`] probes
//! registered backends in priority order and keeps the first that attaches. [`instance`] is the
//! process-wide resolver built from [`crate::config::VmiConfig::from_env`].
//!
//! The only built-in backend is [`SnapshotHypervisor`], which serves a raw physical memory dump.
//! Live backends (KVM, Xen, ...) register themselves through [`HypervisorResolver::register`].

mod resolver;
mod snapshot;

use std::{fmt, sync::Arc};

pub use resolver::{instance, resolver, HypervisorResolver, ProbeFn};
pub use snapshot::{SnapshotDomain, SnapshotHypervisor};

use crate::{
    arch::x86::Registers,
    config::MemoryConfig,
    memory::{GuestMemory, MemoryChannel},
    Result,
};

/// Identity of a running domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInformation {
    /// Domain name
    pub domain_name: String,
    /// Domain id
    pub domain_id: u32,
}

/// Which domain [`Hypervisor::attach`] should attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainSelector {
    /// By numeric id
    Id(u32),
    /// By name
    Name(String),
}

impl DomainSelector {
    /// Returns `true` if `info` is the domain this selector names.
    #[must_use]
    pub fn matches(&self, info: &DomainInformation) -> bool {
        match self {
            DomainSelector::Id(id) => *id == info.domain_id,
            DomainSelector::Name(name) => *name == info.domain_name,
        }
    }
}

impl fmt::Display for DomainSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainSelector::Id(id) => write!(f, "id {id}"),
            DomainSelector::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// A hypervisor backend.
pub trait Hypervisor: Send + Sync {
    /// Backend name, e.g. `KVM`
    fn name(&self) -> &str;

    /// Backend version
    fn version(&self) -> &str;

    /// Out-of-band patch level, for backends that report one
    fn patch_version(&self) -> Option<&str> {
        None
    }

    /// Name of the library talking to the backend
    fn library_name(&self) -> &str {
        env!("CARGO_PKG_NAME")
    }

    /// Version of the library talking to the backend
    fn library_version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    /// Lists the domains currently running.
    ///
    /// # Errors
    /// Any backend failure.
    fn running_domains(&self) -> Result<Vec<DomainInformation>>;

    /// Attaches to a domain.
    ///
    /// # Errors
    /// If the domain does not exist or cannot be attached.
    fn attach(&self, selector: &DomainSelector) -> Result<Box<dyn Domain>>;
}

/// An attached guest.
pub trait Domain: Send + Sync {
    /// Domain id
    fn id(&self) -> u32;

    /// Domain name
    fn name(&self) -> &str;

    /// Number of VCPUs
    fn vcpu_count(&self) -> u32;

    /// The guest's physical memory
    fn memory(&self) -> Arc<dyn MemoryChannel>;

    /// A snapshot of `vcpu`'s registers.
    ///
    /// # Errors
    /// [`crate::Error::OutOfBounds`] if `vcpu` does not exist, or any backend failure.
    fn registers(&self, vcpu: u32) -> Result<Registers>;

    /// The guest's memory wrapped with the given overlay limits.
    fn guest_memory(&self, config: MemoryConfig) -> GuestMemory {
        GuestMemory::new(self.memory(), config)
    }
}

impl fmt::Debug for dyn Hypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hypervisor")
            .field("name", &self.name())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for dyn Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("vcpus", &self.vcpu_count())
            .finish_non_exhaustive()
    }
}
