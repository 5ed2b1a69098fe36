use std::{path::Path, sync::Arc};

use log::debug;

use crate::{
    arch::x86::Registers,
    hypervisor::{Domain, DomainInformation, DomainSelector, Hypervisor},
    memory::{DumpFile, MemoryChannel},
    Error, Result,
};

/// A backend serving a single captured guest.
///
/// The guest is a physical memory image, either a raw dump file opened with
/// [`SnapshotHypervisor::open`] or any [`MemoryChannel`], plus the register state of each VCPU
/// at capture time. Writes never reach the dump file. The image exposes exactly one domain with
/// id 0.
pub struct SnapshotHypervisor {
    domain_name: String,
    memory: Arc<dyn MemoryChannel>,
    vcpus: Arc<[Registers]>,
}

impl SnapshotHypervisor {
    /// Backend name used for probing and [`Hypervisor::name`]
    pub const NAME: &'static str = "snapshot";

    /// Opens a raw physical memory dump. The domain is named after the file stem.
    ///
    /// # Errors
    /// Any error opening or mapping the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dump = DumpFile::open(path)?;
        let domain_name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| Self::NAME.to_string());

        debug!(
            "Opened snapshot '{}' ({} bytes of physical memory)",
            path.display(),
            dump.len()
        );
        Ok(Self::from_memory(domain_name, Arc::new(dump)))
    }

    /// Serves `memory` as a domain called `domain_name` with one VCPU in its reset state.
    pub fn from_memory(domain_name: impl Into<String>, memory: Arc<dyn MemoryChannel>) -> Self {
        SnapshotHypervisor {
            domain_name: domain_name.into(),
            memory,
            vcpus: Arc::from(vec![Registers::default()]),
        }
    }

    /// Replaces the VCPU register states captured with the image.
    ///
    /// An empty list keeps a single VCPU in its reset state.
    #[must_use]
    pub fn with_vcpus(mut self, vcpus: Vec<Registers>) -> Self {
        if !vcpus.is_empty() {
            self.vcpus = Arc::from(vcpus);
        }
        self
    }

    fn information(&self) -> DomainInformation {
        DomainInformation {
            domain_name: self.domain_name.clone(),
            domain_id: 0,
        }
    }
}

impl Hypervisor for SnapshotHypervisor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn running_domains(&self) -> Result<Vec<DomainInformation>> {
        Ok(vec![self.information()])
    }

    fn attach(&self, selector: &DomainSelector) -> Result<Box<dyn Domain>> {
        if !selector.matches(&self.information()) {
            return Err(Error::Error(format!(
                "snapshot has no domain with {selector}"
            )));
        }

        Ok(Box::new(SnapshotDomain {
            name: self.domain_name.clone(),
            memory: self.memory.clone(),
            vcpus: self.vcpus.clone(),
        }))
    }
}

impl std::fmt::Debug for SnapshotHypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotHypervisor")
            .field("domain_name", &self.domain_name)
            .field("vcpus", &self.vcpus.len())
            .finish_non_exhaustive()
    }
}

/// The domain of a [`SnapshotHypervisor`].
pub struct SnapshotDomain {
    name: String,
    memory: Arc<dyn MemoryChannel>,
    vcpus: Arc<[Registers]>,
}

impl Domain for SnapshotDomain {
    fn id(&self) -> u32 {
        0
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn vcpu_count(&self) -> u32 {
        u32::try_from(self.vcpus.len()).unwrap_or(u32::MAX)
    }

    fn memory(&self) -> Arc<dyn MemoryChannel> {
        self.memory.clone()
    }

    fn registers(&self, vcpu: u32) -> Result<Registers> {
        self.vcpus
            .get(vcpu as usize)
            .cloned()
            .ok_or(Error::OutOfBounds)
    }
}
