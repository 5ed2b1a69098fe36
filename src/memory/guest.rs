use std::sync::Arc;

use crate::{
    config::MemoryConfig,
    memory::{
        map_counted, terminated_length, GuestAddress, GuestPtr, GuestValue, MemoryChannel, Retrying,
    },
    Result,
};

/// A memory channel bundled with the limits overlays built on it must respect.
///
/// This is the usual entry point for creating overlays: it applies the configured write policy,
/// string cap and structure size limit, and wraps the channel so transient faults are retried
/// [`MemoryConfig::transient_retries`] times.
#[derive(Clone)]
pub struct GuestMemory {
    channel: Arc<dyn MemoryChannel>,
    config: MemoryConfig,
}

impl GuestMemory {
    /// Wraps `channel` with the behaviour described by `config`.
    pub fn new(channel: Arc<dyn MemoryChannel>, config: MemoryConfig) -> Self {
        let channel: Arc<dyn MemoryChannel> = if config.transient_retries > 0 {
            Arc::new(Retrying::new(channel, config.transient_retries))
        } else {
            channel
        };
        GuestMemory { channel, config }
    }

    /// The (possibly retry-wrapped) channel
    pub fn channel(&self) -> &Arc<dyn MemoryChannel> {
        &self.channel
    }

    /// The limits in effect
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Maps `count` values of `T` at `address`.
    ///
    /// # Errors
    /// As for [`GuestPtr::new`].
    pub fn map<T: GuestValue>(&self, address: impl Into<GuestAddress>, count: usize) -> Result<GuestPtr<T>> {
        GuestPtr::with_policy(
            self.channel.clone(),
            address.into(),
            count,
            self.config.write_policy,
        )
    }

    /// Reads a single `T` at `address`.
    ///
    /// # Errors
    /// Any error of the fetch.
    pub fn read<T: GuestValue>(&self, address: impl Into<GuestAddress>) -> Result<T> {
        self.map::<T>(address, 1)?.get(0)
    }

    /// Maps the NUL-terminated byte string at `address`, capped at
    /// [`MemoryConfig::max_string_length`].
    ///
    /// # Errors
    /// Any error of the channel before the terminator was found.
    pub fn cstring(&self, address: impl Into<GuestAddress>) -> Result<GuestPtr<u8>> {
        let address = address.into();
        let length = terminated_length::<u8>(
            self.channel.as_ref(),
            address,
            self.config.max_string_length,
        )?;
        self.map(address, length)
    }

    /// Maps the NUL-terminated UTF-16 string at `address`, capped at
    /// [`MemoryConfig::max_string_length`] code units.
    ///
    /// # Errors
    /// Any error of the channel before the terminator was found.
    pub fn wstring(&self, address: impl Into<GuestAddress>) -> Result<GuestPtr<u16>> {
        let address = address.into();
        let length = terminated_length::<u16>(
            self.channel.as_ref(),
            address,
            self.config.max_string_length,
        )?;
        self.map(address, length)
    }

    /// Maps `count` values of `T` whose count was read from the guest, rejecting counts whose
    /// size exceeds [`MemoryConfig::max_structure_size`].
    ///
    /// # Errors
    /// [`crate::Error::Malformed`] if the declared size is too large.
    pub fn counted<T: GuestValue>(
        &self,
        address: impl Into<GuestAddress>,
        count: u64,
    ) -> Result<GuestPtr<T>> {
        let ptr = map_counted::<T>(
            self.channel.clone(),
            address.into(),
            count,
            self.config.max_structure_size,
        )?;
        self.map(ptr.address(), ptr.len())
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::WritePolicy,
        memory::{GuestPhysicalAddress, SnapshotMemory},
        Error, MemoryFault,
    };

    #[test]
    fn transient_faults_are_retried() {
        let snapshot = Arc::new(SnapshotMemory::with_data(0x1000, &[0x2a, 0, 0, 0]).unwrap());
        snapshot.inject_fault(0x1000, MemoryFault::Transient, Some(2));

        let memory = GuestMemory::new(snapshot.clone(), MemoryConfig::default());
        assert_eq!(memory.read::<u32>(GuestPhysicalAddress::new(0x1000)).unwrap(), 0x2a);

        snapshot.inject_fault(0x1000, MemoryFault::Transient, Some(1));
        let memory = GuestMemory::new(
            snapshot,
            MemoryConfig::default().with_transient_retries(0),
        );
        let error = memory.read::<u32>(GuestPhysicalAddress::new(0x1000)).unwrap_err();
        assert!(error.is_transient());
    }

    #[test]
    fn limits_come_from_config() {
        let snapshot = Arc::new(SnapshotMemory::with_data(0x1000, &[b'x'; 64]).unwrap());
        let memory = GuestMemory::new(
            snapshot,
            MemoryConfig::new()
                .with_max_string_length(16)
                .with_max_structure_size(32)
                .with_write_policy(WritePolicy::WriteThrough),
        );

        let text = memory.cstring(GuestPhysicalAddress::new(0x1000)).unwrap();
        assert_eq!(text.len(), 16);
        assert_eq!(text.policy(), WritePolicy::WriteThrough);

        assert!(memory.counted::<u64>(GuestPhysicalAddress::new(0x1000), 4).is_ok());
        assert!(matches!(
            memory.counted::<u64>(GuestPhysicalAddress::new(0x1000), 5),
            Err(Error::Malformed { .. })
        ));
    }
}
