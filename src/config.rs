//! Introspection configuration types.
//!
//! # Overview
//!
//! Configuration is organized into a few small structures:
//!
//! - [`VmiConfig`] - Top-level configuration container
//! - [`MemoryConfig`] - Overlay limits and write discipline
//! - [`DispatchConfig`] - Event dispatch queueing and latency reporting
//! - [`ResolverConfig`] - Hypervisor backend selection
//!
//! # Configuration Presets
//!
//! - [`VmiConfig::live()`] - Introspecting a running guest
//! - [`VmiConfig::forensic()`] - Reading a memory snapshot that never changes
//! - [`VmiConfig::strict()`] - Tight limits for untrusted or fuzzed guests
//!
//! # Example
//!
//! ```rust
//! use vmscope::config::{MemoryConfig, VmiConfig, WritePolicy};
//!
//! let config = VmiConfig {
//!     memory: MemoryConfig::new()
//!         .with_max_string_length(4096)
//!         .with_write_policy(WritePolicy::WriteThrough),
//!     ..VmiConfig::live()
//! };
//! assert_eq!(config.memory.max_string_length, 4096);
//! ```

use std::{path::PathBuf, time::Duration};

use crate::{Error, Result};

/// Environment variable naming the preferred hypervisor backend
pub const ENV_BACKEND: &str = "VMSCOPE_BACKEND";
/// Environment variable pointing the snapshot backend at a physical memory dump
pub const ENV_SNAPSHOT: &str = "VMSCOPE_SNAPSHOT";
/// Environment variable overriding the string scan cap
pub const ENV_MAX_STRING: &str = "VMSCOPE_MAX_STRING";

/// When writes through an overlay reach guest memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Writes stay in the overlay cache until `commit()` (or drop).
    #[default]
    Deferred,
    /// Every write is flushed to the channel before `set` returns.
    WriteThrough,
}

/// Top-level introspection configuration.
#[derive(Clone, Debug, Default)]
pub struct VmiConfig {
    /// Overlay limits and write discipline
    pub memory: MemoryConfig,
    /// Event dispatch settings
    pub dispatch: DispatchConfig,
    /// Backend selection
    pub resolver: ResolverConfig,
}

/// Guest memory overlay configuration.
///
/// # Default Values
///
/// | Setting | Default Value |
/// |---------|---------------|
/// | `max_string_length` | 0xFFFF elements |
/// | `max_structure_size` | 64 KiB |
/// | `write_policy` | `Deferred` |
/// | `transient_retries` | 2 |
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Maximum number of elements a terminated string scan reads before it stops.
    ///
    /// Strings longer than this are truncated at the cap.
    pub max_string_length: usize,

    /// Maximum byte size a guest-declared length may give a structure.
    ///
    /// Applies to BLOB lengths, counted arrays and similar fields read from the guest.
    pub max_structure_size: usize,

    /// When writes through overlays reach guest memory.
    pub write_policy: WritePolicy,

    /// How often a transient memory fault is retried before it is reported.
    pub transient_retries: u32,
}

/// Event dispatch configuration.
///
/// # Default Values
///
/// | Setting | Default Value |
/// |---------|---------------|
/// | `queue_depth` | 64 events per VCPU |
/// | `slow_handler_threshold` | 50 ms |
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Maximum number of undelivered events queued per VCPU.
    ///
    /// When a queue is full the event source blocks, which in turn keeps the VCPU paused.
    pub queue_depth: usize,

    /// Handlers running longer than this are reported with a warning.
    pub slow_handler_threshold: Duration,
}

/// Hypervisor backend selection.
#[derive(Clone, Debug, Default)]
pub struct ResolverConfig {
    /// Backend to probe first, by name. The remaining backends keep their order.
    pub preferred_backend: Option<String>,

    /// Raw physical memory dump served by the built-in snapshot backend.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_string_length: 0xFFFF,
            max_structure_size: 64 * 1024, // 64 KiB
            write_policy: WritePolicy::Deferred,
            transient_retries: 2,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            slow_handler_threshold: Duration::from_millis(50),
        }
    }
}

/// Preset configurations for common use cases.
impl VmiConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a running guest.
    ///
    /// Transient faults are retried a few more times, since pages may be mid-transition while
    /// the VCPU is paused.
    pub fn live() -> Self {
        Self {
            memory: MemoryConfig {
                transient_retries: 4,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Configuration for a memory snapshot.
    ///
    /// Snapshots never report transient faults, so no retries are attempted.
    pub fn forensic() -> Self {
        Self {
            memory: MemoryConfig {
                transient_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Tight limits for guests that are expected to be hostile.
    pub fn strict() -> Self {
        Self {
            memory: MemoryConfig {
                max_string_length: 1024,
                max_structure_size: 4096,
                transient_retries: 0,
                ..Default::default()
            },
            dispatch: DispatchConfig {
                queue_depth: 8,
                slow_handler_threshold: Duration::from_millis(10),
            },
            ..Default::default()
        }
    }

    /// Reads overrides from the process environment on top of the defaults.
    ///
    /// Recognized variables are [`ENV_BACKEND`], [`ENV_SNAPSHOT`] and [`ENV_MAX_STRING`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if a variable holds an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides obtained from `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if a variable holds an unparsable value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup(ENV_BACKEND).filter(|value| !value.is_empty()) {
            self.resolver.preferred_backend = Some(backend);
        }
        if let Some(path) = lookup(ENV_SNAPSHOT).filter(|value| !value.is_empty()) {
            self.resolver.snapshot_path = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup(ENV_MAX_STRING) {
            self.memory.max_string_length = value.trim().parse().map_err(|_| {
                Error::Error(format!("{ENV_MAX_STRING} is not a valid length: {value}"))
            })?;
        }
        Ok(self)
    }
}

/// Builder methods for [`MemoryConfig`].
impl MemoryConfig {
    /// Creates a memory configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the string scan cap.
    ///
    /// # Arguments
    ///
    /// * `max` - Maximum number of elements scanned for a terminator
    ///
    /// # Returns
    ///
    /// Returns `self` for method chaining.
    pub fn with_max_string_length(mut self, max: usize) -> Self {
        self.max_string_length = max;
        self
    }

    /// Sets the largest size a guest-declared length may request.
    pub fn with_max_structure_size(mut self, max: usize) -> Self {
        self.max_structure_size = max;
        self
    }

    /// Sets the write discipline.
    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    /// Sets how often transient faults are retried.
    pub fn with_transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = retries;
        self
    }
}

/// Builder methods for [`DispatchConfig`].
impl DispatchConfig {
    /// Creates a dispatch configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-VCPU queue depth. A depth of zero is raised to one.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Sets the slow-handler warning threshold.
    pub fn with_slow_handler_threshold(mut self, threshold: Duration) -> Self {
        self.slow_handler_threshold = threshold;
        self
    }
}

/// Builder methods for [`ResolverConfig`].
impl ResolverConfig {
    /// Creates a resolver configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes `backend` before any other.
    pub fn with_preferred_backend(mut self, backend: impl Into<String>) -> Self {
        self.preferred_backend = Some(backend.into());
        self
    }

    /// Serves the snapshot backend from the dump at `path`.
    pub fn with_snapshot_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}
