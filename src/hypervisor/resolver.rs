use std::sync::{Arc, Mutex, OnceLock, RwLock};

use log::{debug, warn};

use crate::{
    config::{ResolverConfig, VmiConfig},
    hypervisor::{Hypervisor, SnapshotHypervisor},
    Error, Result, UnsupportedReason,
};

/// Attempts to attach a backend. Returns the backend on success, or the reason it is not
/// available on this host.
pub type ProbeFn = Box<dyn Fn(&ResolverConfig) -> Result<Arc<dyn Hypervisor>> + Send + Sync>;

struct Backend {
    name: String,
    probe: ProbeFn,
}

/// Picks the hypervisor backend to use.
///
/// Backends are probed in registration order, except that
/// [`ResolverConfig::preferred_backend`] is always tried first. The first backend that attaches
/// is cached and returned by every later [`HypervisorResolver::resolve`] call. A failed
/// resolution is not cached, so it can be retried once another backend has been registered or
/// the host has changed.
pub struct HypervisorResolver {
    config: ResolverConfig,
    backends: RwLock<Vec<Backend>>,
    resolving: Mutex<()>,
    resolved: OnceLock<Arc<dyn Hypervisor>>,
}

impl HypervisorResolver {
    /// Creates a resolver without any backends.
    pub fn new(config: ResolverConfig) -> Self {
        HypervisorResolver {
            config,
            backends: RwLock::new(Vec::new()),
            resolving: Mutex::new(()),
            resolved: OnceLock::new(),
        }
    }

    /// Creates a resolver with the backends built into this library registered.
    ///
    /// The snapshot backend only attaches when [`ResolverConfig::snapshot_path`] is set.
    pub fn with_builtin_backends(config: ResolverConfig) -> Self {
        let resolver = Self::new(config);
        let snapshot = Backend {
            name: SnapshotHypervisor::NAME.to_string(),
            probe: Box::new(probe_snapshot),
        };
        // Nothing else can hold the lock yet.
        if let Ok(mut backends) = resolver.backends.write() {
            backends.push(snapshot);
        }
        resolver
    }

    /// The configuration backends are probed with
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Adds a backend at the end of the probe order.
    ///
    /// # Errors
    /// [`Error::LockError`] if the backend list is poisoned.
    pub fn register<F>(&self, name: impl Into<String>, probe: F) -> Result<()>
    where
        F: Fn(&ResolverConfig) -> Result<Arc<dyn Hypervisor>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registered hypervisor backend '{name}'");
        write_lock!(self.backends).push(Backend {
            name,
            probe: Box::new(probe),
        });
        Ok(())
    }

    /// Names of the registered backends, in probe order.
    ///
    /// # Errors
    /// [`Error::LockError`] if the backend list is poisoned.
    pub fn backends(&self) -> Result<Vec<String>> {
        let backends = read_lock!(self.backends);
        let mut names: Vec<String> = backends.iter().map(|b| b.name.clone()).collect();
        if let Some(preferred) = &self.config.preferred_backend {
            if let Some(position) = names.iter().position(|name| name == preferred) {
                let name = names.remove(position);
                names.insert(0, name);
            }
        }
        Ok(names)
    }

    /// The cached backend, if resolution already succeeded
    pub fn resolved(&self) -> Option<Arc<dyn Hypervisor>> {
        self.resolved.get().cloned()
    }

    /// Returns the active backend, probing the registered backends on first use.
    ///
    /// # Errors
    /// [`Error::UnsupportedHypervisor`] with [`UnsupportedReason::NoBackends`] if nothing is
    /// registered, or [`UnsupportedReason::AttachFailed`] listing every probe failure.
    pub fn resolve(&self) -> Result<Arc<dyn Hypervisor>> {
        if let Some(hypervisor) = self.resolved.get() {
            return Ok(hypervisor.clone());
        }

        let _resolving = lock!(self.resolving);
        if let Some(hypervisor) = self.resolved.get() {
            return Ok(hypervisor.clone());
        }

        let order = self.backends()?;
        if order.is_empty() {
            return Err(Error::UnsupportedHypervisor(UnsupportedReason::NoBackends));
        }

        let backends = read_lock!(self.backends);
        let mut failures = Vec::with_capacity(order.len());
        for name in &order {
            let Some(backend) = backends.iter().find(|b| &b.name == name) else {
                continue;
            };

            debug!("Probing hypervisor backend '{name}'");
            match (backend.probe)(&self.config) {
                Ok(hypervisor) => {
                    debug!(
                        "Attached to {} {} through backend '{name}'",
                        hypervisor.name(),
                        hypervisor.version()
                    );
                    return Ok(self.resolved.get_or_init(|| hypervisor).clone());
                }
                Err(error) => {
                    warn!("Hypervisor backend '{name}' did not attach: {error}");
                    failures.push((name.clone(), error.to_string()));
                }
            }
        }

        Err(Error::UnsupportedHypervisor(UnsupportedReason::AttachFailed(
            failures,
        )))
    }
}

impl std::fmt::Debug for HypervisorResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorResolver")
            .field("config", &self.config)
            .field("resolved", &self.resolved.get().map(|h| h.name().to_string()))
            .finish_non_exhaustive()
    }
}

fn probe_snapshot(config: &ResolverConfig) -> Result<Arc<dyn Hypervisor>> {
    let Some(path) = &config.snapshot_path else {
        return Err(Error::Error(format!(
            "no snapshot configured (set {})",
            crate::config::ENV_SNAPSHOT
        )));
    };
    Ok(Arc::new(SnapshotHypervisor::open(path)?))
}

static RESOLVER: OnceLock<HypervisorResolver> = OnceLock::new();

/// The process-wide resolver.
///
/// Created on first use from [`VmiConfig::from_env`] with the built-in backends registered.
/// Applications add their own backends here before calling [`instance`].
///
/// # Errors
/// If the environment holds an invalid configuration value.
pub fn resolver() -> Result<&'static HypervisorResolver> {
    if let Some(resolver) = RESOLVER.get() {
        return Ok(resolver);
    }
    let config = VmiConfig::from_env()?;
    Ok(RESOLVER.get_or_init(|| HypervisorResolver::with_builtin_backends(config.resolver)))
}

/// The process-wide hypervisor backend, resolved on first successful call.
///
/// # Errors
/// As for [`HypervisorResolver::resolve`], or an invalid environment configuration.
pub fn instance() -> Result<Arc<dyn Hypervisor>> {
    resolver()?.resolve()
}
