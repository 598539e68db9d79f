//! Registry of limiter sets keyed by configuration.

use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::bucket::LimitConfig;
use super::clock::{Clock, SystemClock};
use super::keyed::KeyedLimiterSet;
use super::sweeper::Sweeper;
use crate::error::{Result, TurnstileError};

/// Default idle time after which an identity's bucket is evicted.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(10 * 60);
/// Default time between eviction passes.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Configuration identity of a [`KeyedLimiterSet`].
///
/// Call sites with equal keys share limiter state. A namespace keeps two
/// call sites apart even when their (rate, burst) match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    limit: LimitConfig,
    namespace: Option<String>,
}

impl RegistryKey {
    /// Key for a limit in the shared, unnamed namespace.
    pub fn new(limit: LimitConfig) -> Self {
        Self {
            limit,
            namespace: None,
        }
    }

    /// Key for a limit in its own namespace.
    pub fn namespaced(limit: LimitConfig, namespace: impl Into<String>) -> Self {
        Self {
            limit,
            namespace: Some(namespace.into()),
        }
    }

    pub fn limit(&self) -> LimitConfig {
        self.limit
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{}/", ns)?;
        }
        write!(f, "{}-{}", self.limit.rate(), self.limit.burst())
    }
}

/// Eviction policy applied to every set in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Idle time after which an entry is evicted.
    pub idle_ttl: Duration,
    /// Time between eviction passes.
    pub sweep_interval: Duration,
}

impl RegistrySettings {
    /// Reject zero durations and sweep intervals too large to schedule.
    pub fn validate(&self) -> Result<()> {
        if self.idle_ttl.is_zero() {
            return Err(TurnstileError::Config("idle TTL must be non-zero".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(TurnstileError::Config(
                "sweep interval must be non-zero".into(),
            ));
        }
        // The sweeper schedules its first tick one interval from now and
        // each later one an interval after that.
        let schedulable = Instant::now()
            .checked_add(self.sweep_interval)
            .and_then(|first| first.checked_add(self.sweep_interval))
            .is_some();
        if !schedulable {
            return Err(TurnstileError::Config(format!(
                "sweep interval of {}s is too large",
                self.sweep_interval.as_secs()
            )));
        }
        Ok(())
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            idle_ttl: DEFAULT_IDLE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// A set together with the task that sweeps it.
#[derive(Debug)]
struct ManagedSet {
    set: Arc<KeyedLimiterSet>,
    sweeper: Sweeper,
}

/// Owner of every [`KeyedLimiterSet`] in the process.
///
/// Built once by the composition root and shared by reference with each
/// admission guard. Sets are created on demand, one per [`RegistryKey`], each
/// with its own [`Sweeper`] running on the Tokio runtime the registry was
/// built in.
#[derive(Debug)]
pub struct LimiterRegistry {
    sets: RwLock<HashMap<RegistryKey, ManagedSet>>,
    settings: RegistrySettings,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    closed: AtomicBool,
    /// Serializes shutdown so concurrent callers all wait for the sweepers.
    shutdown_lock: tokio::sync::Mutex<()>,
}

impl LimiterRegistry {
    /// Create a registry with default eviction settings.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Result<Self> {
        Self::with_settings(RegistrySettings::default())
    }

    /// Create a registry with the given eviction settings.
    pub fn with_settings(settings: RegistrySettings) -> Result<Self> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Create a registry reading time from `clock`.
    pub fn with_clock(settings: RegistrySettings, clock: Arc<dyn Clock>) -> Result<Self> {
        settings.validate()?;
        let runtime = Handle::try_current().map_err(|_| TurnstileError::NoRuntime)?;

        Ok(Self {
            sets: RwLock::new(HashMap::new()),
            settings,
            clock,
            runtime,
            closed: AtomicBool::new(false),
            shutdown_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Return the shared set for `limit`, creating it on first use.
    pub fn get_or_create_set(&self, limit: LimitConfig) -> Result<Arc<KeyedLimiterSet>> {
        self.get_or_create(RegistryKey::new(limit))
    }

    /// Return the set for `limit` within `namespace`, creating it on first use.
    pub fn get_or_create_namespaced_set(
        &self,
        namespace: &str,
        limit: LimitConfig,
    ) -> Result<Arc<KeyedLimiterSet>> {
        self.get_or_create(RegistryKey::namespaced(limit, namespace))
    }

    /// Return the set for `key`, creating it (and its sweeper) on first use.
    ///
    /// Fails with [`TurnstileError::RegistryClosed`] once shutdown has begun.
    pub fn get_or_create(&self, key: RegistryKey) -> Result<Arc<KeyedLimiterSet>> {
        if self.is_closed() {
            return Err(TurnstileError::RegistryClosed);
        }

        if let Some(managed) = self.sets.read().get(&key) {
            return Ok(Arc::clone(&managed.set));
        }

        let mut sets = self.sets.write();
        // Shutdown flips the flag before draining, so checking under the
        // write lock guarantees no set is inserted after the drain.
        if self.is_closed() {
            return Err(TurnstileError::RegistryClosed);
        }
        if let Some(managed) = sets.get(&key) {
            return Ok(Arc::clone(&managed.set));
        }

        debug!(registry_key = %key, "Creating new limiter set");
        let set = Arc::new(KeyedLimiterSet::new(
            key.clone(),
            key.limit(),
            Arc::clone(&self.clock),
        ));
        let sweeper = Sweeper::spawn(Arc::clone(&set), &self.settings, &self.runtime);
        sets.insert(
            key,
            ManagedSet {
                set: Arc::clone(&set),
                sweeper,
            },
        );
        Ok(set)
    }

    /// Look up an existing set without creating one.
    pub fn get(&self, key: &RegistryKey) -> Option<Arc<KeyedLimiterSet>> {
        self.sets.read().get(key).map(|m| Arc::clone(&m.set))
    }

    /// Number of live sets.
    pub fn set_count(&self) -> usize {
        self.sets.read().len()
    }

    /// Eviction settings shared by every set.
    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop every sweeper and release every set.
    ///
    /// Returns once all sweepers have terminated. Calling it again, even
    /// concurrently, is a no-op that still waits for the first call to finish.
    ///
    /// Guards and set handles obtained before shutdown stay usable: their sets
    /// are emptied, keep enforcing limits for identities seen afterwards, and
    /// are no longer swept. Drop them along with the registry.
    pub async fn shutdown(&self) {
        let _guard = self.shutdown_lock.lock().await;
        let first = !self.closed.swap(true, Ordering::AcqRel);

        let drained: Vec<ManagedSet> = self.sets.write().drain().map(|(_, m)| m).collect();
        if first {
            info!(sets = drained.len(), "Shutting down limiter registry");
        }

        join_all(drained.iter().map(|m| m.sweeper.stop())).await;
        for managed in &drained {
            managed.set.clear();
        }

        if first {
            info!("Limiter registry shut down");
        }
    }
}
