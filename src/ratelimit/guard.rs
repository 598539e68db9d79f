//! Request-facing admission decisions.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use super::bucket::LimitConfig;
use super::key::{KeyExtractor, KeyStrategy, RequestContext, ANONYMOUS_IDENTITY};
use super::keyed::KeyedLimiterSet;
use super::registry::{LimiterRegistry, RegistryKey};
use crate::error::Result;

/// Rejection message used by [`AdmissionGuard::per_address`].
pub const ADDRESS_LIMIT_MESSAGE: &str = "IP rate limit exceeded";
/// Rejection message used when none is configured.
pub const DEFAULT_LIMIT_MESSAGE: &str = "Rate limit exceeded";

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed,
    /// The request exceeds its rate and must not be processed.
    Denied(Denied),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Details of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied {
    /// The identity whose bucket was empty.
    pub identity: String,
    /// Human-readable rejection message.
    pub message: String,
}

impl Denied {
    /// HTTP status the surrounding layer should answer with.
    pub const STATUS_CODE: u16 = 429;
    /// Canonical status name for the rejection.
    pub const STATUS: &'static str = "RESOURCE_EXHAUSTED";
}

impl fmt::Display for Denied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.identity)
    }
}

/// Options for [`AdmissionGuard::with_options`].
#[derive(Clone)]
pub struct GuardOptions {
    /// Rate and burst for every identity behind the guard.
    pub limit: LimitConfig,
    /// Keeps this guard's state apart from other guards with the same limit.
    pub namespace: Option<String>,
    /// How the identity is derived from a request.
    pub key: Arc<dyn KeyExtractor>,
    /// Rejection message; empty or absent means [`DEFAULT_LIMIT_MESSAGE`].
    pub message: Option<String>,
}

impl GuardOptions {
    /// Per-address limiting with the default message.
    pub fn new(limit: LimitConfig) -> Self {
        Self {
            limit,
            namespace: None,
            key: Arc::new(KeyStrategy::ClientAddress),
            message: None,
        }
    }

    pub fn key(mut self, key: impl KeyExtractor + 'static) -> Self {
        self.key = Arc::new(key);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Debug for GuardOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardOptions")
            .field("limit", &self.limit)
            .field("namespace", &self.namespace)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Decides per request whether to admit it.
///
/// Bound at construction to one [`KeyedLimiterSet`] from the registry;
/// guards built with the same limit and namespace share that set.
#[derive(Clone)]
pub struct AdmissionGuard {
    set: Arc<KeyedLimiterSet>,
    key: Arc<dyn KeyExtractor>,
    message: String,
}

impl AdmissionGuard {
    /// Limit each client address.
    pub fn per_address(registry: &LimiterRegistry, limit: LimitConfig) -> Result<Self> {
        Self::with_options(registry, GuardOptions::new(limit).message(ADDRESS_LIMIT_MESSAGE))
    }

    /// Limit each authenticated principal, falling back to the client address
    /// for anonymous requests.
    pub fn per_principal(registry: &LimiterRegistry, limit: LimitConfig) -> Result<Self> {
        Self::with_options(registry, GuardOptions::new(limit).key(KeyStrategy::Principal))
    }

    /// Build a guard from explicit options.
    pub fn with_options(registry: &LimiterRegistry, options: GuardOptions) -> Result<Self> {
        let registry_key = match options.namespace {
            Some(ns) => RegistryKey::namespaced(options.limit, ns),
            None => RegistryKey::new(options.limit),
        };
        let set = registry.get_or_create(registry_key)?;
        let message = options
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_LIMIT_MESSAGE.to_string());

        Ok(Self {
            set,
            key: options.key,
            message,
        })
    }

    /// Decide whether the request described by `ctx` may proceed.
    pub fn check(&self, ctx: &RequestContext) -> Decision {
        let identity = self.identity(ctx);
        let bucket = self.set.get_or_create(&identity);

        if bucket.try_acquire() {
            trace!(registry_key = %self.set.key(), identity = %identity, "Request admitted");
            Decision::Allowed
        } else {
            debug!(registry_key = %self.set.key(), identity = %identity, "Rate limit exceeded");
            Decision::Denied(Denied {
                identity,
                message: self.message.clone(),
            })
        }
    }

    /// The identity `ctx` is limited under. Never empty.
    pub fn identity(&self, ctx: &RequestContext) -> String {
        let key = self.key.extract(ctx);
        if !key.is_empty() {
            return key;
        }

        let addr = ctx.client_ip();
        if !addr.is_empty() {
            return addr;
        }

        ANONYMOUS_IDENTITY.to_string()
    }

    /// The shared set this guard draws buckets from.
    pub fn limiter_set(&self) -> &Arc<KeyedLimiterSet> {
        &self.set
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("registry_key", self.set.key())
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
