//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod guard;
mod key;
mod keyed;
mod registry;
mod sweeper;

pub use bucket::{LimitConfig, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use guard::{
    AdmissionGuard, Decision, Denied, GuardOptions, ADDRESS_LIMIT_MESSAGE, DEFAULT_LIMIT_MESSAGE,
};
pub use key::{KeyExtractor, KeyStrategy, RequestContext, ANONYMOUS_IDENTITY};
pub use keyed::{KeyedLimiterSet, LimiterEntry};
pub use registry::{
    LimiterRegistry, RegistryKey, RegistrySettings, DEFAULT_IDLE_TTL, DEFAULT_SWEEP_INTERVAL,
};
pub use sweeper::Sweeper;
