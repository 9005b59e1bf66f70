//! Rate limiting logic and state management.

mod admission;
mod bucket;
mod identity;
mod janitor;
mod policy;
mod registry;

pub use admission::{Admission, AdmissionRequest, Decision, LimitingContext};
pub use bucket::TokenBucket;
pub use identity::{EndpointSignature, Identity, IdentityKey};
pub use janitor::{Janitor, JanitorHandle, JanitorReport, JanitorStats};
pub use policy::{
    LimitSettings, PolicySnapshot, PolicyTable, RateLimitPolicy, FREE_TIER, UNAUTHENTICATED,
};
pub use registry::{LimiterRegistry, DEFAULT_SHARDS};
