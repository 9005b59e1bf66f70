//! Admission decisions over the endpoint, user, and IP registries.

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::identity::{EndpointSignature, Identity, IdentityKey};
use super::janitor::{Janitor, JanitorHandle};
use super::policy::{PolicyTable, RateLimitPolicy, UNAUTHENTICATED};
use super::registry::{LimiterRegistry, DEFAULT_SHARDS};

/// Everything the engine needs to know about one inbound request.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    /// Authenticated caller, if the authentication layer found one
    pub identity: Option<Identity>,
    /// Client address, already resolved through proxy headers
    pub source_ip: IpAddr,
    /// Method plus route template
    pub endpoint: EndpointSignature,
}

/// The layer that produced a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitingContext {
    /// A per-endpoint override, keyed by endpoint and source address
    Endpoint(EndpointSignature),
    /// An authenticated user's tier policy
    Tier(String),
    /// The policy for anonymous callers, keyed by source address
    Unauthenticated,
}

impl fmt::Display for LimitingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitingContext::Endpoint(signature) => write!(f, "{}", signature),
            LimitingContext::Tier(tier) => f.write_str(tier),
            LimitingContext::Unauthenticated => f.write_str(UNAUTHENTICATED),
        }
    }
}

impl Serialize for LimitingContext {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of an admission check.
///
/// When `allowed` is false, `context` names the layer that rejected the
/// request. When it is true, `context` names the last layer checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub context: LimitingContext,
}

impl Decision {
    fn allow(context: LimitingContext) -> Self {
        Self {
            allowed: true,
            context,
        }
    }

    fn deny(context: LimitingContext) -> Self {
        Self {
            allowed: false,
            context,
        }
    }
}

/// The admission gate.
///
/// Holds the policy table and one registry per limiting layer. Constructed
/// explicitly and shared through an `Arc`, so every test can use its own
/// isolated instance.
#[derive(Debug)]
pub struct Admission {
    policies: Arc<PolicyTable>,
    endpoints: Arc<LimiterRegistry>,
    users: Arc<LimiterRegistry>,
    ips: Arc<LimiterRegistry>,
}

impl Admission {
    /// Create an engine with [`DEFAULT_SHARDS`] shards per registry.
    pub fn new(policies: Arc<PolicyTable>) -> Self {
        Self::with_shards(policies, DEFAULT_SHARDS)
    }

    pub fn with_shards(policies: Arc<PolicyTable>, shards: usize) -> Self {
        Self {
            policies,
            endpoints: Arc::new(LimiterRegistry::with_shards("endpoint", shards)),
            users: Arc::new(LimiterRegistry::with_shards("user", shards)),
            ips: Arc::new(LimiterRegistry::with_shards("ip", shards)),
        }
    }

    /// The policy table consulted on every check.
    pub fn policies(&self) -> &Arc<PolicyTable> {
        &self.policies
    }

    /// The endpoint, user, and IP registries, in check order.
    pub fn registries(&self) -> [&Arc<LimiterRegistry>; 3] {
        [&self.endpoints, &self.users, &self.ips]
    }

    /// Decide whether `request` is admitted now.
    pub fn admit(&self, request: &AdmissionRequest) -> Decision {
        self.admit_at(request, Instant::now())
    }

    /// Decide whether `request` is admitted at `now`.
    ///
    /// Checks run in order and the first failure short-circuits:
    /// the endpoint override (if any), then the user's tier policy or, for
    /// anonymous callers, the unauthenticated policy per source address.
    pub fn admit_at(&self, request: &AdmissionRequest, now: Instant) -> Decision {
        if let Some(policy) = self.policies.endpoint_policy(&request.endpoint) {
            let key = IdentityKey::Endpoint {
                signature: request.endpoint.clone(),
                ip: request.source_ip,
            };
            if !self.check(&self.endpoints, &key, policy, now) {
                debug!(key = %key, "Endpoint limit exceeded");
                return Decision::deny(LimitingContext::Endpoint(request.endpoint.clone()));
            }
        }

        let (registry, key, policy, context) = match &request.identity {
            Some(identity) => (
                &self.users,
                IdentityKey::User(identity.user_id),
                self.policies.tier_policy(&identity.tier),
                LimitingContext::Tier(self.policies.effective_tier(&identity.tier)),
            ),
            None => (
                &self.ips,
                IdentityKey::Ip(request.source_ip),
                self.policies.unauthenticated_policy(),
                LimitingContext::Unauthenticated,
            ),
        };

        if self.check(registry, &key, policy, now) {
            Decision::allow(context)
        } else {
            debug!(key = %key, context = %context, "Rate limit exceeded");
            Decision::deny(context)
        }
    }

    /// Take one token for `key`. A bucket in a corrupt state admits the
    /// request.
    fn check(
        &self,
        registry: &LimiterRegistry,
        key: &IdentityKey,
        policy: RateLimitPolicy,
        now: Instant,
    ) -> bool {
        match registry.try_acquire(key, policy, now) {
            Ok(allowed) => {
                trace!(registry = registry.name(), key = %key, allowed, "Checked bucket");
                allowed
            }
            Err(e) => {
                warn!(
                    registry = registry.name(),
                    key = %key,
                    error = %e,
                    "Bucket check failed, admitting request"
                );
                true
            }
        }
    }

    /// Start one janitor per registry.
    pub fn spawn_janitors(&self, interval: Duration, idle_after: Duration) -> Vec<JanitorHandle> {
        self.registries()
            .into_iter()
            .map(|registry| Janitor::new(Arc::clone(registry), interval, idle_after).spawn())
            .collect()
    }
}
