//! Rate limit policies and the runtime policy table.
//!
//! Policies are configured per subscription tier and, optionally, per
//! endpoint signature. Endpoint overrides are consulted before tier or IP
//! defaults. Both tables can be changed at runtime without a restart.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use super::identity::EndpointSignature;
use crate::config::RateLimitingConfig;
use crate::error::{Result, TollgateError};

/// Policy key for callers without an authenticated identity.
pub const UNAUTHENTICATED: &str = "unauthenticated";
/// Tier used for any tier name the table does not know.
pub const FREE_TIER: &str = "free";

/// Built-in defaults as `(tier, requests_per_minute, burst)`.
const DEFAULT_TIERS: &[(&str, u32, u32)] = &[
    (UNAUTHENTICATED, 30, 5),
    (FREE_TIER, 60, 10),
    ("starter", 120, 20),
    ("pro", 300, 50),
    ("business", 600, 100),
];

/// Used only if the `free` entry cannot be read, so lookups never fail.
const FALLBACK_POLICY: RateLimitPolicy = RateLimitPolicy {
    capacity: 10,
    refill_per_second: 1.0,
};

/// Token bucket parameters for one tier or endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitPolicy {
    /// Bucket capacity, i.e. the burst size
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_second: f64,
}

impl RateLimitPolicy {
    /// Build a policy from its administrative form.
    pub fn per_minute(requests_per_minute: u32, burst: u32) -> Result<Self> {
        if requests_per_minute == 0 {
            return Err(TollgateError::InvalidPolicy(
                "requests_per_minute must be at least 1".to_string(),
            ));
        }
        if burst == 0 {
            return Err(TollgateError::InvalidPolicy(
                "burst must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            capacity: burst,
            refill_per_second: f64::from(requests_per_minute) / 60.0,
        })
    }

    /// The sustained rate expressed in requests per minute.
    pub fn requests_per_minute(&self) -> u32 {
        (self.refill_per_second * 60.0).round() as u32
    }
}

impl TryFrom<LimitSettings> for RateLimitPolicy {
    type Error = TollgateError;

    fn try_from(settings: LimitSettings) -> Result<Self> {
        RateLimitPolicy::per_minute(settings.requests_per_minute, settings.burst)
    }
}

/// Administrative form of a policy, as it appears in configuration files
/// and admin requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Sustained requests allowed per minute
    pub requests_per_minute: u32,
    /// Requests that may be admitted instantaneously
    pub burst: u32,
}

impl From<RateLimitPolicy> for LimitSettings {
    fn from(policy: RateLimitPolicy) -> Self {
        Self {
            requests_per_minute: policy.requests_per_minute(),
            burst: policy.capacity,
        }
    }
}

/// Serializable view of both policy tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub tiers: BTreeMap<String, LimitSettings>,
    pub endpoints: BTreeMap<String, LimitSettings>,
}

/// Tier and endpoint policies, safe to read and update concurrently.
#[derive(Debug)]
pub struct PolicyTable {
    tiers: DashMap<String, RateLimitPolicy>,
    endpoints: DashMap<EndpointSignature, RateLimitPolicy>,
}

impl PolicyTable {
    /// Create a table seeded with the built-in tier defaults and no
    /// endpoint overrides.
    pub fn new() -> Self {
        let tiers = DashMap::new();
        for &(tier, rpm, burst) in DEFAULT_TIERS {
            let policy = RateLimitPolicy {
                capacity: burst,
                refill_per_second: f64::from(rpm) / 60.0,
            };
            tiers.insert(tier.to_string(), policy);
        }
        Self {
            tiers,
            endpoints: DashMap::new(),
        }
    }

    /// Build a table from configuration, layering configured tiers over the
    /// defaults and adding configured endpoint overrides.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let table = Self::new();
        for (tier, settings) in &config.tiers {
            table.set_policy(tier, RateLimitPolicy::try_from(*settings)?);
        }
        for (endpoint, settings) in &config.endpoints {
            table.set_endpoint_limit(endpoint, settings.requests_per_minute, settings.burst)?;
        }
        Ok(table)
    }

    /// Set the policy for a tier.
    pub fn set_policy(&self, tier: &str, policy: RateLimitPolicy) {
        let tier = normalize_tier(tier);
        info!(
            tier = %tier,
            capacity = policy.capacity,
            refill_per_second = policy.refill_per_second,
            "Tier policy updated"
        );
        self.tiers.insert(tier, policy);
    }

    /// Set a tier's limits from requests per minute and burst.
    pub fn set_tier_limits(&self, tier: &str, requests_per_minute: u32, burst: u32) -> Result<()> {
        let policy = RateLimitPolicy::per_minute(requests_per_minute, burst)?;
        self.set_policy(tier, policy);
        Ok(())
    }

    /// Set an endpoint override, e.g. `"POST /auth/login"`.
    pub fn set_endpoint_limit(
        &self,
        endpoint: &str,
        requests_per_minute: u32,
        burst: u32,
    ) -> Result<()> {
        let signature: EndpointSignature = endpoint.parse()?;
        let policy = RateLimitPolicy::per_minute(requests_per_minute, burst)?;
        info!(
            endpoint = %signature,
            capacity = policy.capacity,
            refill_per_second = policy.refill_per_second,
            "Endpoint policy updated"
        );
        self.endpoints.insert(signature, policy);
        Ok(())
    }

    /// Remove an endpoint override. Returns whether one existed.
    pub fn remove_endpoint_limit(&self, endpoint: &str) -> Result<bool> {
        let signature: EndpointSignature = endpoint.parse()?;
        let removed = self.endpoints.remove(&signature).is_some();
        if removed {
            info!(endpoint = %signature, "Endpoint policy removed");
        }
        Ok(removed)
    }

    /// Policy for an authenticated tier. Unknown tiers get the `free` policy.
    pub fn tier_policy(&self, tier: &str) -> RateLimitPolicy {
        let tier = normalize_tier(tier);
        if let Some(policy) = self.tiers.get(&tier) {
            return *policy;
        }
        self.tiers
            .get(FREE_TIER)
            .map(|policy| *policy)
            .unwrap_or(FALLBACK_POLICY)
    }

    /// Whether a tier has its own entry, as opposed to falling back to `free`.
    pub fn has_tier(&self, tier: &str) -> bool {
        self.tiers.contains_key(&normalize_tier(tier))
    }

    /// Name of the tier whose policy `tier` resolves to.
    pub fn effective_tier(&self, tier: &str) -> String {
        let tier = normalize_tier(tier);
        if self.tiers.contains_key(&tier) {
            tier
        } else {
            FREE_TIER.to_string()
        }
    }

    /// Policy for callers without an authenticated identity.
    pub fn unauthenticated_policy(&self) -> RateLimitPolicy {
        self.tier_policy(UNAUTHENTICATED)
    }

    /// Override for an endpoint signature, if one is configured.
    pub fn endpoint_policy(&self, signature: &EndpointSignature) -> Option<RateLimitPolicy> {
        self.endpoints.get(signature).map(|policy| *policy)
    }

    /// Copy both tables into a serializable snapshot.
    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            tiers: self
                .tiers
                .iter()
                .map(|entry| (entry.key().clone(), LimitSettings::from(*entry.value())))
                .collect(),
            endpoints: self
                .endpoints
                .iter()
                .map(|entry| (entry.key().to_string(), LimitSettings::from(*entry.value())))
                .collect(),
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_tier(tier: &str) -> String {
    tier.trim().to_ascii_lowercase()
}
