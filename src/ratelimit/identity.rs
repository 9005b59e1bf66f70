//! Caller identities, endpoint signatures, and the keys that select a bucket.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::TollgateError;

/// An authenticated caller, supplied by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The authenticated user's ID
    pub user_id: i64,
    /// Subscription tier name, e.g. `"pro"`
    pub tier: String,
}

impl Identity {
    pub fn new(user_id: i64, tier: impl Into<String>) -> Self {
        Self {
            user_id,
            tier: tier.into(),
        }
    }
}

/// An HTTP method plus a route template, e.g. `POST /auth/login`.
///
/// The method is stored upper-case so lookups are case-insensitive on the
/// method and exact on the path template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointSignature {
    method: String,
    path: String,
}

impl EndpointSignature {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.trim().to_ascii_uppercase(),
            path: path.trim().to_string(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl FromStr for EndpointSignature {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), None)
                if path.starts_with('/') && method.chars().all(|c| c.is_ascii_alphabetic()) =>
            {
                Ok(Self::new(method, path))
            }
            _ => Err(TollgateError::InvalidEndpoint(s.to_string())),
        }
    }
}

impl fmt::Display for EndpointSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Selects exactly one bucket within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    /// A protected endpoint as seen from one source address
    Endpoint {
        signature: EndpointSignature,
        ip: IpAddr,
    },
    /// An authenticated user, regardless of address
    User(i64),
    /// An anonymous source address
    Ip(IpAddr),
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Endpoint { signature, ip } => write!(f, "endpoint:{}@{}", signature, ip),
            IdentityKey::User(user_id) => write!(f, "user:{}", user_id),
            IdentityKey::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}
