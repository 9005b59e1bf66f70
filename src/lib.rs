//! Tollgate - Admission Control for HTTP APIs
//!
//! This crate decides, for every inbound request, whether to admit or reject
//! it. Decisions are made from token buckets kept per caller identity: an
//! anonymous IP, an authenticated user on a subscription tier, or a
//! protected endpoint as seen from one address. All state is in-memory and
//! process-local.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
