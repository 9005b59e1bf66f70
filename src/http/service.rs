//! Standalone decision endpoint for HTTP layers running out of process.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::middleware::rejection_response;
use crate::error::TollgateError;
use crate::ratelimit::{Admission, AdmissionRequest, EndpointSignature, Identity};

/// Body of `POST /v1/check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Authenticated caller, if any
    #[serde(default)]
    pub identity: Option<Identity>,
    /// Client address as resolved by the caller
    pub source_ip: IpAddr,
    /// Endpoint signature, e.g. `"POST /auth/login"`
    pub endpoint: String,
}

/// Decide whether a request described by the caller may proceed.
///
/// Responds `200` with the decision when admitted and `429` with the
/// standard rejection body otherwise.
#[instrument(
    skip_all,
    fields(
        endpoint = %request.endpoint,
        source_ip = %request.source_ip,
        authenticated = request.identity.is_some()
    )
)]
pub async fn check(
    State(admission): State<Arc<Admission>>,
    Json(request): Json<CheckRequest>,
) -> Result<Response, TollgateError> {
    let endpoint = request.endpoint.parse::<EndpointSignature>().map_err(|e| {
        warn!("Received check request with an invalid endpoint");
        e
    })?;

    let admission_request = AdmissionRequest {
        identity: request.identity,
        source_ip: request.source_ip,
        endpoint,
    };
    let decision = admission.admit(&admission_request);

    debug!(
        allowed = decision.allowed,
        context = %decision.context,
        "Admission decision made"
    );

    if decision.allowed {
        Ok((StatusCode::OK, Json(decision)).into_response())
    } else {
        Ok(rejection_response(&admission, &admission_request, &decision))
    }
}
