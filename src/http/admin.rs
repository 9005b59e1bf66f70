//! Administrative routes for inspecting and changing rate limit policies.
//!
//! Mount under a prefix such as `/admin/rate-limits`. Authorizing callers is
//! the host application's responsibility.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::TollgateError;
use crate::ratelimit::{Admission, JanitorReport, JanitorStats, LimitSettings, PolicySnapshot};

/// Shared state for the admin routes.
#[derive(Clone)]
pub struct AdminState {
    pub admission: Arc<Admission>,
    /// Registry name and counters of each running janitor
    pub janitors: Vec<(String, Arc<JanitorStats>)>,
}

/// Body of `GET /`.
#[derive(Debug, Serialize)]
pub struct Overview {
    pub policies: PolicySnapshot,
    pub registries: Vec<RegistrySize>,
    pub janitors: Vec<JanitorReport>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct RegistrySize {
    pub name: String,
    pub buckets: usize,
}

/// Body of `PUT /endpoints`.
#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointLimitRequest {
    pub endpoint: String,
    pub requests_per_minute: u32,
    pub burst: u32,
}

/// Body of `DELETE /endpoints`.
#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointRef {
    pub endpoint: String,
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/", get(overview))
        .route("/tiers/:tier", put(set_tier_limits))
        .route("/endpoints", put(set_endpoint_limit).delete(remove_endpoint_limit))
        .with_state(state)
}

async fn overview(State(state): State<AdminState>) -> Json<Overview> {
    let registries = state
        .admission
        .registries()
        .iter()
        .map(|registry| RegistrySize {
            name: registry.name().to_string(),
            buckets: registry.len(),
        })
        .collect();
    let janitors = state
        .janitors
        .iter()
        .map(|(registry, stats)| stats.report(registry))
        .collect();

    Json(Overview {
        policies: state.admission.policies().snapshot(),
        registries,
        janitors,
    })
}

async fn set_tier_limits(
    State(state): State<AdminState>,
    Path(tier): Path<String>,
    Json(settings): Json<LimitSettings>,
) -> Result<Json<PolicySnapshot>, TollgateError> {
    info!(tier = %tier, ?settings, "Admin tier limit update");
    let policies = state.admission.policies();
    policies.set_tier_limits(&tier, settings.requests_per_minute, settings.burst)?;
    Ok(Json(policies.snapshot()))
}

async fn set_endpoint_limit(
    State(state): State<AdminState>,
    Json(request): Json<EndpointLimitRequest>,
) -> Result<Json<PolicySnapshot>, TollgateError> {
    info!(endpoint = %request.endpoint, "Admin endpoint limit update");
    let policies = state.admission.policies();
    policies.set_endpoint_limit(&request.endpoint, request.requests_per_minute, request.burst)?;
    Ok(Json(policies.snapshot()))
}

async fn remove_endpoint_limit(
    State(state): State<AdminState>,
    Json(request): Json<EndpointRef>,
) -> Result<StatusCode, TollgateError> {
    let removed = state
        .admission
        .policies()
        .remove_endpoint_limit(&request.endpoint)?;
    Ok(if removed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{AdmissionRequest, Identity, PolicyTable};
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use tower::ServiceExt;

    fn state() -> AdminState {
        AdminState {
            admission: Arc::new(Admission::with_shards(Arc::new(PolicyTable::new()), 2)),
            janitors: vec![("user".to_string(), Arc::new(JanitorStats::default()))],
        }
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_overview() {
        let state = state();
        state.admission.admit(&AdmissionRequest {
            identity: Some(Identity::new(1, "pro")),
            source_ip: "198.51.100.1".parse().unwrap(),
            endpoint: "GET /items".parse().unwrap(),
        });

        let response = router(state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["policies"]["tiers"]["pro"]["burst"], 50);
        assert_eq!(json["registries"][1]["name"], "user");
        assert_eq!(json["registries"][1]["buckets"], 1);
        assert_eq!(json["janitors"][0]["registry"], "user");
        assert_eq!(json["janitors"][0]["sweeps"], 0);
    }

    #[tokio::test]
    async fn test_set_tier_limits() {
        let state = state();
        let admission = Arc::clone(&state.admission);

        let response = router(state)
            .oneshot(json_request(
                "PUT",
                "/tiers/enterprise",
                serde_json::json!({"requests_per_minute": 6000, "burst": 1000}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(admission.policies().tier_policy("enterprise").capacity, 1000);
    }

    #[tokio::test]
    async fn test_invalid_tier_limits_rejected() {
        let response = router(state())
            .oneshot(json_request(
                "PUT",
                "/tiers/pro",
                serde_json::json!({"requests_per_minute": 0, "burst": 10}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_policy");
    }

    #[tokio::test]
    async fn test_endpoint_limit_lifecycle() {
        let state = state();
        let admission = Arc::clone(&state.admission);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/endpoints",
                serde_json::json!({
                    "endpoint": "POST /auth/register",
                    "requests_per_minute": 3,
                    "burst": 1
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let snapshot = body_json(response).await;
        assert_eq!(snapshot["endpoints"]["POST /auth/register"]["burst"], 1);

        let signature = "POST /auth/register".parse().unwrap();
        assert!(admission.policies().endpoint_policy(&signature).is_some());

        let delete = || {
            json_request(
                "DELETE",
                "/endpoints",
                serde_json::json!({"endpoint": "POST /auth/register"}),
            )
        };
        let response = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = app.oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_rejected() {
        let response = router(state())
            .oneshot(json_request(
                "PUT",
                "/endpoints",
                serde_json::json!({
                    "endpoint": "register",
                    "requests_per_minute": 3,
                    "burst": 1
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_endpoint");
    }
}
