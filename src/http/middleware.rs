//! axum middleware that gates requests through the admission engine.

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ratelimit::{
    Admission, AdmissionRequest, Decision, EndpointSignature, Identity, LimitingContext,
    UNAUTHENTICATED,
};

/// Client address resolved by the host's HTTP layer.
///
/// When present in the request extensions it is used as-is. Otherwise the
/// middleware resolves the address from proxy headers and the socket peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// JSON body of a `429 Too Many Requests` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    pub tier: String,
}

/// Admit or reject a request before it reaches the inner service.
///
/// Install with `axum::middleware::from_fn_with_state(admission, admission_middleware)`.
/// The authentication layer, if any, must run first and insert an
/// [`Identity`] into the request extensions. The caller's address comes from
/// a [`ClientIp`] extension or the socket peer; proxy headers are ignored.
pub async fn admission_middleware(
    State(admission): State<Arc<Admission>>,
    request: Request,
    next: Next,
) -> Response {
    let source_ip = client_ip(&request, false);
    gate(&admission, source_ip, request, next).await
}

/// Variant of [`admission_middleware`] that also trusts `X-Forwarded-For`
/// and `X-Real-IP`.
///
/// Use this only behind a reverse proxy that overwrites those headers.
pub async fn admission_middleware_with_proxy(
    State(admission): State<Arc<Admission>>,
    request: Request,
    next: Next,
) -> Response {
    let source_ip = client_ip(&request, true);
    gate(&admission, source_ip, request, next).await
}

async fn gate(admission: &Admission, source_ip: IpAddr, request: Request, next: Next) -> Response {
    let admission_request = AdmissionRequest {
        identity: request.extensions().get::<Identity>().cloned(),
        source_ip,
        endpoint: endpoint_signature(&request),
    };

    let decision = admission.admit(&admission_request);
    if decision.allowed {
        debug!(
            ip = %admission_request.source_ip,
            endpoint = %admission_request.endpoint,
            context = %decision.context,
            "Request admitted"
        );
        return next.run(request).await;
    }

    warn!(
        ip = %admission_request.source_ip,
        endpoint = %admission_request.endpoint,
        user_id = admission_request.identity.as_ref().map(|identity| identity.user_id),
        context = %decision.context,
        "Request rejected by rate limit"
    );
    rejection_response(admission, &admission_request, &decision)
}

/// Build the `429` response for a denied request.
///
/// The body names the caller's tier but never how many tokens remain.
pub fn rejection_response(
    admission: &Admission,
    request: &AdmissionRequest,
    decision: &Decision,
) -> Response {
    let tier = match &request.identity {
        Some(identity) => admission.policies().effective_tier(&identity.tier),
        None => UNAUTHENTICATED.to_string(),
    };

    let message = match &decision.context {
        LimitingContext::Endpoint(signature) => {
            format!("Too many requests to {}. Please try again later.", signature)
        }
        LimitingContext::Tier(tier) => {
            format!("Rate limit exceeded for the {} tier. Please slow down.", tier)
        }
        LimitingContext::Unauthenticated => {
            "Rate limit exceeded. Authenticate for higher limits or slow down.".to_string()
        }
    };

    let body = RejectionBody {
        error: "rate_limit_exceeded".to_string(),
        message,
        tier,
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

/// Method plus route template, falling back to the raw path when the
/// request did not go through a router.
fn endpoint_signature(request: &Request) -> EndpointSignature {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str())
        .unwrap_or_else(|| request.uri().path());
    EndpointSignature::new(request.method().as_str(), path)
}

fn client_ip(request: &Request, trust_proxy_headers: bool) -> IpAddr {
    if let Some(ClientIp(ip)) = request.extensions().get::<ClientIp>() {
        return *ip;
    }
    if trust_proxy_headers {
        if let Some(ip) = forwarded_ip(request.headers()) {
            return ip;
        }
    }
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip();
    }
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// Leftmost `X-Forwarded-For` entry, then `X-Real-IP`.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let from_xff = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok());
    if from_xff.is_some() {
        return from_xff;
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::PolicyTable;
    use axum::{
        body::{to_bytes, Body},
        middleware::from_fn_with_state,
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    fn app(admission: Arc<Admission>) -> Router {
        Router::new()
            .route("/items/:id", get(|| async { "item" }))
            .route("/auth/login", post(|| async { "welcome" }))
            .layer(from_fn_with_state(admission, admission_middleware_with_proxy))
    }

    fn engine() -> Arc<Admission> {
        let policies = PolicyTable::new();
        policies.set_endpoint_limit("POST /auth/login", 5, 2).unwrap();
        Arc::new(Admission::with_shards(Arc::new(policies), 4))
    }

    fn get_item(id: u32, ip: &str) -> Request<Body> {
        axum::http::Request::builder()
            .uri(format!("/items/{id}"))
            .header("x-forwarded-for", format!("{ip}, 10.0.0.1"))
            .body(Body::empty())
            .unwrap()
    }

    async fn rejection(response: Response) -> RejectionBody {
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_anonymous_requests_limited_per_ip() {
        let admission = engine();
        let app = app(Arc::clone(&admission));

        for id in 0..5 {
            let response = app.clone().oneshot(get_item(id, "198.51.100.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(get_item(99, "198.51.100.1")).await.unwrap();
        let body = rejection(response).await;
        assert_eq!(body.error, "rate_limit_exceeded");
        assert_eq!(body.tier, "unauthenticated");

        // another client is unaffected
        let response = app.oneshot(get_item(1, "198.51.100.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejection_body_shape() {
        let admission = engine();
        let app = app(Arc::clone(&admission));
        for _ in 0..5 {
            app.clone().oneshot(get_item(1, "198.51.100.3")).await.unwrap();
        }

        let response = app.oneshot(get_item(1, "198.51.100.3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        let object = json.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["error", "message", "tier"]);
    }

    #[tokio::test]
    async fn test_identity_extension_uses_tier_policy() {
        let admission = engine();
        let app = app(Arc::clone(&admission));

        let request = |ip: &str| {
            let mut request = get_item(1, ip);
            request.extensions_mut().insert(Identity::new(42, "starter"));
            request
        };

        // starter burst is 20, across any number of addresses
        for i in 0..20 {
            let response = app.clone().oneshot(request(&format!("10.1.0.{i}"))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let body = rejection(app.oneshot(request("10.1.0.200")).await.unwrap()).await;
        assert_eq!(body.tier, "starter");
    }

    #[tokio::test]
    async fn test_login_override_limits_every_tier() {
        let admission = engine();
        let app = app(Arc::clone(&admission));

        let login = || {
            let mut request = axum::http::Request::builder()
                .method("POST")
                .uri("/auth/login")
                .body(Body::empty())
                .unwrap();
            request
                .extensions_mut()
                .insert(ClientIp("203.0.113.50".parse().unwrap()));
            request.extensions_mut().insert(Identity::new(7, "business"));
            request
        };

        assert_eq!(app.clone().oneshot(login()).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.clone().oneshot(login()).await.unwrap().status(), StatusCode::OK);

        let body = rejection(app.oneshot(login()).await.unwrap()).await;
        assert_eq!(body.tier, "business");
        assert!(body.message.contains("POST /auth/login"));
    }

    #[tokio::test]
    async fn test_route_template_is_the_endpoint() {
        let admission = engine();
        admission
            .policies()
            .set_endpoint_limit("GET /items/:id", 60, 1)
            .unwrap();
        let app = app(Arc::clone(&admission));

        let first = app.clone().oneshot(get_item(1, "198.51.100.9")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        // a different concrete path maps to the same template
        let body = rejection(app.oneshot(get_item(2, "198.51.100.9")).await.unwrap()).await;
        assert!(body.message.contains("GET /items/:id"));
    }

    #[tokio::test]
    async fn test_proxy_headers_ignored_by_default() {
        let admission = engine();
        let app = Router::new()
            .route("/items/:id", get(|| async { "item" }))
            .layer(from_fn_with_state(Arc::clone(&admission), admission_middleware));

        let peer: SocketAddr = "198.51.100.77:40000".parse().unwrap();
        let spoofed = |i: u32| {
            let mut request = get_item(i, &format!("10.9.0.{i}"));
            request.extensions_mut().insert(ConnectInfo(peer));
            request
        };

        // rotating the forwarded address does not mint new buckets
        for i in 0..5 {
            let response = app.clone().oneshot(spoofed(i)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let body = rejection(app.oneshot(spoofed(5)).await.unwrap()).await;
        assert_eq!(body.tier, "unauthenticated");
        assert_eq!(admission.registries()[2].len(), 1);
    }

    #[test]
    fn test_client_ip_precedence() {
        let peer: SocketAddr = "198.51.100.5:1234".parse().unwrap();
        let mut request = axum::http::Request::builder()
            .header("x-real-ip", "192.0.2.10")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request, false), IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        request.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(client_ip(&request, false), peer.ip());
        assert_eq!(client_ip(&request, true), "192.0.2.10".parse::<IpAddr>().unwrap());

        request
            .extensions_mut()
            .insert(ClientIp("203.0.113.1".parse().unwrap()));
        assert_eq!(client_ip(&request, true), "203.0.113.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_forwarded_ip_resolution() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_ip(&headers), None);

        headers.insert("x-real-ip", "192.0.2.10".parse().unwrap());
        assert_eq!(forwarded_ip(&headers), Some("192.0.2.10".parse().unwrap()));

        headers.insert("x-forwarded-for", "192.0.2.20, 10.0.0.1".parse().unwrap());
        assert_eq!(forwarded_ip(&headers), Some("192.0.2.20".parse().unwrap()));

        headers.insert("x-forwarded-for", "garbage".parse().unwrap());
        assert_eq!(forwarded_ip(&headers), Some("192.0.2.10".parse().unwrap()));
    }
}
