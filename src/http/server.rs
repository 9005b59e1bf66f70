//! HTTP server implementation.

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::admin::{self, AdminState};
use super::middleware::{admission_middleware, admission_middleware_with_proxy};
use super::service::check;
use crate::error::{Result, TollgateError};

/// Build the service router.
///
/// - `GET /healthz` and `POST /v1/check` (the decision endpoint) are open.
/// - The admin routes live under `/admin/rate-limits` and are themselves
///   gated by the admission middleware. Proxy headers identify the caller
///   only when `trust_proxy_headers` is set.
pub fn app(state: AdminState, trust_proxy_headers: bool) -> Router {
    let admission = Arc::clone(&state.admission);

    let admin = Router::new().nest("/admin/rate-limits", admin::router(state));
    let admin = if trust_proxy_headers {
        admin.layer(from_fn_with_state(
            Arc::clone(&admission),
            admission_middleware_with_proxy,
        ))
    } else {
        admin.layer(from_fn_with_state(Arc::clone(&admission), admission_middleware))
    };

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/v1/check", post(check))
        .with_state(admission)
        .merge(admin)
}

/// HTTP server for the admission service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The routes to serve
    router: Router,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Admission, PolicyTable};
    use axum::{
        body::{to_bytes, Body},
        extract::ConnectInfo,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn state() -> AdminState {
        AdminState {
            admission: Arc::new(Admission::with_shards(Arc::new(PolicyTable::new()), 2)),
            janitors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = app(state(), false)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    fn overview(real_ip: &str) -> Request<Body> {
        let mut request = Request::builder()
            .uri("/admin/rate-limits")
            .header("x-real-ip", real_ip)
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 44], 50000))));
        request
    }

    #[tokio::test]
    async fn test_admin_routes_are_rate_limited() {
        let app = app(state(), false);

        // a rotating X-Real-IP is not trusted, the socket peer is
        for i in 0..5 {
            let response = app.clone().oneshot(overview(&format!("10.0.0.{i}"))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.oneshot(overview("10.0.0.99")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_trusted_proxy_headers_identify_callers() {
        let app = app(state(), true);

        for _ in 0..5 {
            let response = app.clone().oneshot(overview("10.0.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(overview("10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.oneshot(overview("10.0.0.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_server_shuts_down_on_signal() {
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), app(state(), false));
        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
