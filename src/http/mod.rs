//! HTTP surface: admission middleware, decision endpoint, and admin routes.

pub mod admin;
mod middleware;
mod server;
mod service;

pub use admin::AdminState;
pub use middleware::{
    admission_middleware, admission_middleware_with_proxy, rejection_response, ClientIp,
    RejectionBody,
};
pub use server::{app, HttpServer};
pub use service::{check, CheckRequest};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use crate::error::TollgateError;

impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            TollgateError::InvalidPolicy(_) => (StatusCode::BAD_REQUEST, "invalid_policy"),
            TollgateError::InvalidEndpoint(_) => (StatusCode::BAD_REQUEST, "invalid_endpoint"),
            _ => {
                error!(error = %self, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(serde_json::json!({
                "error": code,
                "message": message,
            })),
        )
            .into_response()
    }
}
