use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Auth configuration for the gateway.
#[derive(Clone, Default)]
pub struct AuthConfig {
    /// API keys that are allowed to call the API. Empty = no auth required.
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    /// Accept any of `api_keys`.
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }

    /// Returns true if authentication is enabled (at least one key configured).
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    fn accepts(&self, presented: &str) -> bool {
        self.api_keys.iter().any(|k| constant_time_eq(k, presented))
    }
}

/// Compare two secrets without leaking where they differ.
fn constant_time_eq(expected: &str, presented: &str) -> bool {
    let a = expected.as_bytes();
    let b = presented.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Auth middleware: validates `Authorization: Bearer <key>`.
///
/// If no API keys are configured, all requests are allowed.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() {
        return next.run(request).await;
    }

    let key = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match key {
        Some(k) if auth.accepts(k) => next.run(request).await,
        Some(_) => {
            warn!("Rejected request: invalid API key");
            (StatusCode::UNAUTHORIZED, "Invalid API key").into_response()
        }
        None => {
            warn!("Rejected request: missing API key");
            (StatusCode::UNAUTHORIZED, "API key required").into_response()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware as axum_mw, routing::get, Router};
    use tower::ServiceExt;

    fn app(keys: Vec<String>) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum_mw::from_fn_with_state(
                Arc::new(AuthConfig::new(keys)),
                auth_middleware,
            ))
    }

    async fn status(app: Router, auth: Option<&str>) -> StatusCode {
        let mut req = axum::http::Request::builder().uri("/");
        if let Some(value) = auth {
            req = req.header("authorization", value);
        }
        app.oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[test]
    fn test_auth_config_disabled() {
        assert!(!AuthConfig::new(vec![]).is_enabled());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("key123", "key123"));
        assert!(!constant_time_eq("key123", "key124"));
        assert!(!constant_time_eq("key123", "key12"));
    }

    #[tokio::test]
    async fn test_open_when_no_keys() {
        assert_eq!(status(app(vec![]), None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bearer_key_checked() {
        let keys = vec!["s3cret".to_string()];
        assert_eq!(status(app(keys.clone()), None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            status(app(keys.clone()), Some("Bearer wrong")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status(app(keys), Some("Bearer s3cret")).await, StatusCode::OK);
    }
}
