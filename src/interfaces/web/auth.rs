use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;

pub(crate) fn is_loopback(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "::1" | "localhost")
}

/// Byte-wise comparison that does not stop at the first mismatch.
fn tokens_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "success": false,
            "error": message,
            "kind": "unauthorized"
        })),
    )
        .into_response()
}

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // No token configured: open access only on loopback
    let Some(expected) = state.api_token.as_deref().filter(|t| !t.is_empty()) else {
        if is_loopback(&state.api_host) {
            return next.run(req).await;
        }
        return unauthorized(
            "No API token configured. Set [api] token in config.toml before exposing vpsorch on a non-loopback address.",
        );
    };

    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    match bearer {
        None => unauthorized("Missing or invalid Authorization header. Use: Bearer <token>"),
        Some(token) if tokens_match(token, expected) => next.run(req).await,
        Some(_) => unauthorized("Invalid API token"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::web::test_support::test_state;
    use axum::{Router, middleware, routing::get};
    use serde_json::json;
    use tower::util::ServiceExt;

    fn protected_app(state: AppState) -> Router {
        Router::new()
            .route("/api/ping", get(|| async { Json(json!({ "ok": true })) }))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state)
    }

    async fn request_ping_status(app: Router, headers: Vec<(&str, String)>) -> StatusCode {
        let mut req_builder = Request::builder().uri("/api/ping");
        for (k, v) in headers {
            req_builder = req_builder.header(k, v);
        }
        let req = req_builder.body(Body::empty()).expect("request should build");
        app.oneshot(req)
            .await
            .expect("oneshot should succeed")
            .status()
    }

    #[test]
    fn token_comparison_requires_exact_match() {
        assert!(tokens_match("abc123", "abc123"));
        assert!(!tokens_match("abc124", "abc123"));
        assert!(!tokens_match("abc", "abc123"));
    }

    #[tokio::test]
    async fn no_token_on_loopback_allows_request() {
        let (state, _) = test_state("127.0.0.1", None);
        let status = request_ping_status(protected_app(state), vec![]).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn no_token_on_non_loopback_rejects_request() {
        let (state, _) = test_state("0.0.0.0", None);
        let status = request_ping_status(protected_app(state), vec![]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn configured_token_requires_authorization_header() {
        let (state, _) = test_state("127.0.0.1", Some("s3cret-token"));
        let status = request_ping_status(protected_app(state), vec![]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_bearer_token_is_accepted() {
        let (state, _) = test_state("0.0.0.0", Some("s3cret-token"));
        let status = request_ping_status(
            protected_app(state),
            vec![("authorization", "Bearer s3cret-token".to_string())],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_bearer_token_is_rejected() {
        let (state, _) = test_state("127.0.0.1", Some("s3cret-token"));
        let status = request_ping_status(
            protected_app(state),
            vec![("authorization", "Bearer guess".to_string())],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
