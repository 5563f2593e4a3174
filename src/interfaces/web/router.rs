use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{audit, docker, hosts, nginx, schedules, terminal};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/vps", get(hosts::list_hosts_endpoint))
        .route("/api/vps/onboard", post(hosts::onboard_endpoint))
        .route(
            "/api/vps/{id}",
            get(hosts::get_host_endpoint).delete(hosts::delete_host_endpoint),
        )
        .route("/api/vps/{id}/health", post(hosts::health_endpoint))
        .route("/api/vps/{id}/bootstrap", post(hosts::bootstrap_endpoint))
        .route("/api/vps/{id}/terminal", get(terminal::host_terminal_endpoint))
        .route(
            "/api/vps/{id}/nginx/configs",
            get(nginx::list_configs_endpoint).post(nginx::create_config_endpoint),
        )
        .route(
            "/api/vps/{id}/nginx/configs/{version}",
            get(nginx::get_config_endpoint),
        )
        .route("/api/vps/{id}/nginx/preview", post(nginx::preview_endpoint))
        .route("/api/vps/{id}/nginx/apply", post(nginx::apply_endpoint))
        .route("/api/vps/{id}/nginx/revert", post(nginx::revert_endpoint))
        .route("/api/vps/{id}/nginx/status", get(nginx::status_endpoint))
        .route("/api/nginx/templates", get(nginx::templates_endpoint))
        .route("/api/vps/{id}/docker/status", get(docker::status_endpoint))
        .route(
            "/api/vps/{id}/docker/containers",
            get(docker::containers_endpoint),
        )
        .route("/api/vps/{id}/docker/images", get(docker::images_endpoint))
        .route(
            "/api/vps/{id}/docker/container/action",
            post(docker::container_action_endpoint),
        )
        .route(
            "/api/vps/{id}/docker/containers/{container_id}/terminal",
            get(terminal::container_terminal_endpoint),
        )
        .route(
            "/api/vps/{id}/schedules",
            get(schedules::list_schedules_endpoint).post(schedules::create_schedule_endpoint),
        )
        .route(
            "/api/schedules/{id}",
            get(schedules::get_schedule_endpoint)
                .put(schedules::update_schedule_endpoint)
                .delete(schedules::delete_schedule_endpoint),
        )
        .route(
            "/api/schedules/{id}/execute",
            post(schedules::execute_schedule_endpoint),
        )
        .route(
            "/api/schedules/{id}/toggle",
            post(schedules::toggle_schedule_endpoint),
        )
        .route(
            "/api/schedules/{id}/executions",
            get(schedules::executions_endpoint),
        )
        .route("/api/audit", get(audit::recent_audit_endpoint))
        .route("/api/audit/{task_id}", get(audit::audit_task_endpoint))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}
