use crate::config::ApiConfig;
use crate::decision::{decide, AuthRequest, Decision};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use hivelink_pipeline::directory::DeviceDirectory;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<dyn DeviceDirectory>,
    /// The only virtual host devices may open
    pub vhost: Arc<str>,
}

/// Union of the fields the broker sends to the four hooks
#[derive(Debug, Default, Deserialize)]
pub struct HookForm {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub vhost: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub routing_key: Option<String>,
}

impl HookForm {
    /// Build the request for a hook. Missing or unknown fields yield `None`.
    pub fn into_request(self, hook: &str) -> Option<AuthRequest> {
        let username = self.username?;
        let request = match hook {
            "user" => AuthRequest::User {
                username,
                password: self.password,
            },
            "vhost" => AuthRequest::Vhost {
                username,
                vhost: self.vhost?,
            },
            "resource" => AuthRequest::Resource {
                username,
                kind: self.resource?.parse().ok()?,
                name: self.name?,
                permission: self.permission?.parse().ok()?,
            },
            "topic" => AuthRequest::Topic {
                username,
                name: self.name?,
                permission: self.permission?.parse().ok()?,
                routing_key: self.routing_key?,
            },
            _ => return None,
        };
        Some(request)
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/auth/:template_id/:hook", post(authorize))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "authz-service"
    }))
}

#[instrument(skip(state, form))]
async fn authorize(
    State(state): State<AppState>,
    Path((template_id, hook)): Path<(String, String)>,
    Form(form): Form<HookForm>,
) -> impl IntoResponse {
    if !matches!(hook.as_str(), "user" | "vhost" | "resource" | "topic") {
        return (StatusCode::NOT_FOUND, Decision::Deny.as_str());
    }

    let Some(request) = form.into_request(&hook) else {
        debug!("Incomplete hook request");
        return (StatusCode::OK, Decision::Deny.as_str());
    };

    let device = match state.directory.device(request.username()).await {
        Ok(device) => device,
        Err(e) => {
            warn!(error = %e, username = %request.username(), "Device lookup failed, denying");
            return (StatusCode::OK, Decision::Deny.as_str());
        }
    };

    let decision = decide(&request, &template_id, device.as_ref(), &state.vhost);
    debug!(username = %request.username(), decision = decision.as_str(), "Decided");
    (StatusCode::OK, decision.as_str())
}

/// Start the API server, stopping when `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state);
    let addr = config.address();

    info!(address = %addr, "Starting authorization API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use hivelink_pipeline::directory::{DeviceRecord, DirectoryError, MockDeviceDirectory};
    use tower::ServiceExt;

    fn app(directory: MockDeviceDirectory) -> Router {
        create_router(AppState {
            directory: Arc::new(directory),
            vhost: Arc::from("/"),
        })
    }

    fn known_x1() -> MockDeviceDirectory {
        let mut directory = MockDeviceDirectory::new();
        directory.expect_device().returning(|id| {
            Ok((id == "X1").then(|| DeviceRecord {
                id: "X1".to_string(),
                template_id: "T1".to_string(),
                psk: "secret".to_string(),
            }))
        });
        directory
    }

    async fn call(app: Router, uri: &str, body: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_resource_hook() {
        let body = "username=X1&vhost=%2F&resource=exchange&name=T1.protocol&permission=write";
        let (status, decision) = call(app(known_x1()), "/auth/T1/resource", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decision, "allow");

        let body = "username=X2&vhost=%2F&resource=exchange&name=T1.protocol&permission=write";
        let (_, decision) = call(app(known_x1()), "/auth/T1/resource", body).await;
        assert_eq!(decision, "deny");
    }

    #[tokio::test]
    async fn test_topic_hook() {
        let body = "username=X1&vhost=%2F&resource=topic&name=T1.protocol&permission=read&routing_key=X1.obs.5";
        let (_, decision) = call(app(known_x1()), "/auth/T1/topic", body).await;
        assert_eq!(decision, "allow");

        let body = "username=X1&vhost=%2F&resource=topic&name=T1.protocol&permission=read&routing_key=X2.obs.5";
        let (_, decision) = call(app(known_x1()), "/auth/T1/topic", body).await;
        assert_eq!(decision, "deny");
    }

    #[tokio::test]
    async fn test_user_hook_and_incomplete_form() {
        let (_, decision) = call(app(known_x1()), "/auth/T1/user", "username=X1&password=secret").await;
        assert_eq!(decision, "allow");

        let (_, decision) = call(app(known_x1()), "/auth/T1/resource", "username=X1").await;
        assert_eq!(decision, "deny");
    }

    #[tokio::test]
    async fn test_directory_failure_denies() {
        let mut directory = MockDeviceDirectory::new();
        directory
            .expect_device()
            .returning(|_| Err(DirectoryError::ConnectionError("refused".into())));
        let (status, decision) =
            call(app(directory), "/auth/T1/user", "username=X1&password=secret").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decision, "deny");
    }

    #[tokio::test]
    async fn test_unknown_hook_not_found() {
        let (status, _) = call(app(MockDeviceDirectory::new()), "/auth/T1/admin", "username=X1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app(MockDeviceDirectory::new()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
