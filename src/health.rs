use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::error;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub services: ServiceStatus,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub postgres: ServiceHealth,
    pub mongodb: ServiceHealth,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub status: &'static str,
}

impl ServiceHealth {
    fn from_result<E: std::fmt::Display>(service: &str, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self { status: "healthy" },
            Err(e) => {
                error!(service, error = %e, "health check failed");
                Self {
                    status: "unhealthy",
                }
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub endpoints: [&'static str; 5],
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
}

/// Pings both stores; 503 if either is down. Failure detail goes to the log only.
pub async fn health_check(State(state): State<AppState>) -> Response {
    let (pg, mongo) = tokio::join!(state.calls.ping(), state.users.ping());
    let services = ServiceStatus {
        postgres: ServiceHealth::from_result("postgres", pg),
        mongodb: ServiceHealth::from_result("mongodb", mongo),
    };

    let healthy = services.postgres.is_healthy() && services.mongodb.is_healthy();
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        services,
    };

    if healthy {
        (StatusCode::OK, Json(response)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response)).into_response()
    }
}

pub async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
        started_at: state.started_at,
        endpoints: [
            "GET /",
            "GET /health",
            "GET /api/data",
            "POST /api/login",
            "POST /api/users",
        ],
    })
}
