use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use tracing::{instrument, warn};

use crate::{
    auth::{
        dto::{LoginRequest, LoginResponse, RegisterRequest, SanitizedUser},
        services,
    },
    error::{AppError, AppResult},
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/api/login", post(login))
        .route("/api/users", post(register))
}

/// Body extraction failures are client faults and answer 400 like any other
/// validation error.
pub(crate) fn bad_body(rejection: JsonRejection) -> AppError {
    warn!(error = %rejection.body_text(), "rejected request body");
    AppError::validation(format!("invalid request body: {}", rejection.body_text()))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<SanitizedUser>)> {
    let Json(payload) = payload.map_err(bad_body)?;
    let user = services::register(state.users.as_ref(), &state.passwords, payload).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AppResult<Json<LoginResponse>> {
    let Json(payload) = payload.map_err(bad_body)?;
    let user = services::login(state.users.as_ref(), &state.passwords, payload).await?;
    Ok(Json(LoginResponse::authenticated(user)))
}
