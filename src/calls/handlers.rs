use axum::{extract::State, routing::get, Json, Router};
use tracing::instrument;

use crate::{calls::repo::CallSummaryRow, error::AppResult, state::AppState};

pub fn calls_routes() -> Router<AppState> {
    Router::new().route("/api/data", get(list_call_summary))
}

/// GET /api/data: every row of the call summary table, unpaged.
#[instrument(skip(state))]
pub async fn list_call_summary(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<CallSummaryRow>>> {
    let rows = state.calls.fetch_all().await?;
    Ok(Json(rows))
}
