use crate::{
    error::Result, metrics, server::id_validation::validate_resource_id, server::state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct WarmResponse {
    pub id: String,
    /// Whether this request started production.
    pub triggered: bool,
}

/// Start producing a resource without streaming it.
///
/// Responds once the first bytes are cached (or the resource already was),
/// so a following `GET /stream/{id}` never triggers production itself.
pub async fn warm(Path(id): Path<String>, State(state): State<AppState>) -> Result<Response> {
    let start = Instant::now();
    validate_resource_id(&id)?;

    let triggered = state.coordinator.warm(&id).await?;
    info!("Warm {}: production triggered = {}", id, triggered);

    metrics::record_request("warm", 202);
    metrics::record_duration("warm", start);
    Ok((
        StatusCode::ACCEPTED,
        Json(WarmResponse { id, triggered }),
    )
        .into_response())
}
