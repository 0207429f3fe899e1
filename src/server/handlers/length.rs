use crate::{
    error::Result, metrics, server::id_validation::validate_resource_id, server::state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct LengthResponse {
    pub id: String,
    /// Total bytes, once production has completed.
    pub length: Option<u64>,
    pub cached: bool,
}

/// Report the byte length of a resource.
///
/// `length` is `null` until production has completed; `cached` tells a
/// resource still being produced apart from one that was never requested.
pub async fn serve_length(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<LengthResponse>> {
    let start = Instant::now();
    validate_resource_id(&id)?;

    let length = state.coordinator.get_length(&id).await?;
    let cached = match length {
        Some(_) => true,
        None => state.coordinator.has(&id).await?,
    };

    metrics::record_request("length", 200);
    metrics::record_duration("length", start);
    Ok(Json(LengthResponse { id, length, cached }))
}
