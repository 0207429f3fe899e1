use crate::{
    error::{Result, TailcastError},
    metrics,
    server::{
        id_validation::validate_resource_id,
        range::{RangeRequest, parse_range},
        state::AppState,
    },
    sink::ChunkSink,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{StreamExt, future, stream};
use std::io;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Chunks buffered between the cache tail and the response body.
const STREAM_BUFFER: usize = 16;

/// Stream a resource, producing it first if nobody has.
///
/// The response is held back until the first chunk arrives, so a production
/// that fails before emitting anything still becomes an error status. Once
/// the total length is known (production completed) the response carries
/// `Content-Length` and single `Range` requests are honoured.
pub async fn serve_stream(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    validate_resource_id(&id)?;
    info!("Streaming resource: {}", id);

    let content_type = state.coordinator.options().content_type();
    let length = state.coordinator.get_length(&id).await?;

    let requested = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let range = match (length, requested) {
        (Some(total), Some(value)) => match parse_range(value, total) {
            RangeRequest::Satisfiable(range) => Some((range, total)),
            RangeRequest::Unsatisfiable => {
                metrics::record_request("stream", 416);
                metrics::record_duration("stream", start);
                return Ok((
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{total}"))],
                )
                    .into_response());
            }
            RangeRequest::Ignored => None,
        },
        _ => None,
    };

    let (sink, mut chunks) = ChunkSink::channel(STREAM_BUFFER);
    let coordinator = state.coordinator.clone();
    let stream_id = id.clone();
    let streaming = tokio::spawn(async move {
        let result = coordinator.stream_to(&stream_id, sink).await;
        match &result {
            Ok(outcome) => debug!("Stream of {} ended: {:?}", stream_id, outcome),
            Err(e) => warn!("Stream of {} failed: {}", stream_id, e),
        }
        result
    });

    let Some(first) = chunks.recv().await else {
        // The sink closed without output: an empty resource or an error.
        let outcome = match streaming.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let err = TailcastError::from(e);
                metrics::record_request("stream", err.status().as_u16());
                metrics::record_duration("stream", start);
                return Err(err);
            }
            Err(e) => {
                return Err(TailcastError::InternalError(format!(
                    "stream task for {id} failed: {e}"
                )));
            }
        };
        if !outcome.is_complete() {
            return Err(TailcastError::InternalError(format!(
                "stream for {id} ended without data: {outcome:?}"
            )));
        }
        metrics::record_request("stream", 200);
        metrics::record_duration("stream", start);
        return Ok((StatusCode::OK, [(header::CONTENT_TYPE, content_type)]).into_response());
    };

    // Once the tail ends, anything short of a complete stream aborts the body
    // so the client sees a truncated transfer instead of a clean end.
    let rest = stream::unfold(
        (chunks, Some(streaming)),
        |(mut chunks, streaming)| async move {
            if let Some(chunk) = chunks.recv().await {
                return Some((Ok(chunk), (chunks, streaming)));
            }
            let failure = match streaming?.await {
                Ok(Ok(outcome)) if outcome.is_complete() => return None,
                Ok(Ok(outcome)) => format!("stream ended early: {outcome:?}"),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            Some((Err(io::Error::other(failure)), (chunks, None)))
        },
    );
    let body_chunks = stream::iter([Ok::<_, io::Error>(first)]).chain(rest);

    let response = match range {
        Some((range, total)) => {
            debug!("Serving {} of {} ({} bytes)", range.content_range(total), id, total);
            let sliced = body_chunks
                .scan(0u64, move |offset, item| {
                    let next = match item {
                        Ok(chunk) => {
                            let chunk_start = *offset;
                            *offset += chunk.len() as u64;
                            // Past the end of the range: stop reading the tail.
                            (chunk_start <= range.end)
                                .then(|| range.slice(chunk_start, chunk).map(Ok))
                        }
                        Err(e) => Some(Some(Err(e))),
                    };
                    future::ready(next)
                })
                .filter_map(future::ready);

            metrics::record_request("stream", 206);
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, range.len())
                .header(header::CONTENT_RANGE, range.content_range(total))
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from_stream(sliced))
        }
        None => {
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type);
            if let Some(total) = length {
                builder = builder
                    .header(header::CONTENT_LENGTH, total)
                    .header(header::ACCEPT_RANGES, "bytes");
            }

            metrics::record_request("stream", 200);
            builder.body(Body::from_stream(body_chunks))
        }
    };
    metrics::record_duration("stream", start);

    response.map_err(|e| TailcastError::InternalError(format!("failed to build response: {e}")))
}
