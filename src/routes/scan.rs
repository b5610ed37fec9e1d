use std::convert::Infallible;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::app_state::AppState;
use crate::models::api::SubmitResponse;
use crate::models::event::ScanSnapshot;
use crate::models::scan::ScanStatus;
use crate::services::coordinator::CoordinatorError;
use crate::services::preprocess::PreprocessError;
use crate::services::store::StoreError;

fn error_status(err: &CoordinatorError) -> StatusCode {
    match err {
        CoordinatorError::Preprocess(PreprocessError::Decode(_)) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        CoordinatorError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::Store(_) => StatusCode::BAD_GATEWAY,
        CoordinatorError::Preprocess(PreprocessError::Encode(_))
        | CoordinatorError::Join(_)
        | CoordinatorError::Stopped => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /api/v1/scans — Upload an image and start scanning it.
pub async fn submit_scan(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, StatusCode> {
    let mut image: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        if field.name() == Some("image") {
            let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;

            // Small images are uploaded as-is, so check the format up front
            image::guess_format(&data).map_err(|_| StatusCode::UNSUPPORTED_MEDIA_TYPE)?;

            image = Some(data.to_vec());
        }
    }

    let image = image.ok_or(StatusCode::BAD_REQUEST)?;

    let scan_id = state.coordinator.submit(&image).await.map_err(|e| {
        tracing::warn!(error = %e, "Scan submission failed");
        error_status(&e)
    })?;

    Ok(Json(SubmitResponse {
        scan_id,
        status: ScanStatus::Uploading,
        message: "Image submitted for scanning".to_string(),
    }))
}

/// GET /api/v1/scans/current — Aggregated state of the active scan.
pub async fn current_scan(State(state): State<AppState>) -> Result<Json<ScanSnapshot>, StatusCode> {
    state
        .coordinator
        .snapshot()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// DELETE /api/v1/scans/current — Abandon the active scan.
pub async fn abandon_scan(State(state): State<AppState>) -> StatusCode {
    match state.coordinator.abandon().await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            tracing::warn!(error = %e, "Abandoning scan failed");
            error_status(&e)
        }
    }
}

/// GET /api/v1/scans/events — Lifecycle events as server-sent events.
pub async fn scan_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.coordinator.events();
    let coordinator = state.coordinator.clone();

    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match Event::default().event("lifecycle").json_data(&event) {
                    Ok(sse) => return Some((Ok::<_, Infallible>(sse), receiver)),
                    Err(e) => tracing::warn!(error = %e, "Failed to encode lifecycle event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    // End the stream with the coordinator so graceful shutdown can drain
    let stream = stream.take_until(async move { coordinator.stopped().await });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
