//! `GET /images/check`, `GET /images/download`.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/images/check", get(check))
        .route("/images/download", get(download))
}

#[derive(Deserialize)]
pub struct ImageQuery {
    image: Option<String>,
}

#[derive(Serialize)]
struct ExistsBody {
    exists: bool,
}

async fn check(
    State(state): State<AppState>,
    Query(q): Query<ImageQuery>,
) -> Result<Response, AppError> {
    let image = q.image.filter(|s| !s.is_empty()).ok_or(AppError::MissingParam("image"))?;
    info!(image, "image existence check");

    let local = state.engine().list().await?;
    if local.contains(&image) {
        Ok((StatusCode::OK, Json(ExistsBody { exists: true })).into_response())
    } else {
        Ok((StatusCode::NOT_FOUND, Json(ExistsBody { exists: false })).into_response())
    }
}

async fn download(
    State(state): State<AppState>,
    Query(q): Query<ImageQuery>,
) -> Result<Response, AppError> {
    let Some(permit) = state.download_gate().try_acquire() else {
        warn!("download-serve slot unavailable, rejecting");
        return Err(AppError::Busy);
    };

    let image = q.image.filter(|s| !s.is_empty()).ok_or(AppError::MissingParam("image"))?;
    info!(image, "serving P2P image download");

    let export = state.engine().export(&image).await?;
    let throttled = state.rate_bucket().throttle(export);

    // The download-serve permit must outlive every chunk yielded below;
    // moving it into the stream ties its release to the stream's own
    // drop, which axum runs once the body is fully sent or the client
    // disconnects.
    let stream = throttled.into_stream().map(move |chunk| {
        let _permit = &permit;
        chunk
    });
    let body = axum::body::Body::from_stream(stream);

    let headers = [
        (header::CONTENT_TYPE, "application/x-tar".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={image}.tar"),
        ),
    ];

    Ok((headers, body).into_response())
}
