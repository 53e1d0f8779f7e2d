//! `POST /layers/check`.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/layers/check", post(check))
}

#[derive(Deserialize)]
pub struct LayersCheckRequest {
    image: String,
    digests: Vec<String>,
}

#[derive(Serialize)]
pub struct LayersCheckResponse {
    image: String,
    exists: Vec<String>,
    preheated_exists: Vec<String>,
    missing: Vec<String>,
}

async fn check(
    State(state): State<AppState>,
    Json(req): Json<LayersCheckRequest>,
) -> Result<Json<LayersCheckResponse>, AppError> {
    if req.digests.len() > state.config().max_digests_per_request {
        return Err(AppError::TooManyDigests);
    }
    info!(image = %req.image, digest_count = req.digests.len(), "layer presence check");

    // Fast path: the whole image was preheated on this node, so every
    // requested digest counts as preheated without touching the engine.
    let local = state.engine().list().await?;
    if local.contains(&req.image) && state.digest_index().is_preheated_image(&req.image).await {
        return Ok(Json(LayersCheckResponse {
            image: req.image,
            exists: Vec::new(),
            preheated_exists: req.digests,
            missing: Vec::new(),
        }));
    }

    let mut exists = Vec::new();
    let mut preheated_exists = Vec::new();
    let mut missing = Vec::new();

    for digest in req.digests {
        if state.engine().layer_present(&digest)? {
            if state.digest_index().is_preheated_digest(&digest).await {
                preheated_exists.push(digest);
            } else {
                exists.push(digest);
            }
        } else {
            missing.push(digest);
        }
    }

    Ok(Json(LayersCheckResponse {
        image: req.image,
        exists,
        preheated_exists,
        missing,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_deserializes_from_spec_shape() {
        let raw = r#"{"image":"alpine:3.19","digests":["sha256:a","sha256:b"]}"#;
        let parsed: LayersCheckRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.image, "alpine:3.19");
        assert_eq!(parsed.digests.len(), 2);
    }
}
