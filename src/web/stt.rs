//! Speech-to-text: forwards an uploaded audio file to the provider's
//! transcription endpoint.

use crate::web::auth::{attach_session, Session};
use crate::{ApiError, AppState, ErrorType, Surface};
use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

const AUDIO_FIELD: &str = "file";

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route(
            "/api/stt",
            post(transcribe).layer(from_fn_with_state(app_state.clone(), attach_session)),
        )
        .with_state(app_state)
}

struct AudioUpload {
    file_name: String,
    content_type: Option<String>,
    data: Bytes,
}

async fn read_audio(multipart: &mut Multipart) -> Result<Option<AudioUpload>, String> {
    while let Some(field) = multipart.next_field().await.map_err(|e| e.to_string())? {
        if field.name() != Some(AUDIO_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or("audio.webm").to_string();
        let content_type = field.content_type().map(ToString::to_string);
        let data = field.bytes().await.map_err(|e| e.to_string())?;
        if data.is_empty() {
            return Ok(None);
        }
        return Ok(Some(AudioUpload {
            file_name,
            content_type,
            data,
        }));
    }
    Ok(None)
}

async fn transcribe(
    State(state): State<Arc<AppState>>,
    session: Option<Extension<Session>>,
    mut multipart: Multipart,
) -> Response {
    let Some(Extension(session)) = session else {
        return ApiError::new(ErrorType::Unauthorized, Surface::Auth).into_response();
    };

    let upload = match read_audio(&mut multipart).await {
        Ok(Some(upload)) => upload,
        Ok(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "No audio file provided"})),
            )
                .into_response()
        }
        Err(e) => {
            debug!("Unreadable multipart body: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "No audio file provided"})),
            )
                .into_response();
        }
    };

    debug!(
        "Transcribing {} ({} bytes) for user {}",
        upload.file_name,
        upload.data.len(),
        session.user_id
    );
    match state
        .provider
        .transcribe(upload.file_name, upload.content_type, upload.data)
        .await
    {
        Ok(text) => Json(json!({ "text": text })).into_response(),
        Err(e) => {
            error!("Transcription failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to transcribe audio"})),
            )
                .into_response()
        }
    }
}
