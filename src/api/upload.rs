//! Streaming multipart intake for custom images.

use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Json,
};

use super::AppState;
use crate::custom::{CustomImageMetadata, StagedUpload, UploadKind};
use crate::error::{Result, ServerError};
use crate::library::ImageRecord;

/// POST /api/custom/images
///
/// File parts (`kernel`, `initrd`, `rootfs`, `manifest`) are streamed chunk
/// by chunk into staging; every other part is a metadata text field.
pub async fn upload_custom_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ImageRecord>)> {
    let mut metadata = CustomImageMetadata::default();
    let mut uploads: Vec<StagedUpload> = Vec::new();

    if let Err(e) = read_parts(&state, &mut multipart, &mut metadata, &mut uploads).await {
        for upload in uploads {
            upload.file.discard().await;
        }
        return Err(e);
    }

    let image = state.intake.ingest(metadata, uploads).await?;
    Ok((StatusCode::CREATED, Json(image)))
}

async fn read_parts(
    state: &AppState,
    multipart: &mut Multipart,
    metadata: &mut CustomImageMetadata,
    uploads: &mut Vec<StagedUpload>,
) -> Result<()> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::Validation(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();

        let Some(kind) = UploadKind::from_field(&name) else {
            let value = field
                .text()
                .await
                .map_err(|e| ServerError::Validation(format!("unreadable field {}: {}", name, e)))?;
            if !metadata.set_field(&name, value) {
                tracing::debug!("Ignoring unknown form field {:?}", name);
            }
            continue;
        };

        let mut sink = state.library.store().stage().await?;
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = sink.write(&chunk).await {
                        sink.abort().await;
                        return Err(ServerError::Storage(format!(
                            "failed to stage {}: {}",
                            name, e
                        )));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    sink.abort().await;
                    return Err(ServerError::Validation(format!(
                        "upload of {} interrupted: {}",
                        name, e
                    )));
                }
            }
        }

        // Browsers send empty parts for untouched file inputs
        if sink.written() == 0 {
            sink.abort().await;
            continue;
        }

        let file = sink
            .finish()
            .await
            .map_err(|e| ServerError::Storage(format!("failed to stage {}: {}", name, e)))?;
        tracing::debug!("Staged {} ({} bytes)", name, file.size);
        uploads.push(StagedUpload { kind, file });
    }

    Ok(())
}
