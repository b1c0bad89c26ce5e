// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Firmware blob endpoints: multipart upload, listing, deletion, and the
//! raw download route.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use super::{envelope, ok};
use crate::coordinator::Coordinator;
use crate::error::ApiError;

/// `POST /api/firmware/upload` — multipart fields `project` and `file`.
pub async fn upload(
    State(coord): State<Arc<Coordinator>>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut project: Option<String> = None;
    let mut file_name: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("multipart: {e}")))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("project") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("project field: {e}")))?;
                project = Some(text);
            }
            Some("file") => {
                file_name = field.file_name().map(str::to_owned);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("file field: {e}")))?;
                data = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    let project = project.ok_or_else(|| ApiError::bad_request("missing project field"))?;
    let file_name = file_name.ok_or_else(|| ApiError::bad_request("missing file name"))?;
    let data = data.ok_or_else(|| ApiError::bad_request("missing file field"))?;

    let size = coord.firmware.save(&project, &file_name, &data).await?;
    envelope(serde_json::json!({ "project": project, "file": file_name, "size": size }))
}

/// `GET /api/firmware/list`
pub async fn list(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    envelope(serde_json::json!({ "projects": coord.firmware.list().await? }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub project: String,
    #[serde(default)]
    pub file: Option<String>,
}

/// `DELETE /api/firmware/delete`
pub async fn remove(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord.firmware.delete(&request.project, request.file.as_deref()).await?;
    ok()
}

/// `GET /firmware/{project}/{file}` — raw blob download.
///
/// Name validation happens in [`crate::firmware::FirmwareStore`]; anything
/// with `..` or a separator is a `bad_request` before the filesystem is
/// touched.
pub async fn download(
    State(coord): State<Arc<Coordinator>>,
    Path((project, file)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let data = coord.firmware.read(&project, &file).await?;
    let disposition = format!("attachment; filename=\"{file}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    ))
}
