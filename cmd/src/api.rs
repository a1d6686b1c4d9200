// Copyright 2022 Zinc Labs Inc. and Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use ingestor::{storage::Catalog, ErrorKind, IngestReport, Ingestor, SeriesId, WriteRequest};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub catalog: Arc<dyn Catalog>,
}

/// HTTP status for the first error of an ingest call.
pub fn status_for(kind: Option<ErrorKind>) -> StatusCode {
    match kind {
        None => StatusCode::OK,
        Some(ErrorKind::DataIntegrity) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::Transient) => StatusCode::SERVICE_UNAVAILABLE,
        Some(ErrorKind::Cancelled) => StatusCode::REQUEST_TIMEOUT,
        Some(ErrorKind::Storage) | Some(ErrorKind::Shutdown) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn write(
    State(state): State<AppState>,
    Json(req): Json<WriteRequest>,
) -> (StatusCode, Json<IngestReport>) {
    // Batches still queued when the client goes away are skipped.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let report = state.ingestor.ingest_with_cancel(req, &cancel).await;
    let status = status_for(report.first_error.as_ref().map(|e| e.kind()));
    if let Some(error) = &report.first_error {
        tracing::warn!(%error, failed = report.failed_batches, "write request failed");
    }
    (status, Json(report))
}

pub async fn series(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, String)> {
    match state.catalog.series_labels(SeriesId::new(id)).await {
        Ok(Some(labels)) => Ok(Json(json!({
            "status": "success",
            "data": { "id": id, "labels": labels },
        }))),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("series {id} not found"))),
        Err(e) => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}
