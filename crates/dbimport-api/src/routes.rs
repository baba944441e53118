use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dbimport_processing::{ImportReport, NotificationError, ProcessingError, StorageNotification};
use serde_json::json;
use tracing::{error, warn};

use crate::state::AppState;

const CE_TYPE: &str = "ce-type";
const CE_SOURCE: &str = "ce-source";
const CE_ID: &str = "ce-id";

pub struct ApiError(ProcessingError);

impl From<ProcessingError> for ApiError {
    fn from(value: ProcessingError) -> Self {
        ApiError(value)
    }
}

impl From<NotificationError> for ApiError {
    fn from(value: NotificationError) -> Self {
        ApiError(value.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ProcessingError::Notification(_) => StatusCode::BAD_REQUEST,
            ProcessingError::NotFound { .. } => StatusCode::NOT_FOUND,
            ProcessingError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ProcessingError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ProcessingError::Config(_)
            | ProcessingError::Storage(_)
            | ProcessingError::Insert { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("import failed: {}", self.0);
        } else {
            warn!("request rejected: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Receives a storage-change notification in CloudEvents binary or
/// structured mode and imports the object it names.
pub async fn notify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ImportReport>, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

    let notification = match header(CE_TYPE) {
        Some(event_type) => {
            StorageNotification::from_binary(event_type, header(CE_SOURCE), header(CE_ID), &body)?
        }
        None => StorageNotification::from_structured(&body)?,
    };

    let report = state
        .request_context()
        .process_notification(&notification)
        .await?;
    Ok(Json(report))
}

pub async fn healthz() -> &'static str {
    "ok"
}
