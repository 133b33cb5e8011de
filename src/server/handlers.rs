//! HTTP request handlers
//!
//! Every response uses the enveloped schema `{data | error}`.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::server::state::ServerState;
use crate::utils::version_info;

/// Success envelope
#[derive(Debug, Serialize)]
pub struct DataEnvelope<T: Serialize> {
    pub data: T,
}

/// Error envelope
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

/// Health check response body
#[derive(Debug, Serialize)]
pub struct HealthData {
    pub name: String,
    pub version: String,
    pub status: String,
    pub api_version: String,
}

/// Health check handler
pub async fn health_handler(
    State(state): State<Arc<ServerState>>,
) -> Json<DataEnvelope<HealthData>> {
    let snapshot = state.status.read().await.clone();
    Json(DataEnvelope {
        data: HealthData {
            name: state.service_name.clone(),
            version: version_info().version,
            status: snapshot.service_status().to_string(),
            api_version: state.api_version.clone(),
        },
    })
}

/// Echo response body
#[derive(Debug, Serialize)]
pub struct EchoData {
    pub path_value: String,
    pub body_value: serde_json::Value,
}

/// Echo/fail check handler used by monitoring probes
pub async fn check_handler(
    Path(action): Path<String>,
    body: String,
) -> Result<Json<DataEnvelope<EchoData>>, (StatusCode, Json<ErrorEnvelope>)> {
    if action == "fail" {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorEnvelope {
                error: ErrorBody {
                    message: "requested failure".to_string(),
                },
            }),
        ));
    }

    let body_value = match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => value,
        Err(_) => serde_json::Value::String(body),
    };

    Ok(Json(DataEnvelope {
        data: EchoData {
            path_value: action,
            body_value,
        },
    }))
}

/// Serve the configured OpenAPI document
pub async fn openapi_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<String, StatusCode> {
    state.openapi.clone().ok_or(StatusCode::NOT_FOUND)
}
