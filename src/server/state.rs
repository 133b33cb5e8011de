//! Shared server state

use crate::reconciler::SharedStatus;

/// State handed to the HTTP handlers
pub struct ServerState {
    /// Live reconciler status
    pub status: SharedStatus,

    /// Service name reported by the health endpoint
    pub service_name: String,

    /// API version reported by the health endpoint
    pub api_version: String,

    /// Raw OpenAPI document, if the configured file could be read
    pub openapi: Option<String>,
}
