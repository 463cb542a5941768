//! Bodies for the `/api/v1/` HTTP surface.

use serde::{Deserialize, Serialize};

use crate::server::{Allocation, CargoFile, ServerRecord, ServerState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServerRequest {
    pub server_id: String,
    pub validation_token: String,
    pub name: String,
    pub memory_limit: u64,
    pub cpu_limit: f64,
    pub allocation: Allocation,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServerResponse {
    pub id: String,
    pub name: String,
    pub state: ServerState,
    pub validation_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServerRequest {
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub unit_changed: bool,
    #[serde(default)]
    pub docker_image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpdateServerResponse {
    pub message: String,
    pub server: ServerRecord,
}

#[derive(Debug, Deserialize)]
pub struct CargoShipRequest {
    pub cargo: Vec<CargoFile>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl ToString) -> Self {
        Self { error: error.to_string() }
    }
}
