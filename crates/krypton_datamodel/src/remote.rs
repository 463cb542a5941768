//! Types for the panel's two upstream endpoints.

use serde::Deserialize;
use smallvec::SmallVec;

use crate::server::{Allocation, CargoFile, ConfigFile, InstallConfig, Variable};

/// Snapshot of a server's configuration as the panel sees it.
///
/// Authoritative for template inputs on create and on unit-changed updates;
/// otherwise the last-persisted record wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    pub docker_image: String,
    pub startup_command: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
    pub install: InstallConfig,
    #[serde(default)]
    pub config_files: SmallVec<[ConfigFile; 1]>,
    #[serde(default)]
    pub cargo: Vec<CargoFile>,
    #[serde(default)]
    pub allocation: Option<Allocation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub id: i64,
    pub name: String,
    pub fqdn: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedServer {
    pub id: String,
    pub name: String,
    pub internal_id: i64,
    pub node: NodeSummary,
}

/// Response of `GET {appUrl}/api/servers/{id}/validate/{token}`.
#[derive(Debug, Deserialize)]
pub struct ValidateResponse {
    pub validated: bool,
    #[serde(default)]
    pub server: Option<ValidatedServer>,
}
