use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Lifecycle state of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Creating,
    Installing,
    InstallFailed,
    Installed,
    Starting,
    Running,
    Updating,
    UpdateFailed,
    Stopping,
    Stopped,
    Errored,
    Deleting,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Creating => "creating",
            ServerState::Installing => "installing",
            ServerState::InstallFailed => "install_failed",
            ServerState::Installed => "installed",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Updating => "updating",
            ServerState::UpdateFailed => "update_failed",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
            ServerState::Errored => "errored",
            ServerState::Deleting => "deleting",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A panel-defined startup variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub default_value: String,
    #[serde(default)]
    pub current_value: Option<String>,
    #[serde(default)]
    pub rules: String,
}

impl Variable {
    /// Effective value: the panel's current value, falling back to the default.
    pub fn value(&self) -> &str {
        self.current_value.as_deref().unwrap_or(&self.default_value)
    }
}

/// The `(bindAddress, port)` pair bound for both TCP and UDP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub bind_address: String,
    pub port: u16,
}

/// Installer image, entrypoint and script, as issued by the panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    pub image: String,
    pub entrypoint: String,
    pub script: String,
}

/// A config file the panel wants materialized inside the volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CargoProperties {
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub no_delete: bool,
    // opaque panel metadata, preserved but never interpreted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_properties: Option<serde_json::Value>,
}

/// An auxiliary file fetched from a URL into the server volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CargoFile {
    pub url: String,
    pub target_path: String,
    #[serde(default)]
    pub properties: CargoProperties,
}

/// The unit of persistence, one per managed server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    #[serde(default)]
    pub docker_id: Option<String>,
    pub name: String,
    pub image: String,
    pub state: ServerState,
    pub memory_limit: u64,
    pub cpu_limit: f64,
    pub variables: Vec<Variable>,
    pub startup_command: String,
    pub install_script: InstallConfig,
    pub allocation: Allocation,
    #[serde(default)]
    pub config_files: SmallVec<[ConfigFile; 1]>,
    #[serde(default)]
    pub cargo: Vec<CargoFile>,
    #[serde(default)]
    pub sftp_enabled: bool,
}

/// Live container status attached to `GET /servers/:id` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStatus {
    pub state: String,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

/// A record augmented with live status when the container is inspectable.
#[derive(Debug, Clone, Serialize)]
pub struct ServerWithStatus {
    #[serde(flatten)]
    pub record: ServerRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LiveStatus>,
}
