use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV_VAR: &str = "KRYPTON_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KryptonApi {
    pub host: IpAddr,
    pub port: u16,
    /// Static key expected in the `X-API-Key` header on `/servers*`.
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KryptonRemote {
    /// Base URL of the panel, e.g. `https://panel.example.com`.
    pub app_url: String,
    /// Bearer token presented to the panel.
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KryptonConfig {
    #[serde(default)]
    pub debug: bool,
    pub api: KryptonApi,
    pub remote: KryptonRemote,
    pub volumes_dir: PathBuf,
    /// Path of the JSON record database.
    pub database: PathBuf,
    /// `None` disables the per-IP session bound.
    #[serde(default)]
    pub max_connections_per_ip: Option<u32>,
}

impl KryptonConfig {
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        tracing::info!("Loading Krypton config from {}", path.display());

        let config = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Could not read Krypton config from {}: {}", path.display(), e))?;

        let config: KryptonConfig = serde_json::from_str(&config)?;
        tracing::debug!("Loaded Krypton config: {:?}", config);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let config = serde_json::to_string_pretty(self)?;

        std::fs::write(path, config)
            .map_err(|e| anyhow!("Could not write Krypton config to {}: {}", path.display(), e))?;

        tracing::info!("Saved Krypton config to {}", path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = KryptonConfig {
            debug: true,
            api: KryptonApi {
                host: "0.0.0.0".parse().unwrap(),
                port: 8080,
                key: "secret".to_owned(),
            },
            remote: KryptonRemote {
                app_url: "http://panel.local".to_owned(),
                api_key: "bearer".to_owned(),
            },
            volumes_dir: dir.path().join("volumes"),
            database: dir.path().join("servers.json"),
            max_connections_per_ip: None,
        };

        config.save(&path).unwrap();
        let loaded = KryptonConfig::load(&path).unwrap();

        assert_eq!(loaded.api.port, 8080);
        assert_eq!(loaded.remote.app_url, "http://panel.local");
        assert!(loaded.max_connections_per_ip.is_none());
    }
}
