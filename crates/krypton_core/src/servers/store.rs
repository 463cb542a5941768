//! JSON-file record store.
//!
//! Single-row reads and writes through a global lock; the lifecycle
//! controller is the only writer of `state` and `docker_id`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use krypton_datamodel::server::ServerRecord;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Model {
    pub servers: HashMap<String, ServerRecord>,
}

/// Handle to the record database.
///
/// Cheaply cloneable; the lock prevents readers from observing partially
/// written data.
#[derive(Debug, Clone)]
pub struct Handle {
    lock: Arc<Mutex<()>>,
    path: Arc<PathBuf>,
}

impl Handle {
    /// Open the database, creating an empty one if the file is missing.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if !fs::try_exists(&path).await? {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, serde_json::to_string(&Model::default())?).await?;
        }

        Ok(Self {
            lock: Arc::new(Mutex::new(())),
            path: Arc::new(path),
        })
    }

    pub async fn reader(&self) -> Result<Model> {
        let _guard = self.lock.lock().await;
        let contents = fs::read_to_string(self.path.as_path()).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Read-modify-write under the global lock, returning the closure's
    /// result.
    pub async fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Model) -> T,
    {
        let _guard = self.lock.lock().await;

        let contents = fs::read_to_string(self.path.as_path()).await?;
        let mut model: Model = serde_json::from_str(&contents)?;

        let out = f(&mut model);

        fs::write(self.path.as_path(), serde_json::to_string(&model)?).await?;

        Ok(out)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ServerRecord>> {
        Ok(self.reader().await?.servers.get(id).cloned())
    }

    pub async fn list(&self) -> Result<Vec<ServerRecord>> {
        let mut records: Vec<ServerRecord> = self.reader().await?.servers.into_values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    pub async fn upsert(&self, record: ServerRecord) -> Result<()> {
        self.write(move |model| {
            model.servers.insert(record.id.clone(), record);
        })
        .await
    }

    /// Remove a record; `false` if it was already gone.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.write(|model| model.servers.remove(id).is_some()).await
    }
}

#[cfg(test)]
mod tests {
    use krypton_datamodel::server::{Allocation, InstallConfig, ServerState};

    use super::*;

    fn record(id: &str) -> ServerRecord {
        ServerRecord {
            id: id.to_owned(),
            docker_id: None,
            name: format!("{id}-name"),
            image: "game:latest".to_owned(),
            state: ServerState::Installing,
            memory_limit: 1024,
            cpu_limit: 1.0,
            variables: vec![],
            startup_command: "./start".to_owned(),
            install_script: InstallConfig {
                image: "installer:latest".to_owned(),
                entrypoint: "bash".to_owned(),
                script: "echo hi".to_owned(),
            },
            allocation: Allocation {
                bind_address: "0.0.0.0".to_owned(),
                port: 25565,
            },
            config_files: Default::default(),
            cargo: vec![],
            sftp_enabled: false,
        }
    }

    #[tokio::test]
    async fn records_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let handle = Handle::open(path.clone()).await.unwrap();
        handle.upsert(record("s1")).await.unwrap();

        let reopened = Handle::open(path).await.unwrap();
        let loaded = reopened.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "s1-name");
        assert_eq!(loaded.state, ServerState::Installing);
    }

    #[tokio::test]
    async fn remove_reports_whether_the_record_existed() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Handle::open(dir.path().join("db.json")).await.unwrap();

        handle.upsert(record("s1")).await.unwrap();
        assert!(handle.remove("s1").await.unwrap());
        assert!(!handle.remove("s1").await.unwrap());
        assert!(handle.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_sorted_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Handle::open(dir.path().join("db.json")).await.unwrap();

        handle.upsert(record("beta")).await.unwrap();
        handle.upsert(record("alpha")).await.unwrap();

        let ids: Vec<String> = handle
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn write_returns_the_closure_result() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Handle::open(dir.path().join("db.json")).await.unwrap();
        handle.upsert(record("s1")).await.unwrap();

        let state = handle
            .write(|model| {
                let rec = model.servers.get_mut("s1").unwrap();
                rec.state = ServerState::Running;
                rec.state
            })
            .await
            .unwrap();

        assert_eq!(state, ServerState::Running);
        assert_eq!(
            handle.get("s1").await.unwrap().unwrap().state,
            ServerState::Running
        );
    }
}
