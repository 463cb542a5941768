//! Server lifecycle controller.
//!
//! Sole writer of `state` and `docker_id`. Update, reinstall, delete and
//! power actions are serialized per server through a per-id async mutex.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use krypton_datamodel::server::{
    CargoFile, LiveStatus, ServerRecord, ServerState, ServerWithStatus,
};
use krypton_datamodel::webserver::{CreateServerRequest, UpdateServerRequest};
use krypton_datamodel::websocket::{OutboundFrame, PowerAction};
use tokio::fs;

use crate::config::KryptonConfig;
use crate::console::{format_line, Console, LogType};
use crate::docker::Gateway;
use crate::error::{Error, Result};
use crate::panel::PanelClient;
use crate::{cargo, install, template};

pub mod runtime;
pub mod store;
pub mod volume;

const STOP_GRACE: Duration = Duration::from_secs(30);
const UPDATE_STOP_GRACE: Duration = Duration::from_secs(10);

/// Reject power actions that make no sense in the current state.
fn check_transition(state: ServerState, action: PowerAction) -> Result<()> {
    use ServerState::*;

    let illegal = match action {
        PowerAction::Start => matches!(state, Running | Starting),
        PowerAction::Stop | PowerAction::Kill => {
            matches!(state, Stopped | Installing | InstallFailed | Installed)
        }
        PowerAction::Restart => matches!(state, Starting | Stopping),
    };

    if illegal {
        Err(Error::InvalidTransition { state, action })
    } else {
        Ok(())
    }
}

pub struct Servers {
    gateway: Gateway,
    panel: Arc<PanelClient>,
    console: Arc<Console>,
    store: store::Handle,
    volumes_dir: PathBuf,
    http: reqwest::Client,
    ops: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Servers {
    pub async fn new(
        config: &KryptonConfig,
        gateway: Gateway,
        panel: Arc<PanelClient>,
        console: Arc<Console>,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(&config.volumes_dir).await?;
        let store = store::Handle::open(config.database.clone()).await?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("krypton/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build cargo client: {e}")))?;

        Ok(Arc::new(Self {
            gateway,
            panel,
            console,
            store,
            volumes_dir: config.volumes_dir.clone(),
            http,
            ops: parking_lot::Mutex::new(HashMap::new()),
        }))
    }

    pub fn store(&self) -> &store::Handle {
        &self.store
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    fn op_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.ops.lock().entry(id.to_owned()).or_default())
    }

    async fn must_get(&self, id: &str) -> Result<ServerRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::RecordNotFound(id.to_owned()))
    }

    fn daemon_broadcast(&self, id: &str, message: &str) {
        let line = format_line(LogType::Daemon, message);
        self.console.push(id, &line);
        self.console.broadcast(id, &OutboundFrame::console(&line));
    }

    /// Persist a new record in `installing` state and kick off the
    /// asynchronous provisioning chain. Returns before any work happens so
    /// the HTTP layer can answer immediately.
    pub async fn create(self: &Arc<Self>, req: CreateServerRequest) -> Result<ServerRecord> {
        if self.store.get(&req.server_id).await?.is_some() {
            return Err(Error::Internal(format!(
                "server {} already exists",
                req.server_id
            )));
        }

        let record = ServerRecord {
            id: req.server_id,
            docker_id: None,
            name: req.name,
            image: String::new(),
            state: ServerState::Installing,
            memory_limit: req.memory_limit,
            cpu_limit: req.cpu_limit,
            variables: vec![],
            startup_command: String::new(),
            install_script: krypton_datamodel::server::InstallConfig {
                image: String::new(),
                entrypoint: String::new(),
                script: String::new(),
            },
            allocation: req.allocation,
            config_files: Default::default(),
            cargo: vec![],
            sftp_enabled: false,
        };

        self.store.upsert(record.clone()).await?;

        let this = Arc::clone(self);
        let id = record.id.clone();
        tokio::spawn(async move {
            this.provision(&id).await;
        });

        Ok(record)
    }

    /// Create-time provisioning: config fetch, install, runtime bring-up.
    /// Failures demote the record; it is never deleted here.
    async fn provision(&self, id: &str) {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        if let Err(e) = self.install_phase(id, true).await {
            tracing::error!("installation of {id} failed: {e}");
            self.demote(id, ServerState::InstallFailed).await;
            self.daemon_broadcast(id, &format!("Installation failed: {e}"));
            return;
        }

        if let Err(e) = self.startup_phase(id).await {
            tracing::error!("first start of {id} failed: {e}");
            self.demote(id, ServerState::Errored).await;
            self.daemon_broadcast(id, &format!("Server failed to start: {e}"));
            return;
        }

        self.daemon_broadcast(id, "Server installed and started");
    }

    /// Fetch config (when panel-authoritative), materialize the volume and
    /// run the installer to completion.
    async fn install_phase(&self, id: &str, fetch_config: bool) -> Result<()> {
        let mut record = self.must_get(id).await?;

        if fetch_config {
            let config = self.panel.fetch_config(id).await?;
            record.image = config.docker_image;
            record.startup_command = config.startup_command;
            record.variables = config.variables;
            record.install_script = config.install;
            record.config_files = config.config_files;
            record.cargo = config.cargo;
            if let Some(allocation) = config.allocation {
                record.allocation = allocation;
            }
            self.store.upsert(record.clone()).await?;
        }

        // fail template violations before any container work
        template::validate_all(&record.variables)?;

        let vol = volume::path(&self.volumes_dir, id);
        fs::create_dir_all(&vol).await?;

        for file in &record.config_files {
            let content = template::render(&file.content, &record.variables, &record.cargo)?;
            let target = vol.join(cargo::safe_relative_path(&file.path));
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, content).await?;
        }

        cargo::ship(&self.http, &vol, &record.cargo).await?;

        install::run(
            &self.gateway,
            Arc::clone(&self.console),
            id,
            &vol,
            &record.install_script,
            &record.image,
            &record.variables,
            record.memory_limit,
        )
        .await
    }

    /// Create and start the runtime container, then mark the record running.
    async fn startup_phase(&self, id: &str) -> Result<()> {
        let record = self.must_get(id).await?;
        let container_id = self.create_runtime(&record).await?;
        self.gateway.start(&container_id).await?;

        self.store
            .write(|model| {
                if let Some(rec) = model.servers.get_mut(id) {
                    rec.docker_id = Some(container_id.clone());
                    rec.state = ServerState::Running;
                }
            })
            .await?;

        Ok(())
    }

    async fn create_runtime(&self, record: &ServerRecord) -> Result<String> {
        let vol = volume::path(&self.volumes_dir, &record.id);
        let startup = template::render(&record.startup_command, &record.variables, &record.cargo)?;

        let name = volume::sanitize(&record.id);
        // a stale same-named container would make create fail
        self.gateway.force_remove(&name, false).await?;

        let config = runtime::container_config(record, &startup, &vol);
        self.gateway.create_container(&name, config).await
    }

    async fn demote(&self, id: &str, state: ServerState) {
        let result = self
            .store
            .write(|model| {
                if let Some(rec) = model.servers.get_mut(id) {
                    rec.state = state;
                    if matches!(state, ServerState::InstallFailed | ServerState::UpdateFailed) {
                        rec.docker_id = None;
                    }
                }
            })
            .await;

        if let Err(e) = result {
            tracing::error!("failed to persist {state} for {id}: {e}");
        }
    }

    pub async fn list(&self) -> Result<Vec<ServerRecord>> {
        self.store.list().await
    }

    /// A record, augmented with live container status when inspectable.
    pub async fn get(&self, id: &str) -> Result<ServerWithStatus> {
        let record = self.must_get(id).await?;

        let status = match &record.docker_id {
            Some(docker_id) => match self.gateway.inspect(docker_id).await {
                Ok(Some(status)) => Some(LiveStatus {
                    state: status.state,
                    running: status.running,
                    started_at: status.started_at,
                }),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("failed to inspect container of {id}: {e}");
                    None
                }
            },
            None => None,
        };

        Ok(ServerWithStatus { record, status })
    }

    /// Resource or unit update. The old container is removed before the new
    /// one exists; a failure in between demotes to `update_failed` without
    /// restoring it.
    pub async fn update(&self, id: &str, req: UpdateServerRequest) -> Result<ServerRecord> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let record = self.must_get(id).await?;

        if !matches!(record.state, ServerState::Running | ServerState::Stopped) {
            return Err(Error::Internal(format!(
                "cannot update server {id} while {}",
                record.state
            )));
        }

        self.store
            .write(|model| {
                if let Some(rec) = model.servers.get_mut(id) {
                    rec.state = ServerState::Updating;
                }
            })
            .await?;

        match self.apply_update(id, record, req).await {
            Ok(updated) => Ok(updated),
            Err(e) => {
                self.demote(id, ServerState::UpdateFailed).await;
                self.daemon_broadcast(id, &format!("Update failed: {e}"));
                Err(e)
            }
        }
    }

    async fn apply_update(
        &self,
        id: &str,
        mut record: ServerRecord,
        req: UpdateServerRequest,
    ) -> Result<ServerRecord> {
        let previous_image = record.image.clone();

        if req.unit_changed {
            // a unit swap makes the panel authoritative again
            let config = self.panel.fetch_config(id).await?;
            record.image = config.docker_image;
            record.startup_command = config.startup_command;
            record.variables = config.variables;
            record.install_script = config.install;
            record.cargo = config.cargo;
            // config files are not re-materialized on update
            record.config_files = Default::default();
        }

        if let Some(image) = req.docker_image {
            record.image = image;
        }
        if let Some(name) = req.name {
            record.name = name;
        }
        if let Some(memory_limit) = req.memory_limit {
            record.memory_limit = memory_limit;
        }
        if let Some(cpu_limit) = req.cpu_limit {
            record.cpu_limit = cpu_limit;
        }

        // pull the new unit image before the old container is touched, so a
        // pull failure aborts with everything still intact
        if req.unit_changed && record.image != previous_image {
            self.gateway.pull(&record.image).await?;
        }

        if let Some(docker_id) = record.docker_id.clone() {
            if let Some(status) = self.gateway.inspect(&docker_id).await? {
                if status.running {
                    self.gateway.stop(&docker_id, UPDATE_STOP_GRACE).await?;
                }
            }
            // volumes are preserved; only the container goes
            self.gateway.force_remove(&docker_id, false).await?;
        }

        let container_id = self.create_runtime(&record).await?;
        self.gateway.start(&container_id).await?;

        record.docker_id = Some(container_id);
        record.state = ServerState::Running;
        self.store.upsert(record.clone()).await?;

        Ok(record)
    }

    /// Wipe the container and rerun the installer from the stored record.
    /// The runtime container comes back on the next power action.
    pub async fn reinstall(self: &Arc<Self>, id: &str) -> Result<()> {
        // existence check before answering the HTTP request
        self.must_get(id).await?;

        let this = Arc::clone(self);
        let id = id.to_owned();
        tokio::spawn(async move {
            let lock = this.op_lock(&id);
            let _guard = lock.lock().await;

            let prepared = this
                .store
                .write(|model| {
                    if let Some(rec) = model.servers.get_mut(&id) {
                        let docker_id = rec.docker_id.take();
                        rec.state = ServerState::Installing;
                        Some(docker_id)
                    } else {
                        None
                    }
                })
                .await;

            let docker_id = match prepared {
                Ok(Some(docker_id)) => docker_id,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!("failed to mark {id} for reinstall: {e}");
                    return;
                }
            };

            if let Some(docker_id) = docker_id {
                if let Err(e) = this.gateway.force_remove(&docker_id, false).await {
                    tracing::warn!("failed to remove container of {id} before reinstall: {e}");
                }
            }

            match this.install_phase(&id, false).await {
                Ok(()) => {
                    this.demote(&id, ServerState::Installed).await;
                    this.daemon_broadcast(&id, "Reinstall completed");
                }
                Err(e) => {
                    tracing::error!("reinstall of {id} failed: {e}");
                    this.demote(&id, ServerState::InstallFailed).await;
                    this.daemon_broadcast(&id, &format!("Reinstall failed: {e}"));
                }
            }
        });

        Ok(())
    }

    /// Remove container, volume and record, in that order. Every step
    /// tolerates "already gone" so a second attempt is safe.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let record = self.must_get(id).await?;

        self.store
            .write(|model| {
                if let Some(rec) = model.servers.get_mut(id) {
                    rec.state = ServerState::Deleting;
                }
            })
            .await?;

        let container = record
            .docker_id
            .unwrap_or_else(|| volume::sanitize(id));
        if let Err(e) = self.gateway.force_remove(&container, true).await {
            // deletion is idempotent by intent; container failures are
            // logged and swallowed
            tracing::warn!("failed to remove container of {id}: {e}");
        }

        let vol = volume::path(&self.volumes_dir, id);
        match fs::remove_dir_all(&vol).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.store.remove(id).await?;
        self.console.forget(id);

        Ok(())
    }

    /// Fetch cargo files into the volume and forward their metadata to the
    /// persisted record. `hidden`, `noDelete` and `customProperties` are
    /// stored, not enforced.
    pub async fn ship_cargo(&self, id: &str, cargo: Vec<CargoFile>) -> Result<()> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        self.must_get(id).await?;

        let vol = volume::path(&self.volumes_dir, id);
        fs::create_dir_all(&vol).await?;
        cargo::ship(&self.http, &vol, &cargo).await?;

        self.store
            .write(|model| {
                if let Some(rec) = model.servers.get_mut(id) {
                    for entry in cargo {
                        match rec
                            .cargo
                            .iter_mut()
                            .find(|c| c.target_path == entry.target_path)
                        {
                            Some(existing) => *existing = entry,
                            None => rec.cargo.push(entry),
                        }
                    }
                }
            })
            .await?;

        Ok(())
    }

    /// Gate, execute and persist one power action, returning the new state.
    pub async fn power(&self, id: &str, action: PowerAction) -> Result<ServerState> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let record = self.must_get(id).await?;
        check_transition(record.state, action)?;

        self.console.clear(id);

        let new_state = match action {
            PowerAction::Start => {
                let container_id = match record.docker_id.clone() {
                    Some(existing) => existing,
                    // after a reinstall the runtime container does not exist
                    None => self.create_runtime(&record).await?,
                };

                self.store
                    .write(|model| {
                        if let Some(rec) = model.servers.get_mut(id) {
                            rec.state = ServerState::Starting;
                            rec.docker_id = Some(container_id.clone());
                        }
                    })
                    .await?;

                self.gateway.start(&container_id).await?;
                ServerState::Running
            }

            PowerAction::Stop => {
                let docker_id = record
                    .docker_id
                    .ok_or_else(|| Error::Internal(format!("server {id} has no container")))?;

                self.store
                    .write(|model| {
                        if let Some(rec) = model.servers.get_mut(id) {
                            rec.state = ServerState::Stopping;
                        }
                    })
                    .await?;

                self.gateway.stop(&docker_id, STOP_GRACE).await?;
                ServerState::Stopped
            }

            PowerAction::Restart => {
                let docker_id = record
                    .docker_id
                    .ok_or_else(|| Error::Internal(format!("server {id} has no container")))?;
                self.gateway.restart(&docker_id, STOP_GRACE).await?;
                ServerState::Running
            }

            PowerAction::Kill => {
                let docker_id = record
                    .docker_id
                    .ok_or_else(|| Error::Internal(format!("server {id} has no container")))?;
                self.gateway.kill(&docker_id).await?;
                ServerState::Stopped
            }
        };

        self.store
            .write(|model| {
                if let Some(rec) = model.servers.get_mut(id) {
                    rec.state = new_state;
                }
            })
            .await?;

        Ok(new_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_illegal_while_running() {
        let err = check_transition(ServerState::Running, PowerAction::Start).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(check_transition(ServerState::Starting, PowerAction::Start).is_err());
    }

    #[test]
    fn stop_and_kill_are_illegal_while_stopped() {
        for action in [PowerAction::Stop, PowerAction::Kill] {
            assert!(check_transition(ServerState::Stopped, action).is_err());
            assert!(check_transition(ServerState::Installing, action).is_err());
            assert!(check_transition(ServerState::Running, action).is_ok());
        }
    }

    #[test]
    fn restart_is_illegal_mid_transition() {
        assert!(check_transition(ServerState::Starting, PowerAction::Restart).is_err());
        assert!(check_transition(ServerState::Stopping, PowerAction::Restart).is_err());
        assert!(check_transition(ServerState::Running, PowerAction::Restart).is_ok());
        assert!(check_transition(ServerState::Stopped, PowerAction::Restart).is_ok());
    }

    #[test]
    fn start_is_legal_after_install_or_failure() {
        for state in [
            ServerState::Installed,
            ServerState::Stopped,
            ServerState::Errored,
        ] {
            assert!(check_transition(state, PowerAction::Start).is_ok());
        }
    }
}
