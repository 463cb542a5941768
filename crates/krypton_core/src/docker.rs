//! Thin typed capability surface over the Docker Engine.
//!
//! The gateway never decodes the multiplexed log framing; that is the
//! session multiplexer's job (`websocket::stream`).

use std::time::Duration;

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogsOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::stream::{Stream, StreamExt};

use crate::error::{Error, Result};

/// Upper bound on a single image pull, layers included.
const PULL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub fn is_404(err: &bollard::errors::Error) -> bool {
    use bollard::errors::Error::DockerResponseServerError;
    matches!(err, DockerResponseServerError { status_code: 404, .. })
}

/// Snapshot of a container's state, from inspect.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub state: String,
    pub running: bool,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
}

/// Result of waiting for a container to exit.
#[derive(Debug, Clone)]
pub struct ExitStatus {
    pub code: i64,
    pub error: Option<String>,
}

/// One resource sample, reduced from the engine's stats payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub cpu_total: u64,
    pub cpu_system: u64,
    pub precpu_total: u64,
    pub precpu_system: u64,
    pub online_cpus: u32,
    pub memory_used: u64,
    pub memory_limit: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// CPU usage percentage for one sample, clamped to 100.
pub fn cpu_percent(sample: &ResourceSample) -> f64 {
    let delta_total = sample.cpu_total.saturating_sub(sample.precpu_total) as f64;
    let delta_system = sample.cpu_system.saturating_sub(sample.precpu_system) as f64;

    if delta_system <= 0.0 {
        return 0.0;
    }

    (delta_total / delta_system * f64::from(sample.online_cpus) * 100.0).min(100.0)
}

impl From<Stats> for ResourceSample {
    fn from(stats: Stats) -> Self {
        let (rx_bytes, tx_bytes) = stats
            .networks
            .iter()
            .flatten()
            .fold((0, 0), |(rx, tx), (_, net)| {
                (rx + net.rx_bytes, tx + net.tx_bytes)
            });

        ResourceSample {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            cpu_system: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            precpu_system: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1) as u32,
            memory_used: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            rx_bytes,
            tx_bytes,
        }
    }
}

/// Handle to the container engine.
#[derive(Clone)]
pub struct Gateway {
    api: Docker,
}

impl Gateway {
    pub fn connect() -> Result<Self> {
        let api = Docker::connect_with_defaults()?;
        Ok(Self { api })
    }

    /// Pull an image, consuming the engine's progress stream to completion;
    /// returning earlier would not guarantee the image is present.
    pub async fn pull(&self, image: &str) -> Result<()> {
        tracing::info!("pulling image {image}");

        let opts = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let pull = async {
            let mut stream = self.api.create_image(Some(opts), None, None);

            while let Some(progress) = stream.next().await {
                match progress {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            tracing::debug!("pull {image}: {status}");
                        }
                    }
                    Err(source) => {
                        return Err(Error::ImagePullFailed {
                            image: image.to_owned(),
                            source,
                        });
                    }
                }
            }

            Ok(())
        };

        match tokio::time::timeout(PULL_TIMEOUT, pull).await {
            Ok(result) => result,
            Err(_) => Err(Error::Internal(format!("pull of {image} timed out"))),
        }
    }

    pub async fn create_container(&self, name: &str, config: Config<String>) -> Result<String> {
        let opts = CreateContainerOptions {
            name: name.to_owned(),
            platform: None,
        };

        let response = self.api.create_container(Some(opts), config).await?;

        for warning in &response.warnings {
            tracing::warn!("engine warning while creating {name}: {warning}");
        }

        Ok(response.id)
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.api
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    pub async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let opts = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.api.stop_container(id, Some(opts)).await?;
        Ok(())
    }

    pub async fn kill(&self, id: &str) -> Result<()> {
        self.api
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    pub async fn restart(&self, id: &str, grace: Duration) -> Result<()> {
        let opts = RestartContainerOptions {
            t: grace.as_secs() as isize,
        };
        self.api.restart_container(id, Some(opts)).await?;
        Ok(())
    }

    /// Force-remove a container. `remove_volumes` also deletes anonymous
    /// volumes. A container that is already gone is not an error.
    pub async fn force_remove(&self, id: &str, remove_volumes: bool) -> Result<()> {
        let opts = RemoveContainerOptions {
            force: true,
            v: remove_volumes,
            link: false,
        };

        match self.api.remove_container(id, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(e) if is_404(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Inspect a container; `None` if it does not exist.
    pub async fn inspect(&self, id: &str) -> Result<Option<ContainerStatus>> {
        let response = match self.api.inspect_container(id, None).await {
            Ok(r) => r,
            Err(e) if is_404(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state = response.state.unwrap_or_default();

        Ok(Some(ContainerStatus {
            state: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_owned()),
            running: state.running.unwrap_or(false),
            started_at: state.started_at,
            finished_at: state.finished_at,
            error: state.error.filter(|e| !e.is_empty()),
            exit_code: state.exit_code,
            oom_killed: state.oom_killed.unwrap_or(false),
        }))
    }

    /// Block until the container exits.
    pub async fn wait(&self, id: &str) -> Result<ExitStatus> {
        let mut stream = self
            .api
            .wait_container(id, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(ExitStatus {
                code: response.status_code,
                error: response.error.and_then(|e| e.message),
            }),
            // the engine reports non-zero exits of auto-remove containers as
            // a response error carrying the status code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Ok(ExitStatus { code, error: None })
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::Internal(format!(
                "wait stream for {id} ended without a result"
            ))),
        }
    }

    /// Attach to a container's standard streams.
    pub async fn attach(&self, id: &str) -> Result<AttachContainerResults> {
        let opts = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };

        Ok(self.api.attach_container(id, Some(opts)).await?)
    }

    /// Stdin-only attach used for command forwarding. No signal proxying,
    /// no output streams.
    pub async fn attach_stdin(&self, id: &str) -> Result<AttachContainerResults> {
        let opts = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(false),
            stderr: Some(false),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };

        Ok(self.api.attach_container(id, Some(opts)).await?)
    }

    /// Follow a container's output from now on. Chunks are raw bytes; the
    /// caller decodes the engine's stream framing.
    pub fn follow_logs(
        &self,
        id: &str,
    ) -> impl Stream<Item = std::result::Result<Vec<u8>, bollard::errors::Error>> {
        let opts = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "0".to_owned(),
            ..Default::default()
        };

        self.api
            .logs(id, Some(opts))
            .map(|item| item.map(|output| output.into_bytes().to_vec()))
    }

    /// One-shot resource snapshot.
    pub async fn stats_once(&self, id: &str) -> Result<ResourceSample> {
        let opts = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.api.stats(id, Some(opts));

        match stream.next().await {
            Some(Ok(stats)) => Ok(stats.into()),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::Internal(format!("stats stream for {id} was empty"))),
        }
    }

    /// Run a command inside a running container and collect its output.
    pub async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<String> {
        let opts = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.api.create_exec(id, opts).await?;
        let started = self.api.start_exec(&exec.id, None).await?;

        match started {
            StartExecResults::Attached { mut output, .. } => {
                let mut collected = String::new();
                while let Some(chunk) = output.next().await {
                    let chunk = chunk?;
                    collected.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
                }
                Ok(collected)
            }
            StartExecResults::Detached => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total: u64, system: u64, pre_total: u64, pre_system: u64, cpus: u32) -> ResourceSample {
        ResourceSample {
            cpu_total: total,
            cpu_system: system,
            precpu_total: pre_total,
            precpu_system: pre_system,
            online_cpus: cpus,
            ..Default::default()
        }
    }

    #[test]
    fn cpu_percent_scales_with_online_cpus() {
        // 10% of the system delta, 4 cores: 40%
        let s = sample(100, 1000, 0, 0, 4);
        assert!((cpu_percent(&s) - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_percent_clamps_at_one_hundred() {
        let s = sample(5000, 1000, 0, 0, 8);
        assert!((cpu_percent(&s) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_percent_handles_missing_system_delta() {
        let s = sample(100, 500, 50, 500, 2);
        assert_eq!(cpu_percent(&s), 0.0);
    }
}
