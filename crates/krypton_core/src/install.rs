//! One-shot installation container orchestration.
//!
//! Stages `.installation/` inside the volume, pulls both images, runs the
//! generated wrapper script to completion and adjudicates the exit code.
//! The workspace is removed on success; on failure the buffered output is
//! dumped to `installation.log` at the volume root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bollard::container::Config;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use futures::StreamExt;
use krypton_datamodel::server::{InstallConfig, Variable};
use krypton_datamodel::websocket::OutboundFrame;
use tokio::fs;

use crate::console::Console;
use crate::docker::Gateway;
use crate::error::{Error, Result};
use crate::servers::volume;
use crate::template;

const WORKSPACE_DIR: &str = ".installation";
const SCRIPT_NAME: &str = "install.sh";
const FAILURE_DUMP: &str = "installation.log";

/// `'` becomes `'\''`, the bash idiom for a literal quote inside a
/// single-quoted string.
fn escape_single_quotes(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Synthesize the wrapper script around the panel-issued install script.
/// Variable values are single-quoted so hostile values cannot break out.
pub fn generate_script(variables: &[Variable], user_script: &str) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    script.push_str("set -e\n");
    script.push_str("exec 1> >(tee -a /mnt/server/.installation/logs/install.log)\n");
    script.push_str("exec 2>&1\n");
    script.push_str(
        "trap 'echo \"Error on line $LINENO\" >> /mnt/server/.installation/logs/install.log' ERR\n",
    );

    for var in variables {
        script.push_str(&format!(
            "export {}='{}'\n",
            template::env_name(&var.name),
            escape_single_quotes(var.value())
        ));
    }

    script.push('\n');
    // panel scripts may arrive with CRLF endings, which break bash
    script.push_str(&user_script.replace("\r\n", "\n").replace('\r', "\n"));
    script.push_str("\nexit $?\n");

    script
}

struct Workspace {
    root: PathBuf,
    script: PathBuf,
}

impl Workspace {
    async fn stage(volume: &Path, variables: &[Variable], user_script: &str) -> Result<Workspace> {
        let root = volume.join(WORKSPACE_DIR);

        // a leftover workspace means a previous attempt died mid-install
        if fs::try_exists(&root).await? {
            tracing::warn!("stale installation workspace at {}, recreating", root.display());
            fs::remove_dir_all(&root).await?;
        }

        for sub in ["logs", "temp", "config"] {
            fs::create_dir_all(root.join(sub)).await?;
        }

        let script = root.join(SCRIPT_NAME);
        fs::write(&script, generate_script(variables, user_script)).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).await?;
        }

        Ok(Workspace { root, script })
    }
}

fn container_env(variables: &[Variable]) -> Vec<String> {
    let mut env = vec!["DEBIAN_FRONTEND=nointeractive".to_owned()];
    for var in variables {
        env.push(format!("{}={}", template::env_name(&var.name), var.value()));
    }
    env
}

fn container_config(
    install: &InstallConfig,
    volume: &Path,
    variables: &[Variable],
    memory_limit: u64,
) -> Config<String> {
    let entrypoint = if install.entrypoint.is_empty() {
        "bash".to_owned()
    } else {
        install.entrypoint.clone()
    };

    Config {
        image: Some(install.image.clone()),
        cmd: Some(vec![
            entrypoint,
            format!("/mnt/server/{WORKSPACE_DIR}/{SCRIPT_NAME}"),
        ]),
        env: Some(container_env(variables)),
        working_dir: Some("/mnt/server".to_owned()),
        tty: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        labels: Some(HashMap::from([(
            "krypton.install".to_owned(),
            "true".to_owned(),
        )])),
        host_config: Some(HostConfig {
            mounts: Some(vec![Mount {
                target: Some("/mnt/server".to_owned()),
                source: Some(volume.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            }]),
            memory: Some(memory_limit as i64),
            memory_swap: Some((memory_limit * 2) as i64),
            network_mode: Some("host".to_owned()),
            privileged: Some(true),
            auto_remove: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Run the full installation for one server. Blocks until the installer
/// container exits; errors leave the failure dump behind.
pub async fn run(
    gateway: &Gateway,
    console: Arc<Console>,
    server_id: &str,
    volume: &Path,
    install: &InstallConfig,
    runtime_image: &str,
    variables: &[Variable],
    memory_limit: u64,
) -> Result<()> {
    tracing::info!("starting installation for server {server_id}");

    let workspace = Workspace::stage(volume, variables, &install.script).await?;
    tracing::debug!("staged install script at {}", workspace.script.display());

    // both images are needed before anything runs; failing either is fatal
    gateway.pull(&install.image).await?;
    gateway.pull(runtime_image).await?;

    let container_name = format!("{}_installer", volume::sanitize(server_id));
    gateway.force_remove(&container_name, true).await?;

    let config = container_config(install, volume, variables, memory_limit);
    let container_id = gateway.create_container(&container_name, config).await?;

    // attach before start so no early output is lost
    let attach = gateway.attach(&container_id).await?;
    gateway.start(&container_id).await?;

    let pump = tokio::spawn(pump_output(
        attach.output,
        console_sink(Arc::clone(&console), server_id.to_owned()),
    ));

    let exit = gateway.wait(&container_id).await?;
    let buffered = pump.await.unwrap_or_default();

    if exit.code == 0 {
        tracing::info!("installation for {server_id} completed");
        fs::remove_dir_all(&workspace.root).await?;
        return Ok(());
    }

    tracing::error!("installation for {server_id} failed with exit code {}", exit.code);
    if let Some(engine_error) = exit.error {
        tracing::error!("engine reported: {engine_error}");
    }

    let mut dump = format!("# install failure dump, {}\n", chrono::Local::now().to_rfc3339());
    dump.push_str(&buffered.join("\n"));
    dump.push_str(&format!("\nInstallation failed with exit code {}\n", exit.code));
    fs::write(volume.join(FAILURE_DUMP), dump).await?;

    Err(Error::InstallScriptFailed(exit.code))
}

fn console_sink(console: Arc<Console>, server_id: String) -> impl FnMut(&str) {
    move |line: &str| {
        console.push(&server_id, line);
        console.broadcast(&server_id, &OutboundFrame::console(line));
    }
}

/// Drain installer output, forwarding complete lines to the live console
/// and buffering everything for the on-failure dump.
async fn pump_output<S>(mut output: S, mut sink: impl FnMut(&str)) -> Vec<String>
where
    S: futures::Stream<Item = std::result::Result<bollard::container::LogOutput, bollard::errors::Error>>
        + Unpin,
{
    let mut buffered = Vec::new();
    let mut partial = String::new();

    while let Some(chunk) = output.next().await {
        let bytes = match chunk {
            Ok(log) => log.into_bytes(),
            Err(e) => {
                tracing::warn!("installer output stream failed: {e}");
                break;
            }
        };

        partial.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = partial.find('\n') {
            let line: String = partial.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']).to_owned();
            sink(&line);
            buffered.push(line);
        }
    }

    if !partial.is_empty() {
        sink(&partial);
        buffered.push(partial);
    }

    buffered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, value: &str) -> Variable {
        Variable {
            name: name.to_owned(),
            default_value: value.to_owned(),
            current_value: None,
            rules: String::new(),
        }
    }

    #[test]
    fn script_carries_the_wrapper_preamble() {
        let script = generate_script(&[], "echo hi");
        assert!(script.starts_with("#!/bin/bash\nset -e\n"));
        assert!(script.contains("exec 1> >(tee -a /mnt/server/.installation/logs/install.log)"));
        assert!(script.contains("exec 2>&1"));
        assert!(script.contains("trap 'echo \"Error on line $LINENO\""));
        assert!(script.contains("echo hi"));
        assert!(script.ends_with("exit $?\n"));
    }

    #[test]
    fn variable_exports_are_single_quoted() {
        let script = generate_script(&[var("NAME", "it's a value")], "true");
        assert!(script.contains("export NAME='it'\\''s a value'"));
    }

    #[test]
    fn variable_exports_use_shell_safe_names() {
        let script = generate_script(&[var("Server Memory", "1024")], "true");
        assert!(script.contains("export Server_Memory='1024'"));
    }

    #[test]
    fn user_script_line_endings_are_normalized() {
        let script = generate_script(&[], "line one\r\nline two\r");
        assert!(script.contains("line one\nline two\n"));
        assert!(!script.contains('\r'));
    }

    #[test]
    fn installer_env_includes_noninteractive_frontend_and_raw_values() {
        let env = container_env(&[var("A B", "1")]);
        assert_eq!(env[0], "DEBIAN_FRONTEND=nointeractive");
        assert!(env.contains(&"A_B=1".to_owned()));
    }

    #[test]
    fn installer_container_is_privileged_host_networked_and_auto_removed() {
        let install = InstallConfig {
            image: "installer:latest".to_owned(),
            entrypoint: String::new(),
            script: "echo hi".to_owned(),
        };
        let config = container_config(&install, Path::new("/vol/s1"), &[], 1024);
        let host = config.host_config.unwrap();

        assert_eq!(host.network_mode.as_deref(), Some("host"));
        assert_eq!(host.privileged, Some(true));
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.memory, Some(1024));
        assert_eq!(host.memory_swap, Some(2048));
        assert_eq!(
            config.cmd.unwrap(),
            vec!["bash", "/mnt/server/.installation/install.sh"]
        );
        assert_eq!(config.working_dir.as_deref(), Some("/mnt/server"));
        assert_eq!(config.tty, Some(true));
    }

    #[tokio::test]
    async fn staging_creates_the_workspace_layout() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::stage(dir.path(), &[], "echo hi").await.unwrap();

        for sub in ["logs", "temp", "config"] {
            assert!(ws.root.join(sub).is_dir());
        }
        let script = std::fs::read_to_string(&ws.script).unwrap();
        assert!(script.contains("echo hi"));
    }

    #[tokio::test]
    async fn staging_replaces_a_stale_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(WORKSPACE_DIR).join("logs");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(dir.path().join(WORKSPACE_DIR).join("leftover"), "x").unwrap();

        let ws = Workspace::stage(dir.path(), &[], "true").await.unwrap();
        assert!(!ws.root.join("leftover").exists());
    }

    #[tokio::test]
    async fn pump_reassembles_lines_across_chunks() {
        use bollard::container::LogOutput;

        let chunks: Vec<std::result::Result<LogOutput, bollard::errors::Error>> = vec![
            Ok(LogOutput::Console { message: "hel".into() }),
            Ok(LogOutput::Console { message: "lo\nwor".into() }),
            Ok(LogOutput::Console { message: "ld\n".into() }),
        ];

        let mut seen = Vec::new();
        let buffered = pump_output(futures::stream::iter(chunks), |line: &str| {
            seen.push(line.to_owned());
        })
        .await;

        assert_eq!(buffered, vec!["hello", "world"]);
        assert_eq!(seen, buffered);
    }
}
