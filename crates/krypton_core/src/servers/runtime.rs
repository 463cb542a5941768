//! Create-container payload for the long-lived runtime container.

use std::collections::HashMap;
use std::path::Path;

use bollard::container::Config;
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use krypton_datamodel::server::ServerRecord;

use crate::template;

pub const SERVER_ID_LABEL: &str = "pterodactyl.server.id";
pub const SERVER_NAME_LABEL: &str = "pterodactyl.server.name";

const CPU_PERIOD: i64 = 100_000;

fn environment(record: &ServerRecord, startup: &str) -> Vec<String> {
    let mut env = vec![
        "TERM=xterm".to_owned(),
        "HOME=/home/container".to_owned(),
        "USER=container".to_owned(),
        format!("STARTUP={startup}"),
    ];

    for var in &record.variables {
        env.push(format!("{}={}", template::env_name(&var.name), var.value()));
    }

    env
}

/// Build the create-container payload for a server's runtime container.
/// `startup` is the already-templated startup command.
pub fn container_config(record: &ServerRecord, startup: &str, volume: &Path) -> Config<String> {
    let port = record.allocation.port;
    let tcp = format!("{port}/tcp");
    let udp = format!("{port}/udp");

    let binding = || {
        Some(vec![PortBinding {
            host_ip: Some(record.allocation.bind_address.clone()),
            host_port: Some(port.to_string()),
        }])
    };

    Config {
        image: Some(record.image.clone()),
        user: Some("container".to_owned()),
        working_dir: Some("/home/container".to_owned()),
        env: Some(environment(record, startup)),
        tty: Some(true),
        open_stdin: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        exposed_ports: Some(HashMap::from([
            (tcp.clone(), HashMap::new()),
            (udp.clone(), HashMap::new()),
        ])),
        labels: Some(HashMap::from([
            (SERVER_ID_LABEL.to_owned(), record.id.clone()),
            (SERVER_NAME_LABEL.to_owned(), record.name.clone()),
        ])),
        host_config: Some(HostConfig {
            mounts: Some(vec![Mount {
                target: Some("/home/container".to_owned()),
                source: Some(volume.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            }]),
            memory: Some(record.memory_limit as i64),
            memory_swap: Some((record.memory_limit * 2) as i64),
            cpu_quota: Some((record.cpu_limit * CPU_PERIOD as f64) as i64),
            cpu_period: Some(CPU_PERIOD),
            network_mode: Some("bridge".to_owned()),
            init: Some(true),
            security_opt: Some(vec!["no-new-privileges".to_owned()]),
            readonly_paths: Some(
                [
                    "/proc/bus",
                    "/proc/fs",
                    "/proc/irq",
                    "/proc/sys",
                    "/proc/sysrq-trigger",
                ]
                .map(str::to_owned)
                .to_vec(),
            ),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            port_bindings: Some(HashMap::from([(tcp, binding()), (udp, binding())])),
            ..Default::default()
        }),
        ..Default::default()
    }
}
