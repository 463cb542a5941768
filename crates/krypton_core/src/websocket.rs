//! Live session multiplexer.
//!
//! One session per authenticated client socket. Each session runs three
//! concurrent activities — inbound reader, log attacher, stats sampler —
//! with disjoint state, all cancelled together when the socket closes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Sink, SinkExt, StreamExt};
use krypton_datamodel::server::ServerState;
use krypton_datamodel::websocket::{
    InboundFrame, MemoryStats, NetworkStats, OutboundFrame, PowerAction, StatsPayload,
    CLOSE_INTERNAL, CLOSE_POLICY_VIOLATION, CLOSE_TRY_AGAIN_LATER,
};
use parking_lot::Mutex;
use poem::web::websocket::{Message, WebSocketStream};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::console::{format_line, LogType};
use crate::docker::{cpu_percent, Gateway, ResourceSample};
use crate::websocket::auth::ValidationCache;
use crate::websocket::stream::LogParser;
use crate::AppState;

pub mod auth;
pub mod stream;

const AUTH_DEADLINE: Duration = Duration::from_secs(5);
const PAYLOAD_LIMIT: usize = 50 * 1024;
const STATS_INTERVAL: Duration = Duration::from_secs(2);
const REATTACH_DELAY: Duration = Duration::from_secs(5);
const STDIN_FLUSH_DELAY: Duration = Duration::from_millis(100);
const RING_TAIL: usize = 10;
const BURST_WINDOW: Duration = Duration::from_millis(100);
const BURST_LIMIT: u32 = 10;

/// Query parameters of the upgrade URL. Missing values default to empty
/// strings so the socket still upgrades and closes with `1008`.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub token: String,
}

/// Strip any character outside `[A-Za-z0-9_-]` from a client-supplied
/// server id.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect()
}

/// Printable ASCII only, quote characters stripped, trimmed. `None` means
/// the command reduced to nothing and is a no-op.
pub fn sanitize_command(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| matches!(c, ' '..='~') && !matches!(c, '"' | '\''))
        .collect();

    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn rebrand(line: &str) -> String {
    line.replace("pterodactyl", "argon")
}

/// Per-IP connection accounting. A `None` limit disables the bound.
pub struct IpGuard {
    limit: Option<u32>,
    counts: Mutex<HashMap<IpAddr, u32>>,
}

impl IpGuard {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, ip: Option<IpAddr>) -> bool {
        let Some(ip) = ip else { return true };
        let mut counts = self.counts.lock();
        let count = counts.entry(ip).or_insert(0);

        if let Some(limit) = self.limit {
            if *count >= limit {
                return false;
            }
        }

        *count += 1;
        true
    }

    pub fn release(&self, ip: Option<IpAddr>) {
        let Some(ip) = ip else { return };
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&ip);
            }
        }
    }
}

/// Drops lines past [`BURST_LIMIT`] arrivals inside one window.
struct BurstGuard {
    window_start: Instant,
    count: u32,
}

impl BurstGuard {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    fn admit_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= BURST_WINDOW {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= BURST_LIMIT
    }
}

async fn close<S>(sink: &mut S, code: u16)
where
    S: Sink<Message> + Unpin,
{
    let _ = sink
        .send(Message::Close(Some((code.into(), String::new()))))
        .await;
}

/// Serialize and send one frame, enforcing the outbound payload cap.
/// Returns `false` when the socket is gone.
async fn send_frame<S>(sink: &mut S, frame: &OutboundFrame) -> bool
where
    S: Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("failed to serialize outbound frame: {e}");
            return true;
        }
    };

    if text.len() > PAYLOAD_LIMIT {
        tracing::warn!("dropping oversized outbound frame ({} bytes)", text.len());
        let error = OutboundFrame::error("an oversized frame was dropped");
        return match serde_json::to_string(&error) {
            Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
            Err(_) => true,
        };
    }

    sink.send(Message::Text(text)).await.is_ok()
}

/// Entry point for an upgraded socket.
pub async fn run_session(
    state: Arc<AppState>,
    socket: WebSocketStream,
    params: ConnectParams,
    peer: Option<IpAddr>,
) {
    if !state.ip_guard.try_acquire(peer) {
        let (mut sink, _stream) = socket.split();
        close(&mut sink, CLOSE_POLICY_VIOLATION).await;
        return;
    }

    drive_session(&state, socket, params).await;
    state.ip_guard.release(peer);
}

async fn drive_session(state: &Arc<AppState>, socket: WebSocketStream, params: ConnectParams) {
    let (mut sink, mut inbound) = socket.split();
    let server_id = sanitize_id(&params.server);

    match tokio::time::timeout(AUTH_DEADLINE, authenticate(state, &server_id, &params.token)).await
    {
        Err(_) => {
            close(&mut sink, CLOSE_TRY_AGAIN_LATER).await;
            return;
        }
        Ok(false) => {
            close(&mut sink, CLOSE_POLICY_VIOLATION).await;
            return;
        }
        Ok(true) => {}
    }

    let record = match state.servers.store().get(&server_id).await {
        Ok(Some(record)) => record,
        _ => {
            close(&mut sink, CLOSE_INTERNAL).await;
            return;
        }
    };

    if record.docker_id.is_none() {
        close(&mut sink, CLOSE_INTERNAL).await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let session_id = state.console.register(&server_id, tx.clone());
    let cancel = CancellationToken::new();
    let rearm = Arc::new(Notify::new());

    for line in state.console.tail(&server_id, RING_TAIL) {
        send_frame(&mut sink, &OutboundFrame::console(line)).await;
    }
    let initial = sample_stats(state, &server_id, &mut None).await;
    send_frame(&mut sink, &OutboundFrame::Stats(initial)).await;
    send_frame(&mut sink, &OutboundFrame::AuthSuccess { state: record.state }).await;

    let attacher = tokio::spawn(log_attacher(
        Arc::clone(state),
        server_id.clone(),
        tx.clone(),
        cancel.child_token(),
        Arc::clone(&rearm),
    ));
    let sampler = tokio::spawn(stats_sampler(
        Arc::clone(state),
        server_id.clone(),
        tx.clone(),
        cancel.child_token(),
    ));

    let mut last_heartbeat = Instant::now();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if !send_frame(&mut sink, &frame).await {
                            break;
                        }
                    }
                    // all senders gone means the server was deleted
                    None => break,
                }
            }

            message = inbound.next() => {
                let Some(Ok(message)) = message else { break };
                last_heartbeat = Instant::now();

                match message {
                    Message::Text(text) => {
                        if text.len() > PAYLOAD_LIMIT {
                            let _ = tx.send(OutboundFrame::error(
                                "message exceeds the 50 KiB payload limit",
                            ));
                            continue;
                        }

                        match serde_json::from_str::<InboundFrame>(&text) {
                            Ok(frame) => handle_frame(state, &server_id, frame, &tx, &rearm).await,
                            Err(_) => {
                                let _ = tx.send(OutboundFrame::error("malformed frame"));
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    cancel.cancel();
    let _ = tokio::join!(attacher, sampler);
    state.console.unregister(&server_id, session_id);
    tracing::debug!(
        "session {session_id} for {server_id} closed, last heartbeat {:?} ago",
        last_heartbeat.elapsed()
    );
}

/// Cache-first token validation. Only positive panel verdicts are cached.
async fn authenticate(state: &AppState, server_id: &str, token: &str) -> bool {
    let key = ValidationCache::key(server_id, token);

    if let Some(verdict) = state.validation.get(&key) {
        return verdict;
    }

    let verdict = state.panel.validate(server_id, token).await;
    if verdict {
        state.validation.insert(key, true);
    }
    verdict
}

async fn handle_frame(
    state: &Arc<AppState>,
    server_id: &str,
    frame: InboundFrame,
    tx: &mpsc::UnboundedSender<OutboundFrame>,
    rearm: &Notify,
) {
    match frame {
        InboundFrame::Heartbeat => {
            let _ = tx.send(OutboundFrame::HeartbeatAck);
        }

        InboundFrame::SendCommand(raw) => {
            let Some(command) = sanitize_command(&raw) else {
                return;
            };

            let docker_id = match state.servers.store().get(server_id).await {
                Ok(Some(record)) => record.docker_id,
                _ => None,
            };
            let Some(docker_id) = docker_id else {
                let _ = tx.send(OutboundFrame::error("server has no running container"));
                return;
            };

            if let Err(e) = forward_command(state.servers.gateway(), &docker_id, &command).await {
                let _ = tx.send(OutboundFrame::error(format!("failed to forward command: {e}")));
            }
        }

        InboundFrame::PowerAction(data) => {
            let action = data.action;

            match state.servers.power(server_id, action).await {
                Ok(new_state) => {
                    let line = format_line(
                        LogType::Daemon,
                        &format!("Power action '{action}' completed, server is now {new_state}"),
                    );
                    state.console.push(server_id, &line);
                    state.console.broadcast(server_id, &OutboundFrame::console(&line));
                    state.console.broadcast(
                        server_id,
                        &OutboundFrame::PowerStatus {
                            status: "success".to_owned(),
                            action,
                            state: new_state,
                            error: None,
                        },
                    );

                    // a new container instance has a new log stream
                    if matches!(action, PowerAction::Start | PowerAction::Restart) {
                        rearm.notify_waiters();
                    }
                }
                Err(e) => {
                    let current = match state.servers.store().get(server_id).await {
                        Ok(Some(record)) => record.state,
                        _ => ServerState::Errored,
                    };
                    let _ = tx.send(OutboundFrame::PowerStatus {
                        status: "error".to_owned(),
                        action,
                        state: current,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
    }
}

/// Write one command to the container's stdin through a stdin-only attach,
/// closing the writer shortly after to flush.
async fn forward_command(gateway: &Gateway, docker_id: &str, command: &str) -> crate::error::Result<()> {
    let mut attach = gateway.attach_stdin(docker_id).await?;

    attach
        .input
        .write_all(format!("{command}\n").as_bytes())
        .await?;
    attach.input.flush().await?;

    tokio::time::sleep(STDIN_FLUSH_DELAY).await;
    attach.input.shutdown().await?;

    Ok(())
}

/// Tail the container's log stream for the lifetime of the session,
/// re-attaching after errors and power-driven container swaps.
async fn log_attacher(
    state: Arc<AppState>,
    server_id: String,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
    rearm: Arc<Notify>,
) {
    loop {
        if cancel.is_cancelled() || tx.is_closed() {
            return;
        }

        let docker_id = match state.servers.store().get(&server_id).await {
            Ok(Some(record)) => record.docker_id,
            _ => return,
        };

        if let Some(docker_id) = docker_id {
            follow_container(&state, &server_id, &docker_id, &tx, &cancel).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(REATTACH_DELAY) => {}
            _ = rearm.notified() => {}
        }
    }
}

async fn follow_container(
    state: &AppState,
    server_id: &str,
    docker_id: &str,
    tx: &mpsc::UnboundedSender<OutboundFrame>,
    cancel: &CancellationToken,
) {
    let stream = state.servers.gateway().follow_logs(docker_id);
    futures::pin_mut!(stream);

    let mut parser = LogParser::new();
    let mut burst = BurstGuard::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        for line in parser.push(&bytes) {
                            process_line(state, server_id, &line, tx, &mut burst);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("log stream for {server_id} failed: {e}");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

fn process_line(
    state: &AppState,
    server_id: &str,
    line: &str,
    tx: &mpsc::UnboundedSender<OutboundFrame>,
    burst: &mut BurstGuard,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let line = rebrand(line);

    if line.len() > PAYLOAD_LIMIT {
        let _ = tx.send(OutboundFrame::error("a console line exceeded the payload limit"));
        return;
    }

    if !burst.admit() {
        return;
    }

    state.console.push(server_id, &line);
    let _ = tx.send(OutboundFrame::console(line));
}

/// Sample container statistics every two seconds until cancelled.
async fn stats_sampler(
    state: Arc<AppState>,
    server_id: String,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    let mut prev: Option<(ResourceSample, Instant)> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let payload = sample_stats(&state, &server_id, &mut prev).await;
        if tx.send(OutboundFrame::Stats(payload)).is_err() {
            return;
        }
    }
}

async fn sample_stats(
    state: &AppState,
    server_id: &str,
    prev: &mut Option<(ResourceSample, Instant)>,
) -> StatsPayload {
    let record = match state.servers.store().get(server_id).await {
        Ok(Some(record)) => record,
        _ => return StatsPayload::offline(ServerState::Errored),
    };

    let Some(docker_id) = record.docker_id.clone() else {
        return StatsPayload::offline(record.state);
    };

    let running = matches!(
        state.servers.gateway().inspect(&docker_id).await,
        Ok(Some(ref status)) if status.running
    );
    if !running {
        *prev = None;
        return StatsPayload::offline(record.state);
    }

    match state.servers.gateway().stats_once(&docker_id).await {
        Ok(sample) => build_stats(record.state, sample, prev, Instant::now()),
        Err(e) => {
            tracing::debug!("stats sampling for {server_id} failed: {e}");
            StatsPayload::offline(record.state)
        }
    }
}

fn build_stats(
    state: ServerState,
    sample: ResourceSample,
    prev: &mut Option<(ResourceSample, Instant)>,
    now: Instant,
) -> StatsPayload {
    let memory_percent = if sample.memory_limit > 0 {
        sample.memory_used as f64 / sample.memory_limit as f64 * 100.0
    } else {
        0.0
    };

    let (rx_rate, tx_rate) = match prev {
        Some((last, at)) => {
            let elapsed = now.duration_since(*at).as_secs_f64();
            if elapsed > 0.0 {
                (
                    sample.rx_bytes.saturating_sub(last.rx_bytes) as f64 / elapsed,
                    sample.tx_bytes.saturating_sub(last.tx_bytes) as f64 / elapsed,
                )
            } else {
                (0.0, 0.0)
            }
        }
        None => (0.0, 0.0),
    };

    let payload = StatsPayload {
        state,
        cpu_percent: Some(cpu_percent(&sample)),
        memory: Some(MemoryStats {
            used: sample.memory_used,
            limit: sample.memory_limit,
            percent: memory_percent,
        }),
        network: Some(NetworkStats {
            rx_bytes: sample.rx_bytes,
            tx_bytes: sample.tx_bytes,
            rx_rate,
            tx_rate,
        }),
    };

    *prev = Some((sample, now));
    payload
}
