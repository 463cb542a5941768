//! JSON frames spoken over the live session socket.
//!
//! Every frame is `{event, data}`; the adjacently-tagged representation
//! keeps the enum variants and the wire shape in lockstep.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::server::ServerState;

/// Close code sent when authentication is missing or rejected.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code sent on unrecoverable daemon-side failures.
pub const CLOSE_INTERNAL: u16 = 1011;
/// Close code sent when the authentication deadline elapses.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Restart => "restart",
            PowerAction::Kill => "kill",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PowerAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "start" => Ok(PowerAction::Start),
            "stop" => Ok(PowerAction::Stop),
            "restart" => Ok(PowerAction::Restart),
            "kill" => Ok(PowerAction::Kill),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PowerActionData {
    pub action: PowerAction,
}

/// Client-to-daemon events.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundFrame {
    SendCommand(String),
    PowerAction(PowerActionData),
    Heartbeat,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub used: u64,
    pub limit: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_rate: f64,
    pub tx_rate: f64,
}

/// Payload of the `stats` event. When the container is not running only
/// `state` is populated.
#[derive(Debug, Clone, Serialize)]
pub struct StatsPayload {
    pub state: ServerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkStats>,
}

impl StatsPayload {
    pub fn offline(state: ServerState) -> Self {
        Self { state, cpu_percent: None, memory: None, network: None }
    }
}

/// Daemon-to-client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundFrame {
    AuthSuccess {
        state: ServerState,
    },
    ConsoleOutput {
        message: String,
    },
    Stats(StatsPayload),
    PowerStatus {
        status: String,
        action: PowerAction,
        state: ServerState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    HeartbeatAck,
    Error {
        message: String,
    },
}

impl OutboundFrame {
    pub fn console(message: impl Into<String>) -> Self {
        OutboundFrame::ConsoleOutput { message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundFrame::Error { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_send_command_parses() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"event":"send_command","data":"say hello"}"#).unwrap();
        match frame {
            InboundFrame::SendCommand(cmd) => assert_eq!(cmd, "say hello"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn inbound_power_action_parses() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"event":"power_action","data":{"action":"kill"}}"#).unwrap();
        match frame {
            InboundFrame::PowerAction(data) => assert_eq!(data.action, PowerAction::Kill),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn inbound_heartbeat_parses_without_data() {
        let frame: InboundFrame = serde_json::from_str(r#"{"event":"heartbeat"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Heartbeat));
    }

    #[test]
    fn outbound_frames_take_the_event_data_shape() {
        let json = serde_json::to_value(OutboundFrame::AuthSuccess {
            state: ServerState::Running,
        })
        .unwrap();
        assert_eq!(json["event"], "auth_success");
        assert_eq!(json["data"]["state"], "running");

        let json = serde_json::to_value(OutboundFrame::HeartbeatAck).unwrap();
        assert_eq!(json["event"], "heartbeat_ack");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn offline_stats_carry_only_state() {
        let json =
            serde_json::to_value(OutboundFrame::Stats(StatsPayload::offline(ServerState::Stopped)))
                .unwrap();
        assert_eq!(json["data"]["state"], "stopped");
        assert!(json["data"].get("cpu_percent").is_none());
        assert!(json["data"].get("memory").is_none());
    }
}
