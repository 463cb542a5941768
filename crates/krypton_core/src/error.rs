use krypton_datamodel::server::ServerState;
use krypton_datamodel::websocket::PowerAction;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("panel unreachable after retries")]
    PanelUnavailable,

    #[error("panel rejected the session token")]
    InvalidToken,

    #[error("variable {name} violates rules '{rules}'")]
    VariableRuleViolation { name: String, rules: String },

    #[error("no cargo entry targets '{0}'")]
    UnknownCargo(String),

    #[error("failed to pull image {image}: {source}")]
    ImagePullFailed {
        image: String,
        source: bollard::errors::Error,
    },

    #[error("container operation failed: {0}")]
    ContainerOpFailed(#[from] bollard::errors::Error),

    #[error("install script failed with exit code {0}")]
    InstallScriptFailed(i64),

    #[error("server {0} not found")]
    RecordNotFound(String),

    #[error("cannot {action} a server that is {state}")]
    InvalidTransition {
        state: ServerState,
        action: PowerAction,
    },

    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("authentication deadline elapsed")]
    AuthTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// True for failures a client can fix by changing the request.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Error::VariableRuleViolation { .. }
                | Error::UnknownCargo(_)
                | Error::InvalidTransition { .. }
                | Error::PayloadTooLarge(_)
        )
    }
}
