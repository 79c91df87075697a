use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown state '{0}'")]
pub struct UnknownState(pub String);

/// Failures of the shared reply endpoint. Setup failures are fatal; everything
/// the listener drops at runtime is logged, not raised.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("port {0} is already in use by another listener")]
    PortInUse(u16),
    #[error("failed to bind the response listener: {0}")]
    Bind(#[source] std::io::Error),
    #[error("handler already registered with the response listener for app {0}")]
    DuplicateHandler(String),
    #[error("response listener did not answer its readiness probe after {attempts} attempts")]
    Unreachable { attempts: u32 },
}

/// Failures of a single command/response exchange with one application.
/// Transport failures are distinct from application-level errors, which
/// arrive as regular replies with a non-OK result.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("transport failure sending '{command}' to {app}: {reason}")]
    Transport {
        app: String,
        command: String,
        reason: String,
    },
    #[error("no response available from {app} for command '{command}'")]
    NoResponse { app: String, command: String },
    #[error("timeout while waiting for a reply from {app} to '{command}'")]
    ResponseTimeout { app: String, command: String },
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ResponseTimeout { .. })
    }
}
