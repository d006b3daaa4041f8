//! Error type shared by every supervisor operation.

use std::time::Duration;

/// Failures reported by [`crate::InstanceSupervisor`].
///
/// None of these are retried internally. A failed `run()` always leaves the
/// supervisor in the not-running state.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("a hosted instance is already running")]
    AlreadyRunning,

    #[error("no hosted instance is running")]
    NotRunning,

    #[error("unsupported plugin location \"{0}\": only local file locations can be hosted")]
    UnsupportedLocation(String),

    #[error("port {0} is outside the range 1-65535")]
    InvalidPort(u32),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("failed to start hosted instance: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("hosted instance did not report readiness within {}ms", .0.as_millis())]
    StartupTimeout(Duration),

    #[error("hosted instance was terminated before it was started")]
    TerminatedBeforeSpawn,

    #[error("hosted instance exited before it was ready ({0})")]
    ExitedBeforeReady(String),

    #[error("hosted instance reported an unparseable address \"{address}\": {reason}")]
    InvalidEndpoint { address: String, reason: url::ParseError },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
