use isolate_common::SafeDisplay;
use tonic::Status;

/// The abstract failure taxonomy for one request's pipeline (see
/// component 5, the task runner). Every variant maps to exactly one RPC
/// status; the mapping is the single place that decides how an internal
/// fault is allowed to look from the outside.
#[derive(Debug, thiserror::Error, Clone)]
pub enum RunError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    BuildFailure(String),

    /// A `tonic::Status` surfaced by the agent stub itself; propagated
    /// with its original code rather than re-classified.
    #[error("{status}")]
    BridgeFailure { status: Status },

    /// The agent reported a structured internal failure (as opposed to
    /// a user function raising inside the sandbox, which is not an
    /// error at all - see `SerializedObject::was_it_raised`).
    #[error("{0}")]
    AgentFailure(String),

    /// Anything else: a bug in the pump, the bridge manager, or this
    /// crate. The caller already received the failing stack trace as
    /// `ERROR` log lines before this status terminates the stream.
    #[error("{0}")]
    ServerBug(String),

    #[error("cancelled")]
    Cancelled,
}

impl SafeDisplay for RunError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

impl From<RunError> for Status {
    fn from(value: RunError) -> Self {
        match value {
            RunError::BadRequest(msg) => Status::invalid_argument(msg),
            RunError::BuildFailure(msg) => Status::invalid_argument(msg),
            RunError::BridgeFailure { status } => status,
            RunError::AgentFailure(msg) => Status::aborted(msg),
            RunError::ServerBug(msg) => Status::unknown(msg),
            RunError::Cancelled => Status::cancelled("task was cancelled"),
        }
    }
}

impl From<Status> for RunError {
    /// An `RpcError` from the agent stub is preserved as-is; see
    /// `RunError::BridgeFailure`.
    fn from(status: Status) -> Self {
        RunError::BridgeFailure { status }
    }
}

#[derive(Debug, thiserror::Error, Clone)]
#[error("{0}")]
pub struct EnvironmentCreationError(pub String);

#[derive(Debug, thiserror::Error, Clone)]
pub enum BridgeError {
    #[error("timed out waiting for the agent to become ready after {0:?}")]
    Timeout(std::time::Duration),
    #[error("failed to establish a bridge to the agent: {0}")]
    Establish(String),
}
