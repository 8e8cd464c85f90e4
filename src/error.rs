use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Task not found: {0}")]
    TaskNotFound(u64),

    #[error("Script file not found: {0}")]
    ScriptNotFound(String),

    #[error("Working directory not found: {0}")]
    WorkdirNotFound(String),

    #[error("Failed to launch task: {0}")]
    LaunchFailed(String),

    #[error("Daemon is not running (socket: {0})")]
    DaemonUnavailable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
