use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{QueueError, Result};
use crate::task::{SubmitRequest, Task, TaskStatus};

/// Frames larger than this are treated as protocol failures and the
/// connection is dropped.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Client → daemon messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Request {
    Submit(SubmitRequest),
    Query { include_terminal: bool },
    Delete { task_ids: Vec<u64> },
    DeleteAll,
    Info { task_id: u64 },
    Log { task_id: u64, tail_lines: usize },
    Shutdown,
}

/// Daemon → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Response {
    Submitted { task_id: u64 },
    Queue(QueueView),
    Deleted { results: Vec<DeleteResult> },
    DeletedAll(DeleteAllSummary),
    TaskDetail(TaskDetail),
    TaskLog(TaskLog),
    ShuttingDown,
    Error { message: String },
}

/// One queue row as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: u64,
    pub status: TaskStatus,
    pub script: String,
    pub workdir: String,
    pub cpus: Vec<usize>,
    pub gpus: Vec<usize>,
    pub exit_code: Option<i32>,
    pub duration_seconds: i64,
}

impl TaskView {
    pub fn from_task(task: &Task) -> Self {
        // Pending rows show the requested sets; everything else shows
        // what was actually allocated.
        let (cpus, gpus) = if task.status == TaskStatus::Pending {
            (task.specific_cpus.clone(), task.specific_gpus.clone())
        } else {
            (task.allocated_cpus.clone(), task.allocated_gpus.clone())
        };
        Self {
            id: task.id,
            status: task.status,
            script: task.script_path.display().to_string(),
            workdir: task.workdir.display().to_string(),
            cpus,
            gpus,
            exit_code: task.exit_code,
            duration_seconds: task.duration_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueView {
    pub running: Vec<TaskView>,
    pub pending: Vec<TaskView>,
    /// Populated only when terminal tasks were requested.
    #[serde(default)]
    pub terminal: Vec<TaskView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub id: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAllSummary {
    pub total: usize,
    pub running_terminated: usize,
    pub pending_deleted: usize,
    pub terminal_deleted: usize,
}

/// The full task record with wire-formatted timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    pub id: u64,
    pub status: TaskStatus,
    pub script: String,
    pub workdir: String,
    pub ncpu: usize,
    pub ngpu: usize,
    pub specific_cpus: Vec<usize>,
    pub specific_gpus: Vec<usize>,
    pub allocated_cpus: Vec<usize>,
    pub allocated_gpus: Vec<usize>,
    pub log_file: String,
    pub pid: i32,
    pub exit_code: Option<i32>,
    pub submit_time: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration_seconds: i64,
}

const DETAIL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl TaskDetail {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id,
            status: task.status,
            script: task.script_path.display().to_string(),
            workdir: task.workdir.display().to_string(),
            ncpu: task.ncpu,
            ngpu: task.ngpu,
            specific_cpus: task.specific_cpus.clone(),
            specific_gpus: task.specific_gpus.clone(),
            allocated_cpus: task.allocated_cpus.clone(),
            allocated_gpus: task.allocated_gpus.clone(),
            log_file: task.log_file.clone(),
            pid: task.pid,
            exit_code: task.exit_code,
            submit_time: task.submit_time.format(DETAIL_FORMAT).to_string(),
            start_time: task.start_time.map(|t| t.format(DETAIL_FORMAT).to_string()),
            end_time: task.end_time.map(|t| t.format(DETAIL_FORMAT).to_string()),
            duration_seconds: task.duration_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_id: u64,
    pub log_path: String,
    pub content: String,
}

/// Write one frame: a 4-byte big-endian length followed by the JSON
/// body.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(QueueError::Protocol("frame too large".into()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. An oversized length or undecodable body is a
/// protocol error; the caller drops the connection.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(QueueError::Protocol(format!("bad frame length {len}")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
