use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{QueueError, Result};
use crate::task::Task;

/// Result of a non-blocking process probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub running: bool,
    pub exit_code: i32,
    pub signalled: bool,
    pub signal: i32,
}

impl ProcessStatus {
    fn running() -> Self {
        Self {
            running: true,
            exit_code: 0,
            signalled: false,
            signal: 0,
        }
    }

    /// Gone with no exit information (reaped elsewhere, or inherited
    /// from a previous daemon life).
    fn vanished() -> Self {
        Self {
            running: false,
            exit_code: -1,
            signalled: false,
            signal: 0,
        }
    }

    fn from_exit(status: std::process::ExitStatus) -> Self {
        if let Some(signal) = status.signal() {
            // Shell convention for deaths by signal.
            Self {
                running: false,
                exit_code: 128 + signal,
                signalled: true,
                signal,
            }
        } else {
            Self {
                running: false,
                exit_code: status.code().unwrap_or(-1),
                signalled: false,
                signal: 0,
            }
        }
    }
}

/// Spawns task scripts as supervised children and reaps them.
///
/// Each child runs `/bin/bash <script>` in its own process group, so a
/// termination signal reaches the whole descendant tree. Children of a
/// previous daemon life are not in the table; their liveness is judged
/// by `/proc/<pid>`.
#[derive(Debug)]
pub struct Executor {
    log_dir: PathBuf,
    enable_job_log: bool,
    children: Mutex<HashMap<i32, Child>>,
    /// Exit statuses of children we already reaped, so a probe racing a
    /// wait still sees the real exit instead of "vanished".
    reaped: Mutex<HashMap<i32, ProcessStatus>>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

impl Executor {
    /// `log_dir` empty disables the server-wide per-task logs;
    /// `enable_job_log` turns on the `workdir/job.log` default for tasks
    /// that name no log file.
    pub fn new(log_dir: PathBuf, enable_job_log: bool) -> Self {
        Self {
            log_dir,
            enable_job_log,
            children: Mutex::new(HashMap::new()),
            reaped: Mutex::new(HashMap::new()),
        }
    }

    /// Launch a task with the given resource sets. Returns the child
    /// pid; the child is already in its own process group when this
    /// returns.
    pub async fn spawn(&self, task: &Task, cpus: &[usize], gpus: &[usize]) -> Result<i32> {
        if !task.script_path.is_file() {
            return Err(QueueError::ScriptNotFound(
                task.script_path.display().to_string(),
            ));
        }
        if !task.workdir.is_dir() {
            return Err(QueueError::WorkdirNotFound(
                task.workdir.display().to_string(),
            ));
        }

        let cpu_list = join_ids(cpus);
        let gpu_list = join_ids(gpus);

        let mut command = Command::new("/bin/bash");
        command
            .arg(&task.script_path)
            .current_dir(&task.workdir)
            .env("CUDA_VISIBLE_DEVICES", &gpu_list)
            .env("MYQUEUE_GPUS", &gpu_list)
            .env("MYQUEUE_CPUS", &cpu_list)
            .process_group(0)
            .stdin(Stdio::null());

        match self.open_log(task, &cpu_list, &gpu_list, cpus.len(), gpus.len())? {
            Some(log) => {
                let err = log
                    .try_clone()
                    .map_err(|e| QueueError::LaunchFailed(e.to_string()))?;
                command.stdout(Stdio::from(log)).stderr(Stdio::from(err));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = command
            .spawn()
            .map_err(|e| QueueError::LaunchFailed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| QueueError::LaunchFailed("child exited before spawn returned".into()))?
            as i32;

        // A recycled pid must not inherit a stale exit record.
        self.reaped.lock().await.remove(&pid);
        self.children.lock().await.insert(pid, child);

        tracing::info!(
            task_id = task.id,
            pid,
            script = %task.script_path.display(),
            cpus = %cpu_list,
            gpus = %gpu_list,
            "Task started"
        );
        Ok(pid)
    }

    /// Non-blocking wait-and-report. The exit of a child we reaped is
    /// remembered, so repeated probes keep reporting it; a pid that was
    /// never ours is judged alive-or-vanished only.
    pub async fn probe(&self, pid: i32) -> ProcessStatus {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&pid) {
            let status = match child.try_wait() {
                Ok(Some(status)) => ProcessStatus::from_exit(status),
                Ok(None) => return ProcessStatus::running(),
                Err(_) => ProcessStatus::vanished(),
            };
            children.remove(&pid);
            drop(children);
            self.reaped.lock().await.insert(pid, status);
            return status;
        }
        drop(children);

        if let Some(status) = self.reaped.lock().await.get(&pid) {
            return *status;
        }

        if process_alive(pid) {
            ProcessStatus::running()
        } else {
            ProcessStatus::vanished()
        }
    }

    /// Signal the process group (`SIGTERM`, or `SIGKILL` when `force`),
    /// falling back to the single process if the group signal fails.
    pub async fn signal(&self, pid: i32, force: bool) -> bool {
        let sig = if force { "-KILL" } else { "-TERM" };

        let group = Command::new("kill")
            .args([sig, "--", &format!("-{pid}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if matches!(group, Ok(status) if status.success()) {
            return true;
        }

        let single = Command::new("kill")
            .args([sig, &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(single, Ok(status) if status.success())
    }

    /// Wait for termination: negative `timeout_ms` blocks indefinitely,
    /// zero is a single poll, otherwise polls until the deadline.
    /// Returns the exit code, or `None` if the process outlived the
    /// timeout.
    pub async fn await_exit(&self, pid: i32, timeout_ms: i64) -> Option<i32> {
        if timeout_ms == 0 {
            let status = self.probe(pid).await;
            return (!status.running).then_some(status.exit_code);
        }

        let deadline = (timeout_ms > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_millis(timeout_ms as u64));

        loop {
            let status = self.probe(pid).await;
            if !status.running {
                return Some(status.exit_code);
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Resolve the log destination for a task and write the job header.
    /// Precedence: the task's own log file, then `workdir/job.log` when
    /// job logging is on, then the server log directory, then null.
    fn open_log(
        &self,
        task: &Task,
        cpu_list: &str,
        gpu_list: &str,
        ncpu: usize,
        ngpu: usize,
    ) -> Result<Option<File>> {
        let path = if !task.log_file.is_empty() {
            task.workdir.join(&task.log_file)
        } else if self.enable_job_log {
            task.workdir.join("job.log")
        } else if !self.log_dir.as_os_str().is_empty() {
            std::fs::create_dir_all(&self.log_dir)?;
            self.log_dir.join(format!("task_{}.log", task.id))
        } else {
            return Ok(None);
        };

        let mut file = File::create(&path)?;
        let rule = "=".repeat(80);
        writeln!(file, "{rule}")?;
        writeln!(file, "Task:    {}", task.id)?;
        writeln!(file, "Script:  {}", task.script_path.display())?;
        writeln!(file, "Workdir: {}", task.workdir.display())?;
        writeln!(file, "CPUs:    {cpu_list} ({ncpu} cores)")?;
        writeln!(file, "GPUs:    {gpu_list} ({ngpu} devices)")?;
        writeln!(file, "Started: {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"))?;
        writeln!(file, "{rule}")?;
        Ok(Some(file))
    }
}

/// Liveness for pids that are not our children: the kernel keeps
/// `/proc/<pid>` around for as long as the process exists.
fn process_alive(pid: i32) -> bool {
    pid > 0 && Path::new(&format!("/proc/{pid}")).exists()
}

/// Comma-separated ascending id list; empty string for no resources.
pub fn join_ids(ids: &[usize]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
