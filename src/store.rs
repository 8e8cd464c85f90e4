use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::task::{truncate_to_seconds, SubmitRequest, Task, TaskStatus};

/// Persistent, ordered collection of tasks with monotonically increasing
/// ids.
///
/// All accessors serialize on one internal mutex; queue sizes are small
/// enough that holding it across a save is fine. Persistence is a
/// whole-file rewrite of `tasks.json` under the data directory; a
/// missing or malformed file loads as an empty store so a torn write
/// never prevents startup.
#[derive(Debug)]
pub struct TaskStore {
    inner: Mutex<StoreInner>,
    tasks_file: Option<PathBuf>,
}

#[derive(Debug)]
struct StoreInner {
    tasks: HashMap<u64, Task>,
    next_id: u64,
}

/// On-disk document shape.
#[derive(Serialize, Deserialize)]
struct PersistedStore {
    next_id: u64,
    tasks: Vec<Task>,
}

impl TaskStore {
    /// An in-memory store; `save` and `load` are no-ops.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                tasks: HashMap::new(),
                next_id: 1,
            }),
            tasks_file: None,
        }
    }

    /// A store persisted to `<data_dir>/tasks.json`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                tasks: HashMap::new(),
                next_id: 1,
            }),
            tasks_file: Some(data_dir.join("tasks.json")),
        }
    }

    /// Admit a task: assign the next id, mark Pending, stamp submit_time.
    /// Never rejects; path validation happens at the request boundary.
    pub fn submit(&self, req: SubmitRequest) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let task = Task::new(id, req);
        inner.tasks.insert(id, task);
        id
    }

    /// Submit one task per working directory, sharing the script and
    /// resource counts.
    pub fn submit_batch(
        &self,
        script: &Path,
        workdirs: &[PathBuf],
        ncpu: usize,
        ngpu: usize,
    ) -> Vec<u64> {
        workdirs
            .iter()
            .map(|workdir| {
                self.submit(SubmitRequest {
                    script_path: script.to_path_buf(),
                    workdir: workdir.clone(),
                    ncpu,
                    ngpu,
                    specific_cpus: Vec::new(),
                    specific_gpus: Vec::new(),
                    log_file: String::new(),
                })
            })
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<Task> {
        self.inner.lock().unwrap().tasks.get(&id).cloned()
    }

    /// Pending tasks in dispatch order: submit_time ascending, ties
    /// broken by id.
    pub fn pending(&self) -> Vec<Task> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| (t.submit_time, t.id));
        pending
    }

    pub fn running(&self) -> Vec<Task> {
        let inner = self.inner.lock().unwrap();
        let mut running: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|t| t.id);
        running
    }

    pub fn all(&self) -> Vec<Task> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<Task> = inner.tasks.values().cloned().collect();
        all.sort_by_key(|t| t.id);
        all
    }

    /// Pending → Running. Records the child pid and the allocated sets,
    /// stamps start_time.
    pub fn set_running(&self, id: u64, pid: i32, cpus: &[usize], gpus: &[usize]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.pid = pid;
                task.allocated_cpus = cpus.to_vec();
                task.allocated_gpus = gpus.to_vec();
                task.start_time = Some(truncate_to_seconds(Utc::now()));
                true
            }
            _ => false,
        }
    }

    /// Running → Completed, whatever the exit code; the code itself
    /// carries the job-level failure signal.
    pub fn set_completed(&self, id: u64, exit_code: i32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.status = TaskStatus::Completed;
                task.exit_code = Some(exit_code);
                task.end_time = Some(truncate_to_seconds(Utc::now()));
                true
            }
            _ => false,
        }
    }

    /// Pending/Running → Failed. Reserved for launch failures and
    /// processes that vanished unsupervised.
    pub fn set_failed(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(&id) {
            Some(task)
                if task.status == TaskStatus::Pending || task.status == TaskStatus::Running =>
            {
                task.status = TaskStatus::Failed;
                task.end_time = Some(truncate_to_seconds(Utc::now()));
                true
            }
            _ => false,
        }
    }

    /// Remove a task. A non-terminal record transitions to Cancelled
    /// with end_time set just before removal, so an observer handed the
    /// transition sees a valid terminal record.
    pub fn delete(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return false;
        };
        if !task.is_terminal() {
            task.status = TaskStatus::Cancelled;
            task.end_time = Some(truncate_to_seconds(Utc::now()));
        }
        inner.tasks.remove(&id);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().tasks.is_empty()
    }

    pub fn next_id(&self) -> u64 {
        self.inner.lock().unwrap().next_id
    }

    /// Write the whole store to disk. Best effort: an I/O failure is
    /// logged and the in-memory state stays authoritative.
    pub fn save(&self) {
        let Some(path) = &self.tasks_file else {
            return;
        };
        let inner = self.inner.lock().unwrap();
        let doc = PersistedStore {
            next_id: inner.next_id,
            tasks: {
                let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
                tasks.sort_by_key(|t| t.id);
                tasks
            },
        };
        drop(inner);

        let result = (|| -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let json = serde_json::to_string_pretty(&doc)?;
            std::fs::write(path, json)
        })();

        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist task store");
        }
    }

    /// Restore from disk. Missing file or malformed content yields an
    /// empty store; the daemon must come up either way.
    pub fn load(&self) {
        let Some(path) = &self.tasks_file else {
            return;
        };
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return,
        };
        match serde_json::from_str::<PersistedStore>(&content) {
            Ok(doc) => {
                let mut inner = self.inner.lock().unwrap();
                inner.next_id = doc.next_id;
                inner.tasks = doc.tasks.into_iter().map(|t| (t.id, t)).collect();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Malformed task store, starting empty");
            }
        }
    }
}

/// Parse `"N"` into `{N}` and `"A-B"` into `{A..=B}` for `A <= B`.
/// Anything else (including a reversed range) yields the empty set.
pub fn parse_id_range(s: &str) -> Vec<u64> {
    if let Some((start, end)) = s.split_once('-') {
        let (Ok(start), Ok(end)) = (start.trim().parse::<u64>(), end.trim().parse::<u64>()) else {
            return Vec::new();
        };
        if start <= end {
            (start..=end).collect()
        } else {
            Vec::new()
        }
    } else {
        s.trim().parse::<u64>().map(|id| vec![id]).unwrap_or_default()
    }
}

/// Read a workdirs file: one directory per line, `#` comments and blank
/// lines skipped. Returns the lines that name existing directories and
/// the ones that do not.
pub fn parse_workdirs_file(path: &Path) -> (Vec<PathBuf>, Vec<String>) {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();

    let Ok(content) = std::fs::read_to_string(path) else {
        return (valid, invalid);
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let dir = PathBuf::from(line);
        if dir.is_dir() {
            valid.push(dir);
        } else {
            invalid.push(line.to_string());
        }
    }

    (valid, invalid)
}
