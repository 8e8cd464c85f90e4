use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{QueueError, Result};
use crate::executor::Executor;
use crate::ipc::protocol::{
    DeleteAllSummary, DeleteResult, QueueView, Request, Response, TaskDetail, TaskLog, TaskView,
};
use crate::ipc::server;
use crate::resources::ResourceLedger;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::task::TaskStatus;

/// The daemon: wires the store, ledger, executor and scheduler together
/// and answers requests on the local socket.
pub struct Daemon {
    config: Config,
    store: Arc<TaskStore>,
    ledger: Arc<ResourceLedger>,
    scheduler: Arc<Scheduler>,
    token: CancellationToken,
}

impl Daemon {
    pub fn new(config: Config) -> Arc<Self> {
        let store = Arc::new(TaskStore::new(&config.data_dir));
        let ledger = Arc::new(ResourceLedger::new(&config));
        let log_dir = if config.enable_logging {
            config.log_dir.clone()
        } else {
            PathBuf::new()
        };
        let executor = Arc::new(Executor::new(log_dir, config.enable_job_log));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            ledger.clone(),
            executor,
            config.scheduling_interval_ms,
            config.process_check_interval_ms,
        ));

        scheduler.set_callback(Box::new(|task_id, old, new| {
            tracing::info!(task_id, from = %old, to = %new, "Task state changed");
        }));

        Arc::new(Self {
            config,
            store,
            ledger,
            scheduler,
            token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Bring everything up and block until shutdown: load and recover
    /// the store, start the scheduler loops, then serve the socket.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        std::fs::create_dir_all(&self.config.data_dir)?;

        self.scheduler.start().await;

        let listener = self.bind_socket().await?;
        tracing::info!(socket = %self.config.socket_path.display(), "Daemon listening");

        let handler_daemon = self.clone();
        let handler = move |request| {
            let daemon = handler_daemon.clone();
            async move { daemon.handle(request).await }
        };
        server::serve(listener, handler, self.token.clone()).await;

        self.scheduler.stop().await;
        self.store.save();
        let _ = std::fs::remove_file(&self.config.socket_path);
        tracing::info!("Daemon stopped");
        Ok(())
    }

    /// Bind the daemon socket. A leftover socket file from a crashed
    /// daemon is unlinked, but only after checking nobody answers on it.
    async fn bind_socket(&self) -> Result<UnixListener> {
        let path = &self.config.socket_path;
        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(QueueError::Protocol(format!(
                    "another daemon is already listening on {}",
                    path.display()
                )));
            }
            std::fs::remove_file(path)?;
        }
        Ok(UnixListener::bind(path)?)
    }

    /// Dispatch one request. Every arm returns a defined response; only
    /// the boundary (frame decoding) can fail.
    pub async fn handle(self: &Arc<Self>, request: Request) -> Response {
        match request {
            Request::Submit(req) => self.handle_submit(req),
            Request::Query { include_terminal } => self.handle_query(include_terminal),
            Request::Delete { task_ids } => self.handle_delete(&task_ids).await,
            Request::DeleteAll => self.handle_delete_all().await,
            Request::Info { task_id } => self.handle_info(task_id),
            Request::Log {
                task_id,
                tail_lines,
            } => self.handle_log(task_id, tail_lines).await,
            Request::Shutdown => self.handle_shutdown(),
        }
    }

    fn handle_submit(&self, req: crate::task::SubmitRequest) -> Response {
        if !req.script_path.is_file() {
            return Response::Error {
                message: format!("Script file not found: {}", req.script_path.display()),
            };
        }
        if !req.workdir.is_dir() {
            return Response::Error {
                message: format!("Working directory not found: {}", req.workdir.display()),
            };
        }

        let task_id = self.store.submit(req);
        self.store.save();
        tracing::info!(task_id, "Task submitted");
        Response::Submitted { task_id }
    }

    fn handle_query(&self, include_terminal: bool) -> Response {
        let running = self.store.running().iter().map(TaskView::from_task).collect();
        let pending = self.store.pending().iter().map(TaskView::from_task).collect();
        let terminal = if include_terminal {
            self.store
                .all()
                .iter()
                .filter(|t| t.is_terminal())
                .map(TaskView::from_task)
                .collect()
        } else {
            Vec::new()
        };
        Response::Queue(QueueView {
            running,
            pending,
            terminal,
        })
    }

    async fn handle_delete(&self, task_ids: &[u64]) -> Response {
        let mut results = Vec::with_capacity(task_ids.len());
        for &id in task_ids {
            let success = match self.store.get(id) {
                None => false,
                Some(task) if task.is_running() => self.scheduler.terminate(id, false).await,
                Some(_) => self.store.delete(id),
            };
            results.push(DeleteResult { id, success });
        }
        self.store.save();
        Response::Deleted { results }
    }

    async fn handle_delete_all(&self) -> Response {
        let mut summary = DeleteAllSummary::default();
        for task in self.store.all() {
            let deleted = match task.status {
                TaskStatus::Running => {
                    let terminated = self.scheduler.terminate(task.id, false).await;
                    if terminated {
                        summary.running_terminated += 1;
                    }
                    terminated
                }
                TaskStatus::Pending => {
                    let deleted = self.store.delete(task.id);
                    if deleted {
                        summary.pending_deleted += 1;
                    }
                    deleted
                }
                _ => {
                    let deleted = self.store.delete(task.id);
                    if deleted {
                        summary.terminal_deleted += 1;
                    }
                    deleted
                }
            };
            if deleted {
                summary.total += 1;
            }
        }
        self.store.save();
        tracing::info!(deleted = summary.total, "Deleted all tasks");
        Response::DeletedAll(summary)
    }

    fn handle_info(&self, task_id: u64) -> Response {
        match self.store.get(task_id) {
            Some(task) => Response::TaskDetail(TaskDetail::from_task(&task)),
            None => Response::Error {
                message: format!("Task not found: {task_id}"),
            },
        }
    }

    async fn handle_log(&self, task_id: u64, tail_lines: usize) -> Response {
        let Some(task) = self.store.get(task_id) else {
            return Response::Error {
                message: format!("Task not found: {task_id}"),
            };
        };

        let path = if !task.log_file.is_empty() {
            task.workdir.join(&task.log_file)
        } else if self.config.enable_job_log {
            task.workdir.join("job.log")
        } else if self.config.enable_logging && !self.config.log_dir.as_os_str().is_empty() {
            self.config.log_dir.join(format!("task_{task_id}.log"))
        } else {
            return Response::Error {
                message: "No log file configured for this task".into(),
            };
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let content = if tail_lines > 0 {
                    tail(&content, tail_lines)
                } else {
                    content
                };
                Response::TaskLog(TaskLog {
                    task_id,
                    log_path: path.display().to_string(),
                    content,
                })
            }
            Err(_) => Response::Error {
                message: format!("Log file not found: {}", path.display()),
            },
        }
    }

    fn handle_shutdown(&self) -> Response {
        tracing::info!("Shutdown requested");
        // Cancel shortly after returning so the response still reaches
        // the client.
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        Response::ShuttingDown
    }
}

/// Last `n` lines of a log, newline-terminated.
fn tail(content: &str, n: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    let mut out = lines[start..].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}
