use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::executor::Executor;
use crate::resources::ResourceLedger;
use crate::store::TaskStore;
use crate::task::TaskStatus;

/// Invoked on every task state transition, outside all core locks.
pub type StateCallback = Box<dyn Fn(u64, TaskStatus, TaskStatus) + Send + Sync>;

/// Drives tasks through their lifecycle with two cooperating loops.
///
/// The *dispatch* loop advances the queue head from Pending to Running
/// once the ledger can satisfy its request; the *supervise* loop reaps
/// finished children and releases their resources. One task is placed
/// per dispatch tick: the sustained-idle check inside a reservation can
/// take seconds and the ledger lock is held for its duration, so
/// yielding between dispatches keeps the supervise loop responsive.
pub struct Scheduler {
    store: Arc<TaskStore>,
    ledger: Arc<ResourceLedger>,
    executor: Arc<Executor>,
    dispatch_interval: Duration,
    supervise_interval: Duration,
    callback: Mutex<Option<StateCallback>>,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        ledger: Arc<ResourceLedger>,
        executor: Arc<Executor>,
        dispatch_interval_ms: u64,
        supervise_interval_ms: u64,
    ) -> Self {
        Self {
            store,
            ledger,
            executor,
            dispatch_interval: Duration::from_millis(dispatch_interval_ms),
            supervise_interval: Duration::from_millis(supervise_interval_ms),
            callback: Mutex::new(None),
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Install the state-change observer. Replaces any previous one.
    pub fn set_callback(&self, callback: StateCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Recover in-flight work from a previous daemon life, then start
    /// the dispatch and supervise loops.
    pub async fn start(self: &Arc<Self>) {
        self.recover().await;

        let dispatcher = self.clone();
        let dispatch = tokio::spawn(async move {
            let mut interval = tokio::time::interval(dispatcher.dispatch_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = dispatcher.token.cancelled() => break,
                    _ = interval.tick() => {
                        dispatcher.dispatch_tick().await;
                    }
                }
            }
        });

        let supervisor = self.clone();
        let supervise = tokio::spawn(async move {
            let mut interval = tokio::time::interval(supervisor.supervise_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = supervisor.token.cancelled() => break,
                    _ = interval.tick() => {
                        supervisor.supervise_tick().await;
                    }
                }
            }
        });

        let mut handles = self.handles.lock().unwrap();
        handles.push(dispatch);
        handles.push(supervise);
        tracing::info!("Scheduler started");
    }

    /// Cancel both loops and wait for them to observe it.
    pub async fn stop(&self) {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("Scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// One pass of the dispatch loop. Returns true when a task was
    /// placed and is now Running.
    ///
    /// Strict FIFO: only the queue head is considered. A head whose
    /// request cannot be satisfied blocks everything behind it until
    /// resources free up.
    pub async fn dispatch_tick(&self) -> bool {
        let Some(task) = self.store.pending().into_iter().next() else {
            return false;
        };

        let Some(allocation) = self
            .ledger
            .reserve(
                task.ncpu,
                task.ngpu,
                &task.specific_cpus,
                &task.specific_gpus,
            )
            .await
        else {
            return false;
        };

        let pid = match self
            .executor
            .spawn(&task, &allocation.cpus, &allocation.gpus)
            .await
        {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!(task_id = task.id, error = %e, "Spawn failed");
                self.ledger
                    .release(&allocation.cpus, &allocation.gpus)
                    .await;
                if self.store.set_failed(task.id) {
                    self.notify(task.id, TaskStatus::Pending, TaskStatus::Failed);
                }
                self.store.save();
                return false;
            }
        };

        if self
            .store
            .set_running(task.id, pid, &allocation.cpus, &allocation.gpus)
        {
            self.notify(task.id, TaskStatus::Pending, TaskStatus::Running);
            self.store.save();
            true
        } else {
            // The task disappeared between the snapshot and the
            // transition (concurrent delete). Undo the launch.
            self.executor.signal(pid, true).await;
            self.ledger
                .release(&allocation.cpus, &allocation.gpus)
                .await;
            false
        }
    }

    /// One pass of the supervise loop: reap every finished child,
    /// release its resources, record the exit.
    pub async fn supervise_tick(&self) {
        for task in self.store.running() {
            if task.pid <= 0 {
                continue;
            }
            let status = self.executor.probe(task.pid).await;
            if status.running {
                continue;
            }

            self.ledger
                .release(&task.allocated_cpus, &task.allocated_gpus)
                .await;
            // An unreapable process still leaves Running, with exit -1.
            if self.store.set_completed(task.id, status.exit_code) {
                tracing::info!(
                    task_id = task.id,
                    exit_code = status.exit_code,
                    signalled = status.signalled,
                    "Task finished"
                );
                self.notify(task.id, TaskStatus::Running, TaskStatus::Completed);
            }
            self.store.save();
        }
    }

    /// Terminate a running task: graceful signal, 2 s grace, forced
    /// kill, 1 s grace. Resources are released and the record removed
    /// whatever the process did with its signals; a dying process with
    /// a reservation is strictly worse than a wandering process without
    /// one. Returns false for tasks that are not Running.
    pub async fn terminate(&self, task_id: u64, force: bool) -> bool {
        let Some(task) = self.store.get(task_id) else {
            return false;
        };
        if !task.is_running() || task.pid <= 0 {
            return false;
        }

        self.executor.signal(task.pid, force).await;
        let mut exit = self.executor.await_exit(task.pid, 2000).await;
        if exit.is_none() {
            tracing::warn!(task_id, pid = task.pid, "Graceful stop timed out, killing");
            self.executor.signal(task.pid, true).await;
            exit = self.executor.await_exit(task.pid, 1000).await;
        }
        if exit.is_none() {
            tracing::warn!(task_id, pid = task.pid, "Process survived SIGKILL, abandoning it");
        }

        self.ledger
            .release(&task.allocated_cpus, &task.allocated_gpus)
            .await;
        self.store.delete(task_id);
        self.notify(task_id, TaskStatus::Running, TaskStatus::Cancelled);
        self.store.save();
        true
    }

    /// Reconcile the loaded store with what is actually alive: a task
    /// whose pid survived the restart stays Running with its resources
    /// re-marked; one whose process is gone becomes Failed.
    async fn recover(&self) {
        self.store.load();

        for task in self.store.running() {
            let status = self.executor.probe(task.pid).await;
            if status.running {
                tracing::info!(task_id = task.id, pid = task.pid, "Task survived restart");
                self.ledger
                    .re_mark(&task.allocated_cpus, &task.allocated_gpus)
                    .await;
            } else {
                tracing::warn!(task_id = task.id, pid = task.pid, "Task died while daemon was down");
                if self.store.set_failed(task.id) {
                    self.notify(task.id, TaskStatus::Running, TaskStatus::Failed);
                }
            }
        }
        self.store.save();
    }

    fn notify(&self, task_id: u64, old: TaskStatus, new: TaskStatus) {
        let callback = self.callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            callback(task_id, old, new);
        }
    }
}
