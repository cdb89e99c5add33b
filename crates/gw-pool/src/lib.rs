//! The worker pool (C6) — the heart of the gateway. A bounded number of
//! child-process slots with a FIFO overflow queue. `submit` starts a task
//! directly when a slot is free rather than always enqueueing and relying on
//! a poller to notice; completion is pushed to waiters through a one-shot
//! notification the instant a task reaches a terminal state, not discovered
//! by polling `get_result`.
//!
//! The background monitor has exactly one job: promote queued tasks into
//! free slots. Reaping and hard wall-clock timeouts are each task's own
//! concern (raced via `tokio::select!` against its child), so a slot is
//! reclaimed the instant its task ends rather than on the next monitor tick.

mod child;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use gw_types::{GatewayError, TaskError, TaskErrorKind, TaskOutcome, TaskState};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

pub use child::ChildEvent;
use child::{ChildRunOutcome, ChildSpec};

const MONITOR_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub prompt: String,
    pub model_alias: String,
    pub allowed_tools: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
    pub request_id: String,
    pub timeout: Duration,
}

struct QueuedTask {
    id: Uuid,
    request: SubmitRequest,
}

struct TaskEntry {
    watch_tx: watch::Sender<Option<TaskOutcome>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

struct PoolState {
    active: usize,
    queue: VecDeque<QueuedTask>,
    tasks: HashMap<Uuid, TaskEntry>,
    draining: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    max_workers: usize,
    max_queue_depth: usize,
    cli_command: String,
    monitor_interval: Duration,
}

/// Cloneable handle to the pool; cheap to share across axum handlers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: std::sync::Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, max_queue_depth: usize, cli_command: impl Into<String>) -> Self {
        Self::with_monitor_interval(max_workers, max_queue_depth, cli_command, MONITOR_TICK)
    }

    pub fn with_monitor_interval(
        max_workers: usize,
        max_queue_depth: usize,
        cli_command: impl Into<String>,
        monitor_interval: Duration,
    ) -> Self {
        let inner = std::sync::Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                active: 0,
                queue: VecDeque::new(),
                tasks: HashMap::new(),
                draining: false,
            }),
            max_workers,
            max_queue_depth,
            cli_command: cli_command.into(),
            monitor_interval,
        });
        let pool = Self { inner };
        pool.spawn_monitor();
        pool
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").active
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").queue.len()
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Submits a task. Starts it immediately if a slot is free; otherwise
    /// enqueues it, rejecting with `Overloaded` once the queue is at
    /// capacity. Rejects everything once the pool is draining.
    pub fn submit(&self, request: SubmitRequest) -> Result<Uuid, GatewayError> {
        let id = Uuid::new_v4();
        let (watch_tx, _rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let start_now = {
            let mut guard = self.inner.state.lock().expect("pool mutex poisoned");
            if guard.draining {
                return Err(GatewayError::overloaded_draining());
            }
            if guard.active < self.inner.max_workers {
                guard.active += 1;
                guard.tasks.insert(
                    id,
                    TaskEntry {
                        watch_tx: watch_tx.clone(),
                        cancel_tx: Some(cancel_tx),
                    },
                );
                true
            } else {
                if guard.queue.len() >= self.inner.max_queue_depth {
                    return Err(GatewayError::Overloaded {
                        reason: "queue at capacity".to_string(),
                    });
                }
                guard.tasks.insert(
                    id,
                    TaskEntry {
                        watch_tx: watch_tx.clone(),
                        cancel_tx: Some(cancel_tx),
                    },
                );
                guard.queue.push_back(QueuedTask {
                    id,
                    request: request.clone(),
                });
                false
            }
        };

        if start_now {
            self.spawn_runner(id, request, watch_tx, cancel_rx, None);
        }

        Ok(id)
    }

    /// Like `submit`, but taps the raw child event stream (token deltas, tool
    /// calls, agent spawns) as they are produced — used by the streaming
    /// gateway and the agentic executor. The task must start immediately or
    /// not at all: a queued task has nothing to stream yet, so event-sink
    /// submissions never enter the overflow queue.
    pub fn submit_with_events(
        &self,
        request: SubmitRequest,
        sink: tokio::sync::mpsc::UnboundedSender<ChildEvent>,
    ) -> Result<Uuid, GatewayError> {
        let id = Uuid::new_v4();
        let (watch_tx, _rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        {
            let mut guard = self.inner.state.lock().expect("pool mutex poisoned");
            if guard.draining {
                return Err(GatewayError::overloaded_draining());
            }
            if guard.active >= self.inner.max_workers {
                return Err(GatewayError::Overloaded {
                    reason: "no free worker slot for a streaming submission".to_string(),
                });
            }
            guard.active += 1;
            guard.tasks.insert(
                id,
                TaskEntry {
                    watch_tx: watch_tx.clone(),
                    cancel_tx: Some(cancel_tx),
                },
            );
        }

        self.spawn_runner(id, request, watch_tx, cancel_rx, Some(sink));
        Ok(id)
    }

    /// Awaits the terminal outcome of `id`, up to `timeout`. Never polls:
    /// subscribes to the task's completion channel and either reads the
    /// value already there or waits for the single write that will ever land.
    pub async fn get_result(&self, id: Uuid, timeout: Duration) -> Result<TaskOutcome, GatewayError> {
        let mut rx = {
            let guard = self.inner.state.lock().expect("pool mutex poisoned");
            guard
                .tasks
                .get(&id)
                .map(|t| t.watch_tx.subscribe())
                .ok_or_else(|| GatewayError::InvalidRequest {
                    field: "task_id".to_string(),
                })?
        };

        if let Some(outcome) = rx.borrow().clone() {
            return Ok(outcome);
        }

        tokio::select! {
            _ = tokio::time::sleep(timeout) => Err(GatewayError::Timeout),
            changed = rx.changed() => {
                if changed.is_err() {
                    return Err(GatewayError::Internal);
                }
                rx.borrow().clone().ok_or(GatewayError::Internal)
            }
        }
    }

    /// Cancels a task. A queued task is removed and resolved as `Cancelled`
    /// immediately; a running task is asked to stop, and resolves as
    /// `Cancelled` through the normal completion path once its child exits.
    pub fn cancel(&self, id: Uuid) -> Result<(), GatewayError> {
        let mut guard = self.inner.state.lock().expect("pool mutex poisoned");

        if let Some(pos) = guard.queue.iter().position(|q| q.id == id) {
            let queued = guard.queue.remove(pos).expect("position just found");
            let entry = guard.tasks.remove(&id);
            drop(guard);
            let outcome = cancelled_outcome(id, Utc::now());
            if let Some(entry) = entry {
                let _ = entry.watch_tx.send(Some(outcome));
            }
            let _ = queued;
            return Ok(());
        }

        if let Some(entry) = guard.tasks.get_mut(&id) {
            if let Some(cancel_tx) = entry.cancel_tx.take() {
                let _ = cancel_tx.send(());
                return Ok(());
            }
            // Already cancelled or already terminal; idempotent no-op.
            return Ok(());
        }

        Err(GatewayError::InvalidRequest {
            field: "task_id".to_string(),
        })
    }

    /// Stops admitting new work and waits (up to `deadline`) for in-flight
    /// tasks to finish, then force-cancels whatever remains.
    pub async fn drain(&self, deadline: Duration) {
        {
            let mut guard = self.inner.state.lock().expect("pool mutex poisoned");
            guard.draining = true;
            guard.queue.clear();
        }

        let start = tokio::time::Instant::now();
        loop {
            if self.active_count() == 0 {
                return;
            }
            if start.elapsed() >= deadline {
                break;
            }
            tokio::time::sleep(self.inner.monitor_interval).await;
        }

        let remaining: Vec<Uuid> = {
            let guard = self.inner.state.lock().expect("pool mutex poisoned");
            guard.tasks.keys().copied().collect()
        };
        for id in remaining {
            let _ = self.cancel(id);
        }
    }

    fn spawn_monitor(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(inner.monitor_interval).await;

                let to_start: Vec<(Uuid, SubmitRequest, watch::Sender<Option<TaskOutcome>>, oneshot::Receiver<()>)> = {
                    let mut guard = inner.state.lock().expect("pool mutex poisoned");
                    if guard.draining {
                        continue;
                    }
                    let mut started = Vec::new();
                    while guard.active < inner.max_workers {
                        let Some(queued) = guard.queue.pop_front() else {
                            break;
                        };
                        guard.active += 1;
                        let (cancel_tx, cancel_rx) = oneshot::channel();
                        let watch_tx = guard
                            .tasks
                            .get(&queued.id)
                            .map(|e| e.watch_tx.clone())
                            .expect("queued task has an entry");
                        guard.tasks.insert(
                            queued.id,
                            TaskEntry {
                                watch_tx: watch_tx.clone(),
                                cancel_tx: Some(cancel_tx),
                            },
                        );
                        started.push((queued.id, queued.request, watch_tx, cancel_rx));
                    }
                    started
                };

                if to_start.is_empty() {
                    continue;
                }

                let pool = WorkerPool { inner: inner.clone() };
                for (id, request, watch_tx, cancel_rx) in to_start {
                    pool.spawn_runner(id, request, watch_tx, cancel_rx, None);
                }
            }
        });
    }

    fn spawn_runner(
        &self,
        id: Uuid,
        request: SubmitRequest,
        watch_tx: watch::Sender<Option<TaskOutcome>>,
        cancel_rx: oneshot::Receiver<()>,
        sink: Option<tokio::sync::mpsc::UnboundedSender<ChildEvent>>,
    ) {
        let inner = self.inner.clone();
        let submitted_at = Utc::now();
        tokio::spawn(async move {
            let started_at = Utc::now();
            let spec = ChildSpec {
                cli_command: inner.cli_command.clone(),
                prompt: request.prompt,
                model_alias: request.model_alias,
                allowed_tools: request.allowed_tools,
                working_directory: request.working_directory,
                request_id: request.request_id,
            };

            let outcome = run_one(spec, request.timeout, cancel_rx, sink, submitted_at, started_at, id).await;

            let mut guard = inner.state.lock().expect("pool mutex poisoned");
            guard.active = guard.active.saturating_sub(1);
            guard.tasks.remove(&id);
            drop(guard);
            let _ = watch_tx.send(Some(outcome));
        });
    }
}

async fn run_one(
    spec: ChildSpec,
    timeout: Duration,
    mut cancel_rx: oneshot::Receiver<()>,
    sink: Option<tokio::sync::mpsc::UnboundedSender<ChildEvent>>,
    submitted_at: chrono::DateTime<Utc>,
    started_at: chrono::DateTime<Utc>,
    id: Uuid,
) -> TaskOutcome {
    let spawned = child::spawn(&spec);
    let (child, _prompt_file) = match spawned {
        Ok(pair) => pair,
        Err(err) => {
            return failed_outcome(
                id,
                submitted_at,
                Some(started_at),
                TaskErrorKind::ChildExit,
                format!("failed to start child process: {err}"),
                None,
            );
        }
    };

    tokio::select! {
        biased;
        _ = &mut cancel_rx => {
            cancelled_outcome_with_times(id, submitted_at, Some(started_at))
        }
        _ = tokio::time::sleep(timeout) => {
            failed_outcome(id, submitted_at, Some(started_at), TaskErrorKind::Timeout, "task exceeded its time budget".to_string(), None)
        }
        result = child::drive_to_completion(child, sink) => {
            match result {
                Ok(ChildRunOutcome::Result { text, usage, model }) => TaskOutcome {
                    task_id: id.to_string(),
                    state: TaskState::Completed,
                    text: Some(text),
                    usage: Some(usage),
                    error: None,
                    submitted_at,
                    started_at: Some(started_at),
                    completed_at: Some(Utc::now()),
                },
                Ok(ChildRunOutcome::MalformedOutput) => failed_outcome(
                    id, submitted_at, Some(started_at), TaskErrorKind::OutputMalformed,
                    "child process produced no valid result event".to_string(), None,
                ),
                Ok(ChildRunOutcome::Exited { code }) => failed_outcome(
                    id, submitted_at, Some(started_at), TaskErrorKind::ChildExit,
                    format!("child process exited with code {code}"), Some(code),
                ),
                Err(err) => failed_outcome(
                    id, submitted_at, Some(started_at), TaskErrorKind::ChildExit,
                    format!("io error driving child process: {err}"), None,
                ),
            }
        }
    }
}

fn failed_outcome(
    id: Uuid,
    submitted_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
    kind: TaskErrorKind,
    message: String,
    exit_code: Option<i32>,
) -> TaskOutcome {
    let state = match kind {
        TaskErrorKind::Timeout => TaskState::Timeout,
        TaskErrorKind::Cancelled => TaskState::Cancelled,
        _ => TaskState::Failed,
    };
    TaskOutcome {
        task_id: id.to_string(),
        state,
        text: None,
        usage: None,
        error: Some(TaskError {
            kind,
            message,
            exit_code,
        }),
        submitted_at,
        started_at,
        completed_at: Some(Utc::now()),
    }
}

fn cancelled_outcome_with_times(
    id: Uuid,
    submitted_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
) -> TaskOutcome {
    TaskOutcome {
        task_id: id.to_string(),
        state: TaskState::Cancelled,
        text: None,
        usage: None,
        error: Some(TaskError {
            kind: TaskErrorKind::Cancelled,
            message: "task was cancelled".to_string(),
            exit_code: None,
        }),
        submitted_at,
        started_at,
        completed_at: Some(Utc::now()),
    }
}

fn cancelled_outcome(id: Uuid, submitted_at: chrono::DateTime<Utc>) -> TaskOutcome {
    cancelled_outcome_with_times(id, submitted_at, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Uses `/bin/sh` as a stand-in CLI: every test drives it with a script
    // fed as the prompt file on stdin, exercising the same child-process
    // contract a real CLI binary would see.

    fn pool(max_workers: usize, max_queue_depth: usize) -> WorkerPool {
        WorkerPool::new(max_workers, max_queue_depth, "sh")
    }

    fn request(prompt_script: &str, timeout_ms: u64) -> SubmitRequest {
        SubmitRequest {
            prompt: prompt_script.to_string(),
            model_alias: "sonnet".to_string(),
            allowed_tools: None,
            working_directory: None,
            request_id: Uuid::new_v4().to_string(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn direct_start_completes_and_notifies() {
        let pool = pool(2, 4);
        let req = request(r#"echo '{"type":"result","text":"hi","usage":{"input_tokens":1,"output_tokens":1},"model":"sonnet"}'"#, 2000);
        let id = pool.submit(req).unwrap();
        let outcome = pool.get_result(id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome.state, TaskState::Completed);
        assert_eq!(outcome.text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn queued_task_starts_once_a_slot_frees() {
        let pool = pool(1, 4);
        let slow = request(r#"sleep 0.2 && echo '{"type":"result","text":"slow","usage":{"input_tokens":1,"output_tokens":1},"model":"sonnet"}'"#, 2000);
        let fast = request(r#"echo '{"type":"result","text":"fast","usage":{"input_tokens":1,"output_tokens":1},"model":"sonnet"}'"#, 2000);

        let first = pool.submit(slow).unwrap();
        let second = pool.submit(fast).unwrap();
        assert_eq!(pool.queued_count(), 1);

        let second_outcome = pool.get_result(second, Duration::from_secs(2)).await.unwrap();
        assert_eq!(second_outcome.state, TaskState::Completed);
        let first_outcome = pool.get_result(first, Duration::from_secs(2)).await.unwrap();
        assert_eq!(first_outcome.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn queue_overflow_is_rejected_as_overloaded() {
        let pool = pool(1, 1);
        let blocker = request("sleep 1", 2000);
        let _ = pool.submit(blocker).unwrap();
        let _queued = pool.submit(request("echo hi", 2000)).unwrap();
        let rejected = pool.submit(request("echo hi", 2000));
        assert!(matches!(rejected, Err(GatewayError::Overloaded { .. })));
    }

    #[tokio::test]
    async fn malformed_output_is_a_terminal_failure() {
        let pool = pool(2, 4);
        let req = request("echo 'not json at all'", 2000);
        let id = pool.submit(req).unwrap();
        let outcome = pool.get_result(id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome.state, TaskState::Failed);
        assert_eq!(
            outcome.error.map(|e| e.kind),
            Some(TaskErrorKind::OutputMalformed)
        );
    }

    #[tokio::test]
    async fn hard_timeout_is_enforced() {
        let pool = pool(2, 4);
        let req = request("sleep 5", 50);
        let id = pool.submit(req).unwrap();
        let outcome = pool.get_result(id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome.state, TaskState::Timeout);
    }

    #[tokio::test]
    async fn cancel_running_task_resolves_as_cancelled() {
        let pool = pool(2, 4);
        let req = request("sleep 5", 5000);
        let id = pool.submit(req).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.cancel(id).unwrap();
        let outcome = pool.get_result(id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_queued_task_resolves_immediately_without_a_slot() {
        let pool = pool(1, 4);
        let blocker = request("sleep 1", 2000);
        let _ = pool.submit(blocker).unwrap();
        let queued_id = pool.submit(request("echo hi", 2000)).unwrap();
        pool.cancel(queued_id).unwrap();
        let outcome = pool.get_result(queued_id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn active_count_never_exceeds_max_workers() {
        let pool = pool(2, 8);
        let ids: Vec<Uuid> = (0..6)
            .map(|_| pool.submit(request("sleep 0.1", 2000)).unwrap())
            .collect();
        assert!(pool.active_count() <= 2);
        for id in ids {
            let _ = pool.get_result(id, Duration::from_secs(3)).await;
        }
        assert_eq!(pool.active_count(), 0);
    }
}
