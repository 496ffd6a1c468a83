//! Single-worker FIFO queue for commit persistence.
//!
//! Every piece of work takes a ticket when it is submitted. Work runs strictly
//! in ticket order and never concurrently, whether it runs on the queue's
//! worker thread ([`SerialQueue::submit`]) or on the caller's thread
//! ([`SerialQueue::run_inline`]).
//!
//! Tasks are tracked in an in-flight map keyed by a UUID task id from
//! submission until they complete, fail or are cancelled. A task that reports
//! `Interrupted` counts as cancelled.

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sharedprefs_core::{Error, Result};

/// Identifier of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks waiting for the worker.
    pub queue_depth: usize,
    /// Tasks submitted and not yet finished, running ones included.
    pub in_flight: usize,
    /// Tasks that finished successfully.
    pub completed: u64,
    /// Tasks that reported an interruption.
    pub cancelled: u64,
    /// Tasks that returned an error or panicked.
    pub failed: u64,
}

type Work = Box<dyn FnOnce() -> Result<()> + Send>;

struct Task {
    id: TaskId,
    ticket: u64,
    work: Work,
}

struct TaskInfo {
    name: &'static str,
    submitted: Instant,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    in_flight: FxHashMap<TaskId, TaskInfo>,
    next_ticket: u64,
    now_serving: u64,
    shutdown: bool,
    completed: u64,
    cancelled: u64,
    failed: u64,
}

impl QueueState {
    fn idle(&self) -> bool {
        self.now_serving == self.next_ticket
    }
}

enum TaskEnd {
    Completed,
    Cancelled,
    Failed,
}

impl TaskEnd {
    fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => TaskEnd::Completed,
            Err(Error::Interrupted(_)) => TaskEnd::Cancelled,
            Err(_) => TaskEnd::Failed,
        }
    }
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    work_ready: Condvar,
    turn_changed: Condvar,
}

impl QueueInner {
    fn wait_for_turn(&self, state: &mut parking_lot::MutexGuard<'_, QueueState>, ticket: u64) {
        while state.now_serving != ticket {
            self.turn_changed.wait(state);
        }
    }
}

/// RAII guard that advances the turn and records the task outcome on drop.
///
/// A task that panics is recorded as failed, so the turn always moves on and
/// later work and `drain()` never hang.
struct TurnGuard<'a> {
    inner: &'a QueueInner,
    id: TaskId,
    end: TaskEnd,
}

impl<'a> Drop for TurnGuard<'a> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let info = state.in_flight.remove(&self.id);
        match self.end {
            TaskEnd::Completed => state.completed += 1,
            TaskEnd::Cancelled => state.cancelled += 1,
            TaskEnd::Failed => state.failed += 1,
        }
        state.now_serving += 1;
        drop(state);
        self.inner.turn_changed.notify_all();

        if let Some(info) = info {
            let elapsed = info.submitted.elapsed();
            match self.end {
                TaskEnd::Completed => {
                    debug!(target: "sharedprefs::queue", task = %self.id, name = info.name, ?elapsed, "task completed")
                }
                TaskEnd::Cancelled => {
                    info!(target: "sharedprefs::queue", task = %self.id, name = info.name, "task cancelled")
                }
                TaskEnd::Failed => {
                    warn!(target: "sharedprefs::queue", task = %self.id, name = info.name, "task failed")
                }
            }
        }
    }
}

/// Single-worker FIFO task queue.
pub struct SerialQueue {
    inner: Arc<QueueInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: ThreadId,
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SerialQueue {
    /// Create a queue whose worker thread is called `name`.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the worker thread cannot be spawned.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let inner = Arc::new(QueueInner {
            name: name.clone(),
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            turn_changed: Condvar::new(),
        });

        let inner_clone = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&inner_clone))
            .map_err(|e| Error::persistence(format!("failed to spawn '{}': {}", name, e)))?;
        let worker_thread = handle.thread().id();

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
            worker_thread,
        })
    }

    /// Queue `work` behind everything submitted so far.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` once the queue is shut down.
    pub fn submit(
        &self,
        name: &'static str,
        work: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<TaskId> {
        let id = TaskId::new();
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(Error::Interrupted(format!(
                    "queue '{}' is shut down",
                    self.inner.name
                )));
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.in_flight.insert(
                id,
                TaskInfo {
                    name,
                    submitted: Instant::now(),
                },
            );
            state.tasks.push_back(Task {
                id,
                ticket,
                work: Box::new(work),
            });
        }
        self.inner.work_ready.notify_one();
        debug!(target: "sharedprefs::queue", task = %id, name, "task enqueued");
        Ok(id)
    }

    /// Run `work` on the calling thread, in queue order.
    ///
    /// Waits until everything submitted earlier has finished, runs `work`
    /// with no other queue work running, and returns its result.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` once the queue is shut down, or whatever `work`
    /// returns.
    pub fn run_inline<T>(&self, name: &'static str, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let id = TaskId::new();
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(Error::Interrupted(format!(
                    "queue '{}' is shut down",
                    self.inner.name
                )));
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.in_flight.insert(
                id,
                TaskInfo {
                    name,
                    submitted: Instant::now(),
                },
            );
            self.inner.wait_for_turn(&mut state, ticket);
        }

        let mut guard = TurnGuard {
            inner: &self.inner,
            id,
            end: TaskEnd::Failed,
        };
        let result = work();
        guard.end = TaskEnd::of(&result);
        result
    }

    /// True if `id` is queued or running.
    pub fn is_in_flight(&self, id: TaskId) -> bool {
        self.inner.state.lock().in_flight.contains_key(&id)
    }

    /// Block until all queued and running work has finished.
    ///
    /// The worker keeps running afterwards. Calling this from inside queued
    /// work would wait on itself, so it returns immediately on the worker.
    pub fn drain(&self) {
        if std::thread::current().id() == self.worker_thread {
            return;
        }
        let mut state = self.inner.state.lock();
        while !state.idle() {
            self.inner.turn_changed.wait(&mut state);
        }
    }

    /// Stop accepting work, run what is queued, and join the worker.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.work_ready.notify_all();
        }

        if std::thread::current().id() == self.worker_thread {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// True once `shutdown()` was called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Worker thread name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Return a snapshot of queue metrics.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            queue_depth: state.tasks.len(),
            in_flight: state.in_flight.len(),
            completed: state.completed,
            cancelled: state.cancelled,
            failed: state.failed,
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &QueueInner) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    inner.wait_for_turn(&mut state, task.ticket);
                    break task;
                }
                if state.shutdown {
                    return;
                }
                inner.work_ready.wait(&mut state);
            }
        };

        let mut guard = TurnGuard {
            inner,
            id: task.id,
            end: TaskEnd::Failed,
        };

        // catch_unwind keeps a panicking task from killing the worker
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(task.work)) {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!(target: "sharedprefs::queue", task = %task.id, error = %e, "task returned error");
                }
                guard.end = TaskEnd::of(&result);
            }
            Err(e) => {
                error!(
                    target: "sharedprefs::queue",
                    task = %task.id,
                    "task panicked: {:?}",
                    e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_submit_and_drain() {
        let queue = SerialQueue::new("test-queue").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let c = Arc::clone(&counter);
            queue
                .submit("count", move || {
                    c.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
                .unwrap();
        }

        queue.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        let stats = queue.stats();
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.in_flight, 0);
        queue.shutdown();
    }

    #[test]
    fn test_fifo_order() {
        let queue = SerialQueue::new("test-queue").unwrap();

        // Block the worker so tasks pile up
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        queue
            .submit("block", move || {
                b.wait();
                Ok(())
            })
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let o = Arc::clone(&order);
            queue
                .submit("push", move || {
                    o.lock().push(i);
                    Ok(())
                })
                .unwrap();
        }

        barrier.wait();
        queue.drain();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_run_inline_waits_for_earlier_work() {
        let queue = SerialQueue::new("test-queue").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        queue
            .submit("slow", move || {
                std::thread::sleep(Duration::from_millis(50));
                o.lock().push("queued");
                Ok(())
            })
            .unwrap();

        let value = queue
            .run_inline("inline", || {
                order.lock().push("inline");
                Ok(42)
            })
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(*order.lock(), vec!["queued", "inline"]);
        assert_eq!(queue.stats().completed, 2);
    }

    #[test]
    fn test_interrupted_task_is_cancelled() {
        let queue = SerialQueue::new("test-queue").unwrap();
        let id = queue
            .submit("interrupted", || Err(Error::Interrupted("lock wait".into())))
            .unwrap();
        queue
            .submit("broken", || Err(Error::persistence("disk full")))
            .unwrap();
        queue.drain();

        assert!(!queue.is_in_flight(id));
        let stats = queue.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let queue = SerialQueue::new("test-queue").unwrap();
        queue.submit("panic", || panic!("boom")).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        queue
            .submit("after", move || {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();

        queue.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(queue.stats().failed, 1);
    }

    #[test]
    fn test_in_flight_until_finished() {
        let queue = SerialQueue::new("test-queue").unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        let id = queue
            .submit("block", move || {
                b.wait();
                Ok(())
            })
            .unwrap();

        assert!(queue.is_in_flight(id));
        barrier.wait();
        queue.drain();
        assert!(!queue.is_in_flight(id));
    }

    #[test]
    fn test_shutdown_runs_queued_work_and_rejects_new() {
        let queue = SerialQueue::new("test-queue").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = Arc::clone(&counter);
            queue
                .submit("count", move || {
                    c.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
                .unwrap();
        }

        queue.shutdown();
        queue.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert!(queue.is_shutdown());
        assert!(matches!(
            queue.submit("late", || Ok(())),
            Err(Error::Interrupted(_))
        ));
        assert!(matches!(
            queue.run_inline("late", || Ok(())),
            Err(Error::Interrupted(_))
        ));
    }

    #[test]
    fn test_worker_thread_is_named() {
        let queue = SerialQueue::new("named-worker").unwrap();
        let name = Arc::new(Mutex::new(None));
        let n = Arc::clone(&name);
        queue
            .submit("name", move || {
                *n.lock() = std::thread::current().name().map(str::to_string);
                Ok(())
            })
            .unwrap();
        queue.drain();
        assert_eq!(name.lock().as_deref(), Some("named-worker"));
        assert_eq!(queue.name(), "named-worker");
    }
}
