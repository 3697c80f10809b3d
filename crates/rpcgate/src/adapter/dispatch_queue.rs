//! Dispatch queue
//!
//! Holds admitted requests until they run. In serialized mode a single pump
//! runs one task at a time, in admission order. In concurrent mode the pump
//! hands tasks to a bounded set of workers and completion order is free.
//! Closing the queue hands back every task that has not started; started tasks
//! always run to completion.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, Semaphore};
use tracing::trace;

/// Unit of work accepted by a [`DispatchQueue`]
pub trait Dispatch: Send + 'static {
    /// Run the task to completion
    fn run(self) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One task at a time, FIFO
    Serialized,
    /// Up to `n` tasks at a time
    Concurrent(usize),
}

type IdleHook = Box<dyn Fn() + Send + Sync>;

struct QueueState<T> {
    tasks: VecDeque<T>,
    running: usize,
    closed: bool,
    pump_started: bool,
}

struct Inner<T> {
    mode: DispatchMode,
    state: Mutex<QueueState<T>>,
    work: Notify,
    idle: Notify,
    on_idle: Option<IdleHook>,
}

pub struct DispatchQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Dispatch> DispatchQueue<T> {
    pub fn new(mode: DispatchMode) -> Self {
        Self::build(mode, None)
    }

    /// Create a queue that calls `hook` every time it becomes idle
    pub fn with_idle_hook(mode: DispatchMode, hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self::build(mode, Some(Box::new(hook)))
    }

    fn build(mode: DispatchMode, on_idle: Option<IdleHook>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                state: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    running: 0,
                    closed: false,
                    pump_started: false,
                }),
                work: Notify::new(),
                idle: Notify::new(),
                on_idle,
            }),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.inner.mode
    }

    /// Append a task; hands it back if the queue is closed
    pub fn push(&self, task: T) -> Result<(), T> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(task);
            }
            state.tasks.push_back(task);
            if !state.pump_started {
                state.pump_started = true;
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    match inner.mode {
                        DispatchMode::Serialized => run_serialized(inner).await,
                        DispatchMode::Concurrent(workers) => run_concurrent(inner, workers).await,
                    }
                });
            }
        }
        self.inner.work.notify_one();
        Ok(())
    }

    /// Close the queue, returning the tasks that never started
    pub fn close(&self) -> Vec<T> {
        let (drained, idle) = {
            let mut state = self.inner.lock();
            state.closed = true;
            let drained: Vec<T> = state.tasks.drain(..).collect();
            (drained, state.running == 0)
        };
        self.inner.work.notify_one();
        if idle && !drained.is_empty() {
            self.inner.became_idle();
        }
        trace!("Dispatch queue closed, {} tasks not started", drained.len());
        drained
    }

    /// Nothing queued and nothing running
    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued tasks that have not started
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks currently running
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Wait until the queue is idle
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl<T> QueueState<T> {
    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.running == 0
    }
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the next task, marking it running; `None` once closed and empty
    async fn next_task(&self) -> Option<T> {
        loop {
            let notified = self.work.notified();
            {
                let mut state = self.lock();
                if let Some(task) = state.tasks.pop_front() {
                    state.running += 1;
                    return Some(task);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn finish_one(&self) {
        let idle = {
            let mut state = self.lock();
            state.running -= 1;
            state.is_idle()
        };
        if idle {
            self.became_idle();
        }
    }

    fn became_idle(&self) {
        self.idle.notify_waiters();
        if let Some(hook) = &self.on_idle {
            hook();
        }
    }
}

/// Marks a task finished even if it panics
struct Running<T>(Arc<Inner<T>>);

impl<T> Drop for Running<T> {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

async fn run_serialized<T: Dispatch>(inner: Arc<Inner<T>>) {
    while let Some(task) = inner.next_task().await {
        let _running = Running(Arc::clone(&inner));
        task.run().await;
    }
    trace!("Serialized dispatch pump stopped");
}

async fn run_concurrent<T: Dispatch>(inner: Arc<Inner<T>>, workers: usize) {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    loop {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            return;
        };
        let Some(task) = inner.next_task().await else {
            break;
        };
        let running = Running(Arc::clone(&inner));
        tokio::spawn(async move {
            let _permit = permit;
            let _running = running;
            task.run().await;
        });
    }
    trace!("Concurrent dispatch pump stopped");
}
