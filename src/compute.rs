//! Bounded pool of compute executors for CPU-intensive callbacks
//!
//! Executors are long-lived threads with their own inbox, running handlers
//! that were registered up front and are addressed by tag; no code travels in
//! the messages. Dispatch is round-robin over non-busy executors. When every
//! executor is busy the submission runs inline on the caller's thread: the
//! pool favors latency over queueing.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Error type for compute submissions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// No handler registered under the given tag
    UnknownHandler(String),
    /// The handler returned an error or panicked
    Handler(String),
    /// The executor terminated before replying
    ExecutorGone,
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::UnknownHandler(tag) => write!(f, "Unknown handler: {}", tag),
            ComputeError::Handler(message) => write!(f, "Handler error: {}", message),
            ComputeError::ExecutorGone => write!(f, "Executor terminated before replying"),
        }
    }
}

impl std::error::Error for ComputeError {}

type Handler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Handler table shared by all executors, populated before the pool starts
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a computation under a stable tag
    pub fn register<F>(&mut self, tag: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(tag.into(), Arc::new(handler));
    }

    fn get(&self, tag: &str) -> Option<&Handler> {
        self.handlers.get(tag)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Task message sent to an executor
struct ComputeTask {
    handler_tag: String,
    payload: Value,
    reply: oneshot::Sender<Result<Value, ComputeError>>,
}

enum ExecutorMessage {
    Task(ComputeTask),
    Shutdown,
}

struct Executor {
    inbox: mpsc::UnboundedSender<ExecutorMessage>,
    busy: AtomicBool,
    thread: Option<JoinHandle<()>>,
}

/// Fixed pool of compute executors with round-robin dispatch
pub struct ComputePool {
    registry: Arc<HandlerRegistry>,
    executors: Vec<Executor>,
    /// Current index for the round-robin scan
    cursor: AtomicUsize,
}

impl ComputePool {
    /// Spawn `size` executors; returns once every executor has acknowledged
    /// startup
    pub fn initialize(size: usize, registry: HandlerRegistry) -> anyhow::Result<Self> {
        let registry = Arc::new(registry);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let mut executors = Vec::with_capacity(size);
        for id in 0..size {
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            let registry = Arc::clone(&registry);
            let ready = ready_tx.clone();

            let thread = std::thread::Builder::new()
                .name(format!("compute-{}", id))
                .spawn(move || executor_loop(id, registry, inbox_rx, ready))?;

            executors.push(Executor {
                inbox: inbox_tx,
                busy: AtomicBool::new(false),
                thread: Some(thread),
            });
        }
        drop(ready_tx);

        for _ in 0..size {
            ready_rx
                .recv()
                .map_err(|_| anyhow::anyhow!("compute executor exited during startup"))?;
        }

        info!(size, "Compute pool initialized");
        Ok(Self {
            registry,
            executors,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Number of live executors
    pub fn size(&self) -> usize {
        self.executors.len()
    }

    /// Run the named handler on the payload, in an executor when one is free
    /// and inline on the caller's thread otherwise
    pub async fn submit(&self, handler_tag: &str, payload: Value) -> Result<Value, ComputeError> {
        match self.acquire() {
            Some((idx, _busy)) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let task = ComputeTask {
                    handler_tag: handler_tag.to_string(),
                    payload,
                    reply: reply_tx,
                };
                if self.executors[idx]
                    .inbox
                    .send(ExecutorMessage::Task(task))
                    .is_err()
                {
                    return Err(ComputeError::ExecutorGone);
                }
                reply_rx.await.map_err(|_| ComputeError::ExecutorGone)?
            }
            None => {
                debug!(handler_tag, "Compute pool saturated, running inline");
                run_handler(&self.registry, handler_tag, payload)
            }
        }
    }

    /// Scan from the cursor for the first non-busy executor and mark it busy;
    /// the returned guard releases the flag on drop
    fn acquire(&self) -> Option<(usize, BusyGuard<'_>)> {
        let len = self.executors.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed);
        for offset in 0..len {
            let idx = (start + offset) % len;
            let flag = &self.executors[idx].busy;
            if flag
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.cursor.store((idx + 1) % len, Ordering::Relaxed);
                return Some((idx, BusyGuard { flag }));
            }
        }
        None
    }

    /// Tell every executor to terminate and clear the roster
    pub fn shutdown(&mut self) {
        for executor in &self.executors {
            let _ = executor.inbox.send(ExecutorMessage::Shutdown);
        }
        for executor in &mut self.executors {
            if let Some(thread) = executor.thread.take() {
                let _ = thread.join();
            }
        }
        self.executors.clear();
        info!("Compute pool shut down");
    }
}

/// Clears the executor's busy flag on drop, on every submit path
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn executor_loop(
    id: usize,
    registry: Arc<HandlerRegistry>,
    mut inbox: mpsc::UnboundedReceiver<ExecutorMessage>,
    ready: std::sync::mpsc::Sender<usize>,
) {
    let _ = ready.send(id);
    debug!(id, "Compute executor started");

    while let Some(message) = inbox.blocking_recv() {
        match message {
            ExecutorMessage::Shutdown => break,
            ExecutorMessage::Task(task) => {
                let result = run_handler(&registry, &task.handler_tag, task.payload);
                let _ = task.reply.send(result);
            }
        }
    }

    debug!(id, "Compute executor stopped");
}

fn run_handler(
    registry: &HandlerRegistry,
    tag: &str,
    payload: Value,
) -> Result<Value, ComputeError> {
    let handler = registry
        .get(tag)
        .ok_or_else(|| ComputeError::UnknownHandler(tag.to_string()))?;

    // A panicking handler must not take its executor down with it
    match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(ComputeError::Handler(message)),
        Err(_) => Err(ComputeError::Handler("handler panicked".to_string())),
    }
}
