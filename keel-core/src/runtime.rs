//! Task runtime: the thread pool and channel fabric the VM delegates to
//!
//! The interpreter itself stays single-threaded; everything parallel goes
//! through this narrow surface: submit a job, await its result, create and
//! use channels. Nothing here assumes a thread count or scheduling order
//! beyond "every submitted job eventually completes or reports an error".

use crate::value::{ErrorValue, Value};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

/// Handle to a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

/// Handle to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel:{}", self.0)
    }
}

/// What a joiner sees: the task body's value, or the error that escaped it.
pub type TaskResult = Result<Value, ErrorValue>;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

struct ChannelEntry {
    sender: Option<Sender<Value>>,
    receiver: Receiver<Value>,
}

/// Worker thread pool plus channel registry.
pub struct TaskRuntime {
    workers: Vec<Worker>,
    job_sender: Option<Sender<Job>>,
    tasks: Mutex<FxHashMap<TaskId, Receiver<TaskResult>>>,
    channels: Mutex<FxHashMap<ChannelId, ChannelEntry>>,
    counter: AtomicU64,
}

impl TaskRuntime {
    /// A runtime sized to the machine's core count.
    pub fn new() -> Self {
        Self::with_threads(num_cpus::get())
    }

    pub fn with_threads(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let (job_sender, job_receiver) = unbounded::<Job>();
        let job_receiver = Arc::new(Mutex::new(job_receiver));

        let mut workers = Vec::with_capacity(num_threads);
        for id in 0..num_threads {
            let receiver = Arc::clone(&job_receiver);
            let thread = thread::Builder::new()
                .name(format!("keel-worker-{}", id))
                .spawn(move || loop {
                    let job = {
                        let receiver = receiver.lock();
                        receiver.recv()
                    };
                    match job {
                        Ok(job) => {
                            trace!(worker = id, "running job");
                            // A panicking job only loses its own result; the
                            // worker keeps serving the queue.
                            let _ = catch_unwind(AssertUnwindSafe(job));
                        }
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(Worker {
                id,
                thread: Some(thread),
            });
        }

        Self {
            workers,
            job_sender: Some(job_sender),
            tasks: Mutex::new(FxHashMap::default()),
            channels: Mutex::new(FxHashMap::default()),
            counter: AtomicU64::new(1),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Submit a job for execution; the handle is redeemed with
    /// [`TaskRuntime::await_result`].
    pub fn submit<F>(&self, job: F) -> TaskId
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        let id = TaskId(self.next_id());
        let (result_sender, result_receiver) = bounded::<TaskResult>(1);
        self.tasks.lock().insert(id, result_receiver);

        let wrapped: Job = Box::new(move || {
            let result = job();
            // The joiner may already be gone; that is not an error here
            let _ = result_sender.send(result);
        });

        debug!(%id, "submitting task");
        self.job_sender
            .as_ref()
            .expect("runtime already shut down")
            .send(wrapped)
            .expect("worker pool disconnected");
        id
    }

    /// Block until the task completes. Each handle is redeemable once.
    pub fn await_result(&self, id: TaskId) -> TaskResult {
        let receiver = match self.tasks.lock().remove(&id) {
            Some(receiver) => receiver,
            None => {
                return Err(ErrorValue::new(
                    "TaskError",
                    format!("unknown or already awaited {}", id),
                    0,
                ))
            }
        };
        match receiver.recv() {
            Ok(result) => {
                debug!(%id, ok = result.is_ok(), "task joined");
                result
            }
            Err(_) => Err(ErrorValue::new(
                "TaskError",
                format!("{} terminated without a result", id),
                0,
            )),
        }
    }

    /// Create an unbounded channel.
    pub fn create_channel(&self) -> ChannelId {
        let id = ChannelId(self.next_id());
        let (sender, receiver) = unbounded();
        self.channels.lock().insert(
            id,
            ChannelEntry {
                sender: Some(sender),
                receiver,
            },
        );
        id
    }

    pub fn send(&self, id: ChannelId, value: Value) -> Result<(), ErrorValue> {
        let sender = {
            let channels = self.channels.lock();
            let entry = channels
                .get(&id)
                .ok_or_else(|| ErrorValue::new("ChannelError", format!("unknown {}", id), 0))?;
            entry
                .sender
                .clone()
                .ok_or_else(|| ErrorValue::new("ChannelClosed", format!("{} is closed", id), 0))?
        };
        sender
            .send(value)
            .map_err(|_| ErrorValue::new("ChannelClosed", format!("{} is closed", id), 0))
    }

    /// Blocking receive. Fails once the channel is closed and drained.
    pub fn recv(&self, id: ChannelId) -> Result<Value, ErrorValue> {
        let receiver = {
            let channels = self.channels.lock();
            let entry = channels
                .get(&id)
                .ok_or_else(|| ErrorValue::new("ChannelError", format!("unknown {}", id), 0))?;
            entry.receiver.clone()
        };
        receiver
            .recv()
            .map_err(|_| ErrorValue::new("ChannelClosed", format!("{} is closed", id), 0))
    }

    /// Non-blocking receive; `Ok(None)` when the channel is currently empty.
    pub fn try_recv(&self, id: ChannelId) -> Result<Option<Value>, ErrorValue> {
        let receiver = {
            let channels = self.channels.lock();
            let entry = channels
                .get(&id)
                .ok_or_else(|| ErrorValue::new("ChannelError", format!("unknown {}", id), 0))?;
            entry.receiver.clone()
        };
        match receiver.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ErrorValue::new(
                "ChannelClosed",
                format!("{} is closed", id),
                0,
            )),
        }
    }

    /// Close the sending side; receivers drain what was already sent.
    pub fn close_channel(&self, id: ChannelId) -> Result<(), ErrorValue> {
        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(&id)
            .ok_or_else(|| ErrorValue::new("ChannelError", format!("unknown {}", id), 0))?;
        entry.sender = None;
        Ok(())
    }
}

impl Default for TaskRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRuntime {
    fn drop(&mut self) {
        // Disconnect the queue so idle workers wake up and exit
        self.job_sender.take();
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                trace!(worker = worker.id, "joining worker");
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
