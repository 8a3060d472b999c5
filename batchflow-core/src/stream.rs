//! In-order asynchronous work queues standing in for device streams
//!
//! A [`Stream`] executes submitted closures one after another on a
//! dedicated worker thread. Submission returns immediately with a
//! [`Completion`] that yields the closure's result once it has run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// In-order execution queue bound to one device
pub struct Stream {
    device_id: i32,
    sender: Option<Sender<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Start a stream worker for `device_id`
    pub fn new(device_id: i32) -> Result<Self> {
        let (sender, receiver) = unbounded::<Task>();
        let worker = std::thread::Builder::new()
            .name(format!("batchflow-stream-{device_id}"))
            .spawn(move || {
                for task in receiver {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(device_id, "stream task panicked");
                    }
                }
            })
            .map_err(|e| Error::Execution(format!("failed to start stream worker: {e}")))?;
        debug!(device_id, "stream started");
        Ok(Self {
            device_id,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Device this stream belongs to
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Enqueue `f`; it runs after everything submitted before it
    pub fn submit<T, F>(&self, f: F) -> Result<Completion<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let task: Task = Box::new(move || {
            // The receiver may already be gone if the result is unwanted
            let _ = tx.send(f());
        });
        self.sender
            .as_ref()
            .ok_or(Error::ShutDown)?
            .send(task)
            .map_err(|_| Error::Execution("stream worker terminated".into()))?;
        Ok(Completion {
            state: State::Pending(rx),
        })
    }

    /// Event signalled once all work submitted so far has finished
    pub fn record_event(&self) -> Result<Event> {
        let event = Event::new();
        let signal = event.clone();
        self.submit(move || signal.signal())?;
        Ok(event)
    }

    /// Block until all submitted work has finished
    pub fn synchronize(&self) -> Result<()> {
        self.submit(|| ())?.wait()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(device_id = self.device_id, "stream worker panicked");
            }
        }
    }
}

enum State<T> {
    Pending(Receiver<T>),
    Ready(T),
}

/// Handle to the result of stream work
pub struct Completion<T> {
    state: State<T>,
}

impl<T> Completion<T> {
    /// Completion that is already satisfied
    pub fn ready(value: T) -> Self {
        Self {
            state: State::Ready(value),
        }
    }

    /// Whether the result is available without blocking
    pub fn is_ready(&mut self) -> bool {
        let State::Pending(rx) = &self.state else {
            return true;
        };
        match rx.try_recv() {
            Ok(value) => {
                self.state = State::Ready(value);
                true
            }
            // A dropped sender makes `wait` return immediately with an error
            Err(TryRecvError::Disconnected) => true,
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Block until the result is available
    pub fn wait(self) -> Result<T> {
        match self.state {
            State::Ready(value) => Ok(value),
            State::Pending(rx) => rx
                .recv()
                .map_err(|_| Error::Execution("stream task did not complete".into())),
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Pending(_) => "pending",
            State::Ready(_) => "ready",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}

/// One-shot signal shared between a producer and waiters
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Event {
    /// Unsignalled event
    pub fn new() -> Self {
        Self::default()
    }

    /// Event that is already signalled
    pub fn signalled() -> Self {
        let event = Self::new();
        event.signal();
        event
    }

    /// Mark the event as done and wake all waiters
    pub fn signal(&self) {
        let (done, cond) = &*self.inner;
        *done.lock() = true;
        cond.notify_all();
    }

    /// Whether the event has been signalled
    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until the event is signalled
    pub fn wait(&self) {
        let (done, cond) = &*self.inner;
        let mut done = done.lock();
        while !*done {
            cond.wait(&mut done);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_run_in_order() {
        let stream = Stream::new(0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let completions: Vec<_> = (0..16)
            .map(|i| {
                let log = Arc::clone(&log);
                stream.submit(move || log.lock().push(i)).unwrap()
            })
            .collect();
        for completion in completions {
            completion.wait().unwrap();
        }
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_synchronize_waits_for_prior_work() {
        let stream = Stream::new(0).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let _ = stream.submit(move || counter.fetch_add(1, Ordering::SeqCst)).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_panicking_task_reports_error() {
        let stream = Stream::new(0).unwrap();
        let failed = stream.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert!(failed.wait().is_err());
        // The stream keeps working afterwards
        assert_eq!(stream.submit(|| 5).unwrap().wait().unwrap(), 5);
    }

    #[test]
    fn test_event_signalled_after_work() {
        let stream = Stream::new(0).unwrap();
        let event = stream.record_event().unwrap();
        event.wait();
        assert!(event.is_set());
        assert!(Event::signalled().is_set());
        let mut done = Completion::ready(1);
        assert!(done.is_ready());
    }
}
