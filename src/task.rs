//! Task - the unit of work flowing through a pipeline
//!
//! A task is created by the host front-end (one per request) and pulled by
//! pipeline workers from a [`TaskSource`]. The runtime treats the payload as
//! opaque; plugins communicate through the typed value bag and the request
//! surface (`real_ip`, `header`) consumed by the load balancer.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// Values carried by a task are type-erased and shared.
pub type TaskValue = Arc<dyn Any + Send + Sync>;

/// A single unit of work.
///
/// Carries the capability surface the HTTP front-end exposes to the core:
/// the client real IP and request headers. Everything else lives in the
/// value bag.
#[derive(Default)]
pub struct Task {
    client_ip: String,
    headers: HashMap<String, String>,
    values: HashMap<String, TaskValue>,
}

impl Task {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client real IP (builder style).
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = ip.into();
        self
    }

    /// Set a request header (builder style).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// The client real IP, empty if the front-end did not supply one.
    pub fn real_ip(&self) -> &str {
        &self.client_ip
    }

    /// A request header value, if present.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    /// Store a value under `key`, returning the previous value if any.
    pub fn set_value(&mut self, key: impl Into<String>, value: TaskValue) -> Option<TaskValue> {
        self.values.insert(key.into(), value)
    }

    /// Fetch a value previously stored by an upstream plugin.
    pub fn value(&self, key: &str) -> Option<&TaskValue> {
        self.values.get(key)
    }

    /// Remove a value, returning it if present.
    pub fn take_value(&mut self, key: &str) -> Option<TaskValue> {
        self.values.remove(key)
    }
}

/// Source of tasks for a pipeline, supplied by the host.
///
/// Workers pull tasks until the source returns `None` (drained) or the
/// pipeline is stopped.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn next_task(&self) -> Option<Task>;
}

/// Channel-backed task source.
///
/// Multiple workers share the receiving end; the host pushes through the
/// [`QueueSourceHandle`]. Dropping all handles drains the source.
pub struct QueueSource {
    rx: Mutex<mpsc::Receiver<Task>>,
}

/// Sending side of a [`QueueSource`].
#[derive(Clone)]
pub struct QueueSourceHandle {
    tx: mpsc::Sender<Task>,
}

impl QueueSource {
    /// Create a bounded queue source and its push handle.
    pub fn new(capacity: usize) -> (Arc<Self>, QueueSourceHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self { rx: Mutex::new(rx) }),
            QueueSourceHandle { tx },
        )
    }
}

impl QueueSourceHandle {
    /// Push a task, waiting for queue capacity.
    pub async fn push(&self, task: Task) -> bool {
        self.tx.send(task).await.is_ok()
    }
}

#[async_trait]
impl TaskSource for QueueSource {
    async fn next_task(&self) -> Option<Task> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_headers_and_ip() {
        let task = Task::new()
            .with_client_ip("10.0.0.1")
            .with_header("X-User", "alice");

        assert_eq!(task.real_ip(), "10.0.0.1");
        assert_eq!(task.header("X-User"), Some("alice"));
        assert_eq!(task.header("X-Missing"), None);
    }

    #[test]
    fn test_task_value_bag() {
        let mut task = Task::new();
        assert!(task.set_value("n", Arc::new(42u64)).is_none());

        let v = task.value("n").unwrap().clone();
        assert_eq!(*v.downcast::<u64>().unwrap(), 42);

        assert!(task.take_value("n").is_some());
        assert!(task.value("n").is_none());
    }

    #[tokio::test]
    async fn test_queue_source_drains_on_handle_drop() {
        let (source, handle) = QueueSource::new(4);
        assert!(handle.push(Task::new()).await);
        drop(handle);

        assert!(source.next_task().await.is_some());
        assert!(source.next_task().await.is_none());
    }
}
