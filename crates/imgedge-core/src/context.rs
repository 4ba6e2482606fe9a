//! Execution context capabilities handed to the cache layer per request.
//!
//! - [`BackgroundTasks`] lets work continue after the response is returned.
//! - [`RequestContext`] collects breadcrumbs for trace correlation.
//!
//! Neither is required: a missing task scheduler degrades to awaiting the
//! work inline via [`TaskRunner::Inline`].

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// A scheduler for fire-and-forget work.
pub trait BackgroundTasks: Send + Sync {
    /// Keep `task` running after the current request completes.
    fn wait_until(&self, task: BoxFuture<'static, ()>);
}

/// Tokio-backed scheduler that tracks spawned tasks so a host can drain them.
#[derive(Clone, Default)]
pub struct TrackedTasks {
    tracker: TaskTracker,
}

impl TrackedTasks {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for every task spawned so far, then accept new tasks again.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl BackgroundTasks for TrackedTasks {
    fn wait_until(&self, task: BoxFuture<'static, ()>) {
        self.tracker.spawn(task);
    }
}

/// A single trace breadcrumb.
#[derive(Debug, Clone, Serialize)]
pub struct Breadcrumb {
    pub category: String,
    pub message: String,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Per-request trace state.
#[derive(Debug)]
pub struct RequestContext {
    request_id: Uuid,
    started: Instant,
    breadcrumbs: Mutex<Vec<Breadcrumb>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            started: Instant::now(),
            breadcrumbs: Mutex::new(Vec::new()),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn add_breadcrumb(
        &self,
        category: impl Into<String>,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        let crumb = Breadcrumb {
            category: category.into(),
            message: message.into(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            data,
        };
        self.breadcrumbs.lock().push(crumb);
    }

    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.breadcrumbs.lock().clone()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Capabilities available to a cache operation for one request.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    tasks: Option<Arc<dyn BackgroundTasks>>,
    request: Option<Arc<RequestContext>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(mut self, tasks: Arc<dyn BackgroundTasks>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_request_context(mut self, request: Arc<RequestContext>) -> Self {
        self.request = Some(request);
        self
    }

    pub fn tasks(&self) -> Option<&Arc<dyn BackgroundTasks>> {
        self.tasks.as_ref()
    }

    pub fn request_context(&self) -> Option<&Arc<RequestContext>> {
        self.request.as_ref()
    }

    /// Append a breadcrumb if a request context is attached.
    pub fn breadcrumb(&self, category: &str, message: &str, data: Option<serde_json::Value>) {
        if let Some(request) = &self.request {
            request.add_breadcrumb(category, message, data);
        }
    }
}

/// How deferred work is executed, chosen once from the available context.
#[derive(Clone)]
pub enum TaskRunner {
    /// Spawn and return immediately
    Background(Arc<dyn BackgroundTasks>),
    /// Await in place; adds latency to the current request
    Inline,
}

impl TaskRunner {
    pub fn select(ctx: Option<&ExecutionContext>) -> Self {
        match ctx.and_then(|c| c.tasks()) {
            Some(tasks) => TaskRunner::Background(Arc::clone(tasks)),
            None => TaskRunner::Inline,
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(self, TaskRunner::Background(_))
    }

    /// Run `task` according to the selected strategy.
    pub async fn run<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self {
            TaskRunner::Background(tasks) => {
                tracing::debug!(task = label, "scheduling background task");
                tasks.wait_until(task.boxed());
            }
            TaskRunner::Inline => {
                tracing::warn!(
                    task = label,
                    "no background task context, running inline (adds latency)"
                );
                task.await;
            }
        }
    }
}
