//! Serializers
//!
//! A [`Serializer`] is a named single-consumer task queue. Tasks pushed onto
//! it run strictly in submission order, one at a time, on a dedicated tokio
//! task. Different serializers run concurrently on the shared runtime.
//!
//! Sessions and subscriptions each own one serializer and push every
//! operation that mutates dialog state onto it.
//!
//! [`Serializer::suspend`] parks the queue behind a blocker task and hands
//! the caller a [`Suspension`]. While it is held nothing else on the
//! serializer runs; queued work resumes in order once it is released.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::types::{Error, Result};

type Task = BoxFuture<'static, ()>;

static NEXT_SERIALIZER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_SERIALIZER: u64;
}

struct SerializerInner {
    id: u64,
    name: String,
    tx: mpsc::UnboundedSender<Task>,
    cancel: CancellationToken,
    suspended: AtomicBool,
}

/// Handle to a single-consumer ordered task queue. Cloning shares the queue.
#[derive(Clone)]
pub struct Serializer {
    inner: Arc<SerializerInner>,
}

impl Serializer {
    /// Create a serializer and start its worker. Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let id = NEXT_SERIALIZER_ID.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let cancel = CancellationToken::new();

        let worker_cancel = cancel.clone();
        let worker_name = name.clone();
        tokio::spawn(CURRENT_SERIALIZER.scope(id, async move {
            loop {
                tokio::select! {
                    biased;
                    _ = worker_cancel.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => task.await,
                        None => break,
                    },
                }
            }
            debug!("Serializer {} stopped", worker_name);
        }));

        debug!("Created serializer {}", name);
        Serializer {
            inner: Arc::new(SerializerInner {
                id,
                name,
                tx,
                cancel,
                suspended: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True when called from a task running on this serializer
    pub fn is_current(&self) -> bool {
        CURRENT_SERIALIZER
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false)
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Queue a task. It runs after everything already queued.
    pub fn push_task<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::SerializerShutdown(self.inner.name.clone()));
        }
        trace!("Queueing task on serializer {}", self.inner.name);
        self.inner
            .tx
            .send(Box::pin(task))
            .map_err(|_| Error::SerializerShutdown(self.inner.name.clone()))
    }

    /// Run a task on the serializer and wait for its output.
    ///
    /// When called from a task already running on this serializer the task
    /// runs inline instead of being queued behind the caller.
    pub async fn push_task_synchronous<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            return Ok(task.await);
        }
        let (tx, rx) = oneshot::channel();
        self.push_task(async move {
            let _ = tx.send(task.await);
        })?;
        rx.await
            .map_err(|_| Error::TaskDropped(self.inner.name.clone()))
    }

    /// Wait until the serializer is idle and hold it.
    ///
    /// Nothing else runs on the serializer until the returned [`Suspension`]
    /// is released or dropped. Must not be awaited from one of the
    /// serializer's own tasks.
    pub async fn suspend(&self) -> Result<Suspension> {
        if self.is_current() {
            return Err(Error::SuspendFromSelf(self.inner.name.clone()));
        }
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        self.push_task(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        })?;
        started_rx
            .await
            .map_err(|_| Error::TaskDropped(self.inner.name.clone()))?;

        self.inner.suspended.store(true, Ordering::SeqCst);
        debug!("Suspended serializer {}", self.inner.name);
        Ok(Suspension {
            serializer: self.clone(),
            release: Some(release_tx),
        })
    }

    /// Stop the worker. Tasks still queued are dropped without running.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("name", &self.inner.name)
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

impl Drop for SerializerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Exclusive hold on a suspended serializer
pub struct Suspension {
    serializer: Serializer,
    release: Option<oneshot::Sender<()>>,
}

impl Suspension {
    /// Let the serializer run queued work again
    pub fn release(mut self) {
        self.unsuspend();
    }

    fn unsuspend(&mut self) {
        if let Some(release) = self.release.take() {
            self.serializer.inner.suspended.store(false, Ordering::SeqCst);
            let _ = release.send(());
            debug!("Unsuspended serializer {}", self.serializer.inner.name);
        }
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        self.unsuspend();
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("serializer", &self.serializer.inner.name)
            .finish()
    }
}
