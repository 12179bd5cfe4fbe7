//! Spawning task drivers onto a Tokio runtime.

use std::future::Future;
use std::sync::Arc;

use crate::core::SchedulerError;

/// Something that can run a detached future to completion.
///
/// Task drivers are handed to a `Spawn` when a task is armed.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based spawner that runs task drivers on a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioSpawner {
    handle: Arc<tokio::runtime::Handle>,
}

impl TokioSpawner {
    /// Create a new `TokioSpawner` from a tokio runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Capture the runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// `SchedulerError::RuntimeUnavailable` when called outside a Tokio runtime.
    pub fn current() -> Result<Self, SchedulerError> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|_| SchedulerError::RuntimeUnavailable)
    }

    /// The underlying runtime handle.
    #[must_use]
    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }
}

impl Spawn for TokioSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }
}
