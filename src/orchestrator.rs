//! Background task coordination and graceful shutdown
//!
//! Long-running loops (write buffer, scheduler) are spawned through the
//! coordinator with a child of its root cancellation token. Shutdown cancels
//! the root, then waits a bounded time for each loop to drain before aborting
//! the stragglers.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for each component by default
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Coordinates graceful shutdown of all engine components
pub struct ShutdownCoordinator {
    root: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            handles: Vec::new(),
            grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Token for work that should stop when the engine shuts down
    pub fn token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Spawn a component loop with its own child token
    pub fn spawn<F, Fut>(&mut self, name: &str, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(make(self.root.child_token()));
        self.add_handle(name, handle);
    }

    pub fn add_handle(&mut self, name: &str, handle: JoinHandle<()>) {
        tracing::debug!("Registered component {}", name);
        self.handles.push((name.to_string(), handle));
    }

    pub fn component_count(&self) -> usize {
        self.handles.len()
    }

    /// Cancel every component and wait for them in registration order
    pub async fn shutdown(&mut self) {
        tracing::info!(
            "Initiating graceful shutdown of {} components",
            self.handles.len()
        );
        self.root.cancel();

        for (name, mut handle) in self.handles.drain(..) {
            match tokio::time::timeout(self.grace, &mut handle).await {
                Ok(Ok(())) => tracing::debug!("{} stopped", name),
                Ok(Err(e)) => tracing::error!("{} ended abnormally: {}", name, e),
                Err(_) => {
                    tracing::warn!("{} did not stop within {:?}, aborting", name, self.grace);
                    handle.abort();
                }
            }
        }
        tracing::info!("All components shut down");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
