//! Coordinated shutdown of the daemon's background tasks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
    grace_period: Duration,
}

impl ShutdownManager {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
            grace_period,
        }
    }

    /// Token that background tasks select on to stop.
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    /// Wait for Ctrl-C, then stop everything.
    pub async fn wait_for_signal(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        } else {
            tracing::info!("🛑 Shutdown signal received");
        }
        self.shutdown().await;
    }

    /// Cancel the token and wait for registered tasks, at most the grace period.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();

        let tasks = std::pin::pin!(async {
            for handle in self.task_handles.drain(..) {
                let _ = handle.await;
            }
        });
        match tokio::time::timeout(self.grace_period, tasks).await {
            Ok(_) => tracing::info!("✓ All tasks shut down gracefully"),
            Err(_) => tracing::warn!("⏱️  Shutdown timeout: some tasks did not complete"),
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
