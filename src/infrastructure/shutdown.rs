use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[async_trait]
pub trait Shutdown: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
}

/// Owns the token every background loop watches.
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token handed to a background loop; cancelled with the manager.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits for Ctrl-C (or SIGTERM on unix) and then cancels every loop.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl-C"),
            _ = self.token.cancelled() => return,
            _ = terminate => info!("Received SIGTERM"),
        }

        self.token.cancel();
    }
}

#[async_trait]
impl Shutdown for ShutdownManager {
    async fn shutdown(&self) -> Result<()> {
        info!("Shutdown requested");
        self.token.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_issued_tokens() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());

        manager.shutdown().await.unwrap();

        assert!(token.is_cancelled());
        assert!(manager.is_shutting_down());
    }
}
