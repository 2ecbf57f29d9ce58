//! Idle backend reaping

use crate::manager::LifecycleManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Background loop that stops backends left idle past a threshold
pub struct IdleReaper {
    manager: Arc<LifecycleManager>,
    period: Duration,
    idle_timeout: Duration,
}

impl IdleReaper {
    pub fn new(manager: Arc<LifecycleManager>, period: Duration, idle_timeout: Duration) -> Self {
        Self {
            manager,
            period,
            idle_timeout,
        }
    }

    /// Scan-and-stop loop. Never returns; cancelled by aborting its task
    /// at shutdown.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            period_secs = self.period.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "Idle reaper started"
        );

        loop {
            sleep(self.period).await;
            self.scan_once().await;
        }
    }

    /// One reap pass. Stops go through the manager's stop path so they
    /// stay serialized with any concurrent cold-start of the same model.
    pub async fn scan_once(&self) {
        for name in self.manager.idle_models(self.idle_timeout).await {
            tracing::info!(model = %name, "Stopping idle backend");
            crate::metrics::record_backend_reaped(&name);

            if let Err(e) = self.manager.stop(&name).await {
                tracing::error!(model = %name, error = %e, "Failed to stop idle backend");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ServerConfig};
    use crate::manager::mocks::{MockHealthProbe, MockProcessManager};
    use crate::manager::Timings;
    use tempfile::NamedTempFile;

    fn fast_timings() -> Timings {
        Timings {
            start_timeout: Duration::from_millis(200),
            spawn_grace: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            stop_grace: Duration::from_millis(50),
        }
    }

    fn manager_with_model(artifact: &NamedTempFile) -> Arc<LifecycleManager> {
        Arc::new(LifecycleManager::new(
            ServerConfig::default(),
            vec![ModelConfig {
                name: "alpha".to_string(),
                port: 9001,
                model_path: artifact.path().to_str().unwrap().to_string(),
                args: vec![],
            }],
            fast_timings(),
            Arc::new(MockProcessManager::new()),
            Arc::new(MockHealthProbe::healthy()),
        ))
    }

    #[tokio::test]
    async fn test_reaps_idle_backend() {
        let artifact = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        let manager = manager_with_model(&artifact);

        manager.touch("alpha").await;
        manager.start("alpha", Duration::from_secs(5)).await.unwrap();

        let reaper = IdleReaper::new(
            manager.clone(),
            Duration::from_millis(10),
            Duration::from_millis(30),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        reaper.scan_once().await;

        assert!(!manager.is_running("alpha"));
    }

    #[tokio::test]
    async fn test_recently_used_backend_survives_scan() {
        let artifact = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        let manager = manager_with_model(&artifact);

        manager.touch("alpha").await;
        manager.start("alpha", Duration::from_secs(5)).await.unwrap();

        let reaper = IdleReaper::new(
            manager.clone(),
            Duration::from_millis(10),
            Duration::from_secs(60),
        );

        manager.touch("alpha").await;
        reaper.scan_once().await;

        assert!(manager.is_running("alpha"));
    }

    #[tokio::test]
    async fn test_stopped_backend_not_rereaped() {
        let artifact = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        let manager = manager_with_model(&artifact);

        manager.touch("alpha").await;
        manager.start("alpha", Duration::from_secs(5)).await.unwrap();
        manager.stop("alpha").await.unwrap();

        let reaper = IdleReaper::new(manager.clone(), Duration::from_millis(10), Duration::ZERO);
        reaper.scan_once().await;

        assert!(!manager.is_running("alpha"));
    }
}
