//! Graceful shutdown coordination.
//!
//! Components register in startup order; shutdown walks the levels in
//! reverse, running each level's components in parallel, all bounded by a
//! single coordinator budget. The whole pass runs at most once — repeated
//! calls return the first result.

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// A shutdown participant.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;
    async fn shutdown(&self);
}

/// A long-running loop bound to a stop signal. `shutdown` flips the signal
/// and waits for the task to finish.
pub struct LoopComponent {
    name: String,
    stop: watch::Sender<bool>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LoopComponent {
    /// Spawn `task(stop_rx)` and wrap it as a component.
    pub fn spawn<F, Fut>(name: &str, task: F) -> Arc<Self>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(task(stop_rx));
        Arc::new(Self {
            name: name.to_string(),
            stop,
            handle: tokio::sync::Mutex::new(Some(handle)),
        })
    }
}

#[async_trait]
impl Component for LoopComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(component = %self.name, error = %e, "loop task panicked");
            }
        }
    }
}

/// LIFO shutdown coordinator.
pub struct ShutdownCoordinator {
    levels: Mutex<Vec<Vec<Arc<dyn Component>>>>,
    timeout: Duration,
    outcome: OnceCell<i32>,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            levels: Mutex::new(Vec::new()),
            timeout,
            outcome: OnceCell::new(),
        }
    }

    /// Register one component as its own level.
    pub fn register(&self, component: Arc<dyn Component>) {
        self.levels.lock().push(vec![component]);
    }

    /// Register components that may shut down in parallel with each other.
    pub fn register_level(&self, components: Vec<Arc<dyn Component>>) {
        self.levels.lock().push(components);
    }

    /// Run the shutdown pass. Exit code 0 when every component returned
    /// within the budget, 1 on timeout. Idempotent.
    pub async fn shutdown(&self) -> i32 {
        *self
            .outcome
            .get_or_init(|| async { self.run_once().await })
            .await
    }

    async fn run_once(&self) -> i32 {
        let levels: Vec<Vec<Arc<dyn Component>>> = {
            let mut guard = self.levels.lock();
            guard.drain(..).collect()
        };
        let deadline = Instant::now() + self.timeout;

        for level in levels.into_iter().rev() {
            let names: Vec<String> = level.iter().map(|c| c.name().to_string()).collect();
            info!(components = ?names, "shutting down level");

            let remaining = deadline.saturating_duration_since(Instant::now());
            let tasks = level.into_iter().map(|component| async move {
                component.shutdown().await;
                info!(component = component.name(), "shutdown complete");
            });
            if tokio::time::timeout(remaining, join_all(tasks)).await.is_err() {
                warn!(components = ?names, "shutdown timed out");
                return 1;
            }
        }
        info!("shutdown complete");
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder {
        name: String,
        order: Arc<Mutex<Vec<String>>>,
        passes: Arc<AtomicU32>,
        delay: Duration,
    }

    #[async_trait]
    impl Component for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn shutdown(&self) {
            tokio::time::sleep(self.delay).await;
            self.passes.fetch_add(1, Ordering::SeqCst);
            self.order.lock().push(self.name.clone());
        }
    }

    fn recorder(
        name: &str,
        order: &Arc<Mutex<Vec<String>>>,
        passes: &Arc<AtomicU32>,
        delay: Duration,
    ) -> Arc<dyn Component> {
        Arc::new(Recorder {
            name: name.to_string(),
            order: order.clone(),
            passes: passes.clone(),
            delay,
        })
    }

    #[tokio::test]
    async fn reverse_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let passes = Arc::new(AtomicU32::new(0));
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(recorder("first", &order, &passes, Duration::ZERO));
        coordinator.register(recorder("second", &order, &passes, Duration::ZERO));
        coordinator.register(recorder("third", &order, &passes, Duration::ZERO));

        let code = coordinator.shutdown().await;
        assert_eq!(code, 0);
        assert_eq!(order.lock().as_slice(), ["third", "second", "first"]);
    }

    #[tokio::test]
    async fn repeated_shutdown_runs_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let passes = Arc::new(AtomicU32::new(0));
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(recorder("only", &order, &passes, Duration::ZERO));

        assert_eq!(coordinator.shutdown().await, 0);
        assert_eq!(coordinator.shutdown().await, 0);
        assert_eq!(coordinator.shutdown().await, 0);
        assert_eq!(passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_exit_code_one() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let passes = Arc::new(AtomicU32::new(0));
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        coordinator.register(recorder("slow", &order, &passes, Duration::from_secs(60)));

        assert_eq!(coordinator.shutdown().await, 1);
    }

    #[tokio::test]
    async fn level_members_run_in_parallel() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let passes = Arc::new(AtomicU32::new(0));
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register_level(vec![
            recorder("a", &order, &passes, Duration::from_millis(30)),
            recorder("b", &order, &passes, Duration::from_millis(30)),
        ]);

        let started = std::time::Instant::now();
        assert_eq!(coordinator.shutdown().await, 0);
        // Two 30ms components in parallel finish well under 60ms.
        assert!(started.elapsed() < Duration::from_millis(55));
        assert_eq!(passes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn loop_component_stops_its_task() {
        let component = LoopComponent::spawn("ticker", |mut stop| async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                    _ = stop.changed() => return,
                }
            }
        });
        component.shutdown().await;
        assert!(component.handle.lock().await.is_none());
    }
}
