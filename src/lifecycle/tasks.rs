//! Periodic maintenance tasks with explicit stop.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::lifecycle::shutdown::Shutdown;

/// Handles to every spawned maintenance loop.
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown: Shutdown,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Run `job` every `period`, first after one full period, until shutdown.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            tracing::debug!(task = name, period_secs = period.as_secs_f64(), "Background task starting");
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        job().await;
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!(task = name, "Background task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.handles.push((name, handle));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn stop(self) {
        self.shutdown.trigger();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Background tasks stopped");
    }
}
