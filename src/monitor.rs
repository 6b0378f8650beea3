//! Background housekeeping for an [`Engine`].
//!
//! Four independent loops run on tokio intervals:
//! - conflict threshold checks
//! - history purging
//! - throughput refresh
//! - reaping of locks held past their timeout

use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::config::MonitoringConfig;
use crate::engine::Engine;

/// Spawns the housekeeping loops for one engine.
pub struct Monitor {
    engine: Engine,
    config: MonitoringConfig,
}

impl Monitor {
    pub fn new(engine: Engine, config: MonitoringConfig) -> Self {
        Self { engine, config }
    }

    /// Shorthand for `Monitor::new(engine, config).run()`.
    pub fn spawn(engine: Engine, config: MonitoringConfig) -> MonitorHandle {
        Self::new(engine, config).run()
    }

    /// Spawns every loop on the current tokio runtime.
    pub fn run(self) -> MonitorHandle {
        info!(
            "Starting engine monitor (conflicts {:?}, purge {:?}, throughput {:?}, locks {:?})",
            self.config.conflict_check_interval,
            self.config.purge_interval,
            self.config.throughput_interval,
            self.config.lock_reap_interval
        );

        let tasks = vec![
            every(
                self.config.conflict_check_interval,
                self.engine.clone(),
                |engine| {
                    let breaches = engine.check_conflict_thresholds();
                    if !breaches.is_empty() {
                        debug!("{} resource classes over their conflict threshold", breaches.len());
                    }
                },
            ),
            every(self.config.purge_interval, self.engine.clone(), |engine| {
                engine.purge_history();
            }),
            every(self.config.throughput_interval, self.engine.clone(), |engine| {
                engine.refresh_throughput();
            }),
            every(self.config.lock_reap_interval, self.engine, |engine| {
                engine.reap_expired_locks();
            }),
        ];

        MonitorHandle { tasks }
    }
}

fn every(period: Duration, engine: Engine, job: fn(&Engine)) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            job(&engine);
        }
    })
}

/// Keeps the monitor's loops alive. Dropping it without calling
/// [`MonitorHandle::shutdown`] leaves them running.
pub struct MonitorHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stops every loop and waits for them to finish.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Engine monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}
