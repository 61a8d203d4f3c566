//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Fixed-delay poll loop driving experiment admission."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use xlab_common::ControllerConfig;

use crate::controller::{Admission, ExperimentController};

/// Periodically asks the controller to admit the next experiment.
#[derive(Clone)]
pub struct PollScheduler {
    controller: ExperimentController,
    warmup: Duration,
    interval: Duration,
}

impl PollScheduler {
    pub fn new(controller: ExperimentController, warmup: Duration, interval: Duration) -> Self {
        Self {
            controller,
            warmup,
            interval,
        }
    }

    pub fn from_config(controller: ExperimentController, config: &ControllerConfig) -> Self {
        Self::new(controller, config.warmup_delay, config.poll_interval)
    }

    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                warmup_secs = self.warmup.as_secs(),
                interval_secs = self.interval.as_secs(),
                "poll scheduler started"
            );
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("poll scheduler shutdown during warm-up");
                    return;
                }
                _ = tokio::time::sleep(self.warmup) => {}
            }
            loop {
                self.run_tick().await;
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("poll scheduler shutdown");
                        break;
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        })
    }

    /// One admission attempt. Any fault, including a panic inside the
    /// attempt, finalizes whatever occupies the slot so the loop keeps going.
    pub async fn run_tick(&self) {
        let controller = self.controller.clone();
        let attempt = tokio::spawn(async move { controller.try_admit_next().await });
        match attempt.await {
            Ok(Ok(Admission::Admitted(id))) => debug!(experiment_id = %id, "tick admitted experiment"),
            Ok(Ok(Admission::Rejected(id))) => debug!(experiment_id = %id, "tick rejected experiment"),
            Ok(Ok(outcome)) => debug!(?outcome, "tick finished without admission"),
            Ok(Err(err)) => {
                error!(error = %err, "admission attempt failed, finalizing the slot");
                self.controller.finalize_current().await;
            }
            Err(err) => {
                error!(error = %err, "admission attempt aborted, finalizing the slot");
                self.controller.finalize_current().await;
            }
        }
    }
}
