//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Wiring and lifecycle of the controller runtime tasks."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use xlab_common::{init_tracing, AppConfig};
use xlab_metrics::{ControllerMetrics, SharedRegistry};
use xlab_queue::ExperimentQueue;

use crate::collaborators::{Collaborators, ContainerExit};
use crate::controller::{ControllerSettings, ExperimentController};
use crate::dispatch::CommandDispatcher;
use crate::scheduler::PollScheduler;
use crate::timeouts::ConfiguredTimeouts;

/// Name used for the log file prefix and the startup log line.
pub const SERVICE_NAME: &str = "xlab-controller";

/// Builds the controller from configuration and starts its background tasks.
///
/// When the configuration carries any `[timeouts.<benchmark>]` table, those
/// tables replace the resolver passed in through [`Collaborators`].
pub struct ControllerService {
    config: Arc<AppConfig>,
    collaborators: Collaborators,
    metrics_registry: Option<SharedRegistry>,
}

impl ControllerService {
    pub fn new(
        config: AppConfig,
        collaborators: Collaborators,
        metrics: Option<SharedRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            collaborators,
            metrics_registry: metrics,
        }
    }

    /// Install logging, open the queue, then spawn the poll scheduler and the exit listener.
    pub fn start(self, exits: mpsc::Receiver<ContainerExit>) -> Result<ServiceHandle> {
        init_tracing(SERVICE_NAME, &self.config.logging)
            .context("failed to initialise logging")?;
        let queue = ExperimentQueue::from_config(&self.config.queue)
            .context("failed to open experiment queue")?;
        let mut collaborators = self.collaborators;
        if !self.config.timeouts.is_empty() {
            debug!(benchmarks = self.config.timeouts.len(), "using configured benchmark timeouts");
            collaborators.timeouts = Arc::new(ConfiguredTimeouts::from_config(&self.config));
        }
        let metrics = match (&self.metrics_registry, self.config.metrics.enabled) {
            (Some(registry), true) => Some(ControllerMetrics::new(registry.clone())?),
            _ => None,
        };
        let controller = ExperimentController::new(
            queue,
            collaborators,
            ControllerSettings::from(&self.config.controller),
            metrics,
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let exit_task = controller.spawn_exit_listener(exits, shutdown_rx.resubscribe());
        let scheduler_task =
            PollScheduler::from_config(controller.clone(), &self.config.controller)
                .spawn(shutdown_rx);

        info!(
            service = SERVICE_NAME,
            queue_backend = ?self.config.queue.backend,
            bus_host = %self.config.controller.bus_host,
            "experiment controller started"
        );
        Ok(ServiceHandle {
            shutdown: shutdown_tx,
            controller,
            tasks: vec![scheduler_task, exit_task],
            metrics_registry: self.metrics_registry,
        })
    }
}

/// Handle to a running controller service.
pub struct ServiceHandle {
    shutdown: broadcast::Sender<()>,
    controller: ExperimentController,
    tasks: Vec<JoinHandle<()>>,
    metrics_registry: Option<SharedRegistry>,
}

impl ServiceHandle {
    pub fn controller(&self) -> &ExperimentController {
        &self.controller
    }

    /// Dispatcher feeding inbound bus commands into the controller.
    pub fn dispatcher(&self) -> CommandDispatcher {
        CommandDispatcher::new(self.controller.clone())
    }

    pub fn metrics(&self) -> Option<SharedRegistry> {
        self.metrics_registry.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "controller task join error");
            }
        }
        info!("experiment controller shutdown complete");
        Ok(())
    }
}
