//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Poll loop, command dispatch, and service wiring tests."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use xlab_common::{AppConfig, ExperimentId, TimeoutConfig};
use xlab_core::{
    CommandCode, CommandDispatcher, ControllerError, ControllerService, ExperimentState,
    PollScheduler,
};
use xlab_metrics::new_registry;
use xlab_queue::{ExperimentQueue, Lane, MemoryQueueStore, QueueEntry, QueueError, QueueStore};
use xlab_testharness::{adhoc_config, Harness, BENCHMARK_URI, SYSTEM_URI};

/// Memory store that can be switched into failing every call.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryQueueStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), QueueError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::Io(std::io::Error::other("store offline")));
        }
        Ok(())
    }
}

impl QueueStore for FlakyStore {
    fn put(&self, lane: Lane, entry: QueueEntry) -> Result<(), QueueError> {
        self.check()?;
        self.inner.put(lane, entry)
    }

    fn delete(&self, lane: Lane, id: &ExperimentId) -> Result<bool, QueueError> {
        self.check()?;
        self.inner.delete(lane, id)
    }

    fn get(&self, lane: Lane, id: &ExperimentId) -> Result<Option<QueueEntry>, QueueError> {
        self.check()?;
        self.inner.get(lane, id)
    }

    fn earliest(&self, lane: Lane, max_score: i64) -> Result<Option<QueueEntry>, QueueError> {
        self.check()?;
        self.inner.earliest(lane, max_score)
    }

    fn entries(&self, lane: Lane) -> Result<Vec<QueueEntry>, QueueError> {
        self.check()?;
        self.inner.entries(lane)
    }
}

fn scheduler(harness: &Harness) -> PollScheduler {
    PollScheduler::new(
        harness.controller.clone(),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
}

#[tokio::test]
async fn tick_admits_queued_experiment() {
    let harness = Harness::new();
    harness.enqueue(adhoc_config("c1")).unwrap();

    scheduler(&harness).run_tick().await;

    let current = harness.controller.current().unwrap();
    assert_eq!(current.config.id, ExperimentId::new("c1"));
    assert_eq!(current.state, ExperimentState::Init);
}

#[tokio::test]
async fn panicking_admission_is_finalized_by_the_tick() {
    let harness = Harness::new();
    harness.runtime.panic_on_pull();
    harness.enqueue(adhoc_config("c1")).unwrap();
    harness.enqueue(adhoc_config("c2")).unwrap();
    let scheduler = scheduler(&harness);

    scheduler.run_tick().await;

    assert!(harness.controller.current().is_none());
    let inserted = harness.results.inserted();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].0["experimentId"], json!("c1"));
    assert_eq!(inserted[0].0["errors"], json!(["UnexpectedError"]));
    assert!(harness
        .controller
        .queue()
        .get(&ExperimentId::new("c1"))
        .unwrap()
        .is_none());

    scheduler.run_tick().await;
    assert_eq!(
        harness.controller.current().unwrap().config.id,
        ExperimentId::new("c2")
    );
}

#[tokio::test]
async fn queue_failure_does_not_stop_the_scheduler() {
    let store = Arc::new(FlakyStore::default());
    let harness = Harness::builder()
        .queue(ExperimentQueue::new(store.clone()))
        .build();
    harness.enqueue(adhoc_config("c1")).unwrap();
    let scheduler = scheduler(&harness);

    store.failing.store(true, Ordering::SeqCst);
    scheduler.run_tick().await;
    assert!(harness.controller.current().is_none());
    assert!(harness.results.inserted().is_empty());

    store.failing.store(false, Ordering::SeqCst);
    scheduler.run_tick().await;
    assert!(harness.controller.current().is_some());
}

#[tokio::test(start_paused = true)]
async fn spawned_loop_waits_for_warmup_then_polls() {
    let harness = Harness::new();
    let (shutdown, _) = broadcast::channel(1);
    let task = scheduler(&harness).spawn(shutdown.subscribe());
    harness.enqueue(adhoc_config("c1")).unwrap();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(harness.controller.current().is_none());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(harness.controller.current().is_some());

    let benchmark = harness.benchmark_container().unwrap();
    harness.controller.report_container_exit(&benchmark, 0).await;
    harness.enqueue(adhoc_config("c2")).unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(
        harness.controller.current().unwrap().config.id,
        ExperimentId::new("c2")
    );

    shutdown.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_warmup_stops_the_loop() {
    let harness = Harness::new();
    let (shutdown, _) = broadcast::channel(1);
    let task = scheduler(&harness).spawn(shutdown.subscribe());
    harness.enqueue(adhoc_config("c1")).unwrap();

    shutdown.send(()).unwrap();
    task.await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(harness.controller.current().is_none());
}

#[tokio::test]
async fn dispatcher_drives_the_handshake() {
    let harness = Harness::new();
    harness.enqueue(adhoc_config("c1")).unwrap();
    harness.controller.try_admit_next().await.unwrap();
    let dispatcher = CommandDispatcher::new(harness.controller.clone());

    dispatcher
        .dispatch_raw(CommandCode::SystemReady.as_byte(), &[])
        .await
        .unwrap();
    dispatcher
        .dispatch_raw(CommandCode::BenchmarkReady.as_byte(), &[])
        .await
        .unwrap();
    assert_eq!(harness.bus.sent_with(CommandCode::StartBenchmark).len(), 1);

    dispatcher
        .dispatch_raw(CommandCode::TaskGenerationFinished.as_byte(), &[])
        .await
        .unwrap();
    assert_eq!(
        harness.controller.current().unwrap().state,
        ExperimentState::Evaluation
    );

    dispatcher
        .dispatch_raw(CommandCode::BenchmarkFinished.as_byte(), br#"{"recall": 0.5}"#)
        .await
        .unwrap();
    dispatcher
        .dispatch_raw(CommandCode::BenchmarkFinished.as_byte(), &[])
        .await
        .unwrap();
    assert!(matches!(
        dispatcher
            .dispatch_raw(CommandCode::BenchmarkFinished.as_byte(), b"not json")
            .await,
        Err(ControllerError::MalformedPayload(_))
    ));
    assert!(matches!(
        dispatcher.dispatch_raw(99, &[]).await,
        Err(ControllerError::UnknownCommand(99))
    ));

    let benchmark = harness.benchmark_container().unwrap();
    harness.controller.report_container_exit(&benchmark, 0).await;
    assert_eq!(harness.results.inserted()[0].0["recall"], json!(0.5));
}

fn service_config(log_dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.controller.warmup_delay = Duration::from_secs(1);
    config.controller.poll_interval = Duration::from_secs(1);
    config.logging.directory = log_dir.to_path_buf();
    config
}

#[tokio::test(start_paused = true)]
async fn service_admits_from_configured_queue() {
    let mut harness = Harness::new();
    let logs = tempfile::tempdir().unwrap();
    let config = service_config(&logs.path().join("logs"));
    let exits = harness.take_exits().unwrap();

    let handle = ControllerService::new(
        config,
        harness.collaborators.clone(),
        Some(new_registry()),
    )
    .start(exits)
    .unwrap();
    handle.controller().queue().add(adhoc_config("c1")).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let status = handle.controller().status(None).unwrap();
    assert_eq!(
        status.current.unwrap().experiment_id,
        ExperimentId::new("c1")
    );
    assert!(handle.metrics().is_some());
    assert!(logs.path().join("logs").is_dir());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn service_applies_configured_benchmark_timeouts() {
    let mut harness = Harness::new();
    let logs = tempfile::tempdir().unwrap();
    let mut config = service_config(logs.path());
    config.logging.enabled = false;
    config.timeouts.insert(
        BENCHMARK_URI.to_string(),
        TimeoutConfig {
            benchmark_timeout_ms: Some(5_000),
            challenge_timeout_ms: None,
        },
    );
    let exits = harness.take_exits().unwrap();

    let handle = ControllerService::new(config, harness.collaborators.clone(), None)
        .start(exits)
        .unwrap();
    let id = handle
        .controller()
        .queue()
        .submit(BENCHMARK_URI, SYSTEM_URI, json!({ "tasks": 10 }), None)
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let current = handle.controller().current().unwrap();
    assert_eq!(current.config.id, id);
    let window = current.abortion_deadline.unwrap() - current.started_at;
    assert!(window >= chrono::Duration::seconds(5));
    assert!(window < chrono::Duration::seconds(6));
    assert!(handle.metrics().is_none());

    handle.shutdown().await.unwrap();
}
