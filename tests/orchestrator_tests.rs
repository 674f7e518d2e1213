
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use testgrid::config::OrchestratorConfig;
use testgrid::executor::{ExecutionRequest, Executor, HeartbeatSender, SimulatedExecutor};
use testgrid::scheduler::{NodeStatus, SelectionStrategy, TaskResult, TaskStatus};
use testgrid::sharding::{DurationHistory, ShardStrategy, TestCase};
use testgrid::{Orchestrator, OrchestratorError};
use test_harness::{assert_eventually, descriptor, suite};

fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.dispatcher.heartbeat_interval_ms = 20;
    config.sharding.target_shard_duration_ms = 1_000;
    config.run_timeout_ms = Some(10_000);
    config
}

#[tokio::test]
async fn test_run_reports_per_shard() {
    let executor = SimulatedExecutor::new(0.001).fail_tests(["suite-3", "suite-7"]);
    let mut orchestrator = Orchestrator::new(fast_config(), executor).unwrap();
    for i in 0..3 {
        orchestrator
            .register_node(descriptor(&format!("node-{}", i), 2))
            .await
            .unwrap();
    }

    // 12 × 400ms against a 1s target: 5 shards.
    let tests = suite("suite", 12, 400);
    let report = orchestrator.run(&tests).await.unwrap();

    assert_eq!(report.shards.len(), 5);
    assert_eq!(report.passed, 10);
    assert_eq!(report.failed, 2);
    assert_eq!(report.skipped, 0);
    assert!(!report.succeeded());

    let planned: usize = report.shards.iter().map(|s| s.tests).sum();
    let run: usize = report.shards.iter().map(|s| s.tests_run).sum();
    assert_eq!(planned, 12);
    assert_eq!(run, 12);
    for shard in &report.shards {
        assert_eq!(shard.passed + shard.failed + shard.skipped, shard.tests);
        assert_eq!(shard.duration_ms, shard.tests as u64 * 400);
    }

    assert_eq!(report.dispatcher.tasks.completed, 12);
    assert_eq!(report.dispatcher.tasks.total_submitted, 12);
    assert_eq!(report.balancer.total_workers, 3);
    assert_eq!(report.balancer.total_requests, 12);
    assert_eq!(report.balancer.active_connections, 0);

    // Observed durations feed the history.
    assert_eq!(orchestrator.history().median("suite-0"), Some(400));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_history_shapes_the_plan() {
    let mut history = DurationHistory::new(10);
    history.record("heavy", 5_000);
    let mut config = fast_config();
    config.sharding.strategy = ShardStrategy::Duration;
    let orchestrator =
        Orchestrator::with_history(config, SimulatedExecutor::default(), history).unwrap();

    let mut tests = vec![TestCase::new("heavy")];
    tests.extend(suite("light", 4, 100));
    let shards = orchestrator.plan_with_shards(&tests, 2).unwrap();
    let heavy = shards.iter().find(|s| s.contains("heavy")).unwrap();
    assert_eq!(heavy.len(), 1);
    assert_eq!(heavy.estimated_duration_ms, 5_000);
}

/// Fails every third execution outright.
struct Unreliable {
    calls: AtomicUsize,
}

impl Executor for Unreliable {
    async fn execute(&self, request: ExecutionRequest) -> Result<TaskResult, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n % 3 == 2 {
            Err(format!("node {} unreachable", request.node_address))
        } else {
            Ok(TaskResult::passed(1))
        }
    }
}

#[tokio::test]
async fn test_executor_errors_fail_tasks() {
    let executor = Unreliable {
        calls: AtomicUsize::new(0),
    };
    let mut orchestrator = Orchestrator::new(fast_config(), executor).unwrap();
    orchestrator.register_node(descriptor("only", 1)).await.unwrap();

    let tests = suite("t", 6, 10);
    let shards = orchestrator.plan_with_shards(&tests, 2).unwrap();
    let report = orchestrator.run_shards(shards).await.unwrap();

    assert_eq!(report.passed, 4);
    assert_eq!(report.failed, 2);
    assert_eq!(report.dispatcher.tasks.failed, 2);
    assert_eq!(orchestrator.executor().calls.load(Ordering::SeqCst), 6);

    let failed = orchestrator
        .handle()
        .tasks(Some(TaskStatus::Failed))
        .await
        .unwrap();
    assert!(failed
        .iter()
        .all(|t| t.error.as_deref().is_some_and(|e| e.contains("unreachable"))));
    assert_eq!(report.balancer.total_failures, 2);
}

#[tokio::test]
async fn test_run_timeout_cancels_outstanding_tasks() {
    let mut config = fast_config();
    config.run_timeout_ms = Some(200);
    let executor = SimulatedExecutor::new(1.0);
    let mut orchestrator = Orchestrator::new(config, executor).unwrap();
    orchestrator.register_node(descriptor("slow", 1)).await.unwrap();

    let tests = suite("slow", 4, 60_000);
    let err = orchestrator.run(&tests).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Timeout(_)));

    let handle = orchestrator.handle().clone();
    assert_eventually(
        || {
            let handle = handle.clone();
            async move {
                match handle.stats().await {
                    Ok(stats) => stats.tasks.cancelled == 4 && stats.total_load == 0,
                    Err(_) => false,
                }
            }
        },
        Duration::from_secs(2),
        "timed out run should cancel every task and release node load",
    )
    .await;
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_silenced_node_work_moves_elsewhere() {
    let executor = SimulatedExecutor::new(1.0);
    let mut orchestrator = Orchestrator::new(fast_config(), executor).unwrap();
    let doomed = orchestrator.register_node(descriptor("doomed", 1)).await.unwrap();

    let handle = orchestrator.handle().clone();
    handle.start().await.unwrap();
    let slow = TestCase::new("slow").with_duration_ms(60_000);
    let task_id = handle.submit_task(slow, 0, None).await.unwrap();

    assert_eventually(
        || {
            let handle = handle.clone();
            async move {
                matches!(handle.task(task_id).await, Ok(Some(t)) if t.status == TaskStatus::Running)
            }
        },
        Duration::from_secs(2),
        "task should start on the first node",
    )
    .await;

    assert!(orchestrator.silence_node(doomed));
    let backup = orchestrator.register_node(descriptor("backup", 1)).await.unwrap();

    assert_eventually(
        || {
            let handle = handle.clone();
            async move {
                matches!(handle.task(task_id).await, Ok(Some(t)) if t.node_id == Some(backup))
            }
        },
        Duration::from_secs(2),
        "task should be reassigned to the backup node",
    )
    .await;

    let node = handle.node(doomed).await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Offline);
    let task = handle.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.requeue_count, 1);
    orchestrator.shutdown().await;
}

/// Ignores cancellation. The first run takes 400ms, later runs 2s.
struct Stubborn {
    calls: AtomicUsize,
}

impl Executor for Stubborn {
    async fn execute(&self, _request: ExecutionRequest) -> Result<TaskResult, String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(TaskResult::passed(111))
        } else {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(TaskResult::passed(222))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_run_does_not_settle_reassignment_on_recovered_node() {
    let executor = Stubborn {
        calls: AtomicUsize::new(0),
    };
    let mut orchestrator = Orchestrator::new(fast_config(), executor).unwrap();
    let node = orchestrator.register_node(descriptor("flaky", 1)).await.unwrap();

    let handle = orchestrator.handle().clone();
    handle.start().await.unwrap();
    let task_id = handle.submit_task(TestCase::new("t"), 0, None).await.unwrap();

    assert_eventually(
        || {
            let handle = handle.clone();
            async move {
                matches!(handle.task(task_id).await, Ok(Some(t)) if t.status == TaskStatus::Running)
            }
        },
        Duration::from_secs(2),
        "first attempt should start",
    )
    .await;

    assert!(orchestrator.silence_node(node));
    assert_eventually(
        || {
            let handle = handle.clone();
            async move { matches!(handle.task(task_id).await, Ok(Some(t)) if t.requeue_count == 1) }
        },
        Duration::from_secs(2),
        "task should be requeued off the silent node",
    )
    .await;

    // The node comes back and gets the same task again.
    let heartbeats = CancellationToken::new();
    HeartbeatSender::new(node, 20).spawn(handle.clone(), heartbeats.clone());
    assert_eventually(
        || {
            let handle = handle.clone();
            async move {
                matches!(
                    handle.task(task_id).await,
                    Ok(Some(t)) if t.status == TaskStatus::Running && t.node_id == Some(node)
                )
            }
        },
        Duration::from_secs(2),
        "second attempt should start on the recovered node",
    )
    .await;

    // Outlive the first run; its result must not land.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let task = handle.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.result.is_none());
    assert_eq!(handle.node(node).await.unwrap().unwrap().load, 1);

    assert_eventually(
        || {
            let handle = handle.clone();
            async move {
                matches!(handle.task(task_id).await, Ok(Some(t)) if t.status == TaskStatus::Completed)
            }
        },
        Duration::from_secs(5),
        "second attempt should complete",
    )
    .await;
    let task = handle.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.result.unwrap().duration_ms, 222);
    assert_eq!(handle.node(node).await.unwrap().unwrap().load, 0);
    assert_eq!(orchestrator.executor().calls.load(Ordering::SeqCst), 2);

    heartbeats.cancel();
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_register_and_unregister_mirror_balancer() {
    let mut orchestrator = Orchestrator::new(fast_config(), SimulatedExecutor::default()).unwrap();
    let a = orchestrator.register_node(descriptor("a", 4)).await.unwrap();
    let b = orchestrator.register_node(descriptor("b", 2)).await.unwrap();

    {
        let lb = orchestrator.balancer().lock().await;
        let ids: HashSet<_> = lb.workers().iter().map(|w| w.id.clone()).collect();
        assert_eq!(ids, HashSet::from([a.to_string(), b.to_string()]));
        let worker_a = lb.worker(&a.to_string()).unwrap();
        assert_eq!(worker_a.weight, 4);
        assert_eq!(worker_a.max_connections, 8);
    }

    assert!(orchestrator.unregister_node(a).await.unwrap());
    assert!(!orchestrator.unregister_node(a).await.unwrap());
    assert_eq!(orchestrator.balancer().lock().await.workers().len(), 1);
    assert_eq!(orchestrator.handle().nodes(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut config = OrchestratorConfig::default();
    config.sharding.max_shards = 0;
    assert!(matches!(
        Orchestrator::new(config, SimulatedExecutor::default()),
        Err(OrchestratorError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_config_from_partial_json() {
    let config = OrchestratorConfig::from_json(
        r#"{ "dispatcher": { "selection": "round-robin" }, "sharding": { "strategy": "file" } }"#,
    )
    .unwrap();
    assert_eq!(config.sharding.strategy, ShardStrategy::File);
    assert_eq!(config.dispatcher.selection, SelectionStrategy::RoundRobin);
    assert_eq!(config.dispatcher.heartbeat_interval_ms, 5_000);
    assert!(Orchestrator::new(config, SimulatedExecutor::default()).is_ok());
}
