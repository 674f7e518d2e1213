use std::collections::HashSet;
use std::time::Duration;

use crate::executor::{ExecutionRequest, Executor};
use crate::scheduler::TaskResult;

const DEFAULT_DURATION_MS: u64 = 1_000;

/// Pretends to run tests by sleeping for their known duration.
///
/// `time_scale` shrinks or stretches every sleep; tests listed with
/// [`fail_tests`](Self::fail_tests) report a failed verdict.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    time_scale: f64,
    default_duration_ms: u64,
    failing: HashSet<String>,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl SimulatedExecutor {
    pub fn new(time_scale: f64) -> Self {
        Self {
            time_scale: time_scale.max(0.0),
            default_duration_ms: DEFAULT_DURATION_MS,
            failing: HashSet::new(),
        }
    }

    pub fn with_default_duration_ms(mut self, duration_ms: u64) -> Self {
        self.default_duration_ms = duration_ms;
        self
    }

    pub fn fail_tests<I, S>(mut self, test_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing.extend(test_ids.into_iter().map(Into::into));
        self
    }

    fn sleep_for(&self, duration_ms: u64) -> Duration {
        Duration::from_secs_f64(duration_ms as f64 * self.time_scale / 1000.0)
    }
}

impl Executor for SimulatedExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<TaskResult, String> {
        let duration_ms = request.test.duration_ms.unwrap_or(self.default_duration_ms);

        tracing::debug!(
            task_id = %request.task_id,
            node_id = request.node_id,
            test = %request.test.id,
            duration_ms,
            "Simulating test"
        );

        tokio::select! {
            _ = request.cancel.cancelled() => {
                return Ok(TaskResult::skipped());
            }
            _ = tokio::time::sleep(self.sleep_for(duration_ms)) => {}
        }

        if self.failing.contains(&request.test.id) {
            Ok(TaskResult::failed(duration_ms, "simulated failure"))
        } else {
            Ok(TaskResult::passed(duration_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TestOutcome;
    use crate::sharding::TestCase;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn request(test: TestCase) -> ExecutionRequest {
        ExecutionRequest {
            task_id: Uuid::new_v4(),
            test,
            node_id: 1,
            node_address: "127.0.0.1:4444".to_string(),
            attempt: 0,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_scaled_duration() {
        let executor = SimulatedExecutor::new(0.5);
        let started = Instant::now();
        let result = executor
            .execute(request(TestCase::new("a").with_duration_ms(2_000)))
            .await
            .unwrap();

        assert_eq!(result.outcome, TestOutcome::Passed);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_000));
        assert!(elapsed < Duration::from_millis(1_100));
    }

    #[tokio::test(start_paused = true)]
    async fn listed_tests_fail() {
        let executor = SimulatedExecutor::new(0.0).fail_tests(["flaky"]);
        let result = executor
            .execute(request(TestCase::new("flaky")))
            .await
            .unwrap();
        assert_eq!(result.outcome, TestOutcome::Failed);
        assert_eq!(result.message.as_deref(), Some("simulated failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_skips() {
        let executor = SimulatedExecutor::new(1.0);
        let req = request(TestCase::new("slow").with_duration_ms(60_000));
        let cancel = req.cancel.clone();

        let run = tokio::spawn(async move { executor.execute(req).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.outcome, TestOutcome::Skipped);
    }
}
