use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::balancer::{LoadBalancer, Worker};

/// Balancer shared between request paths and the health-check loop.
pub type SharedBalancer = Arc<Mutex<LoadBalancer>>;

/// Liveness check for one worker. How the check is done (TCP connect, HTTP
/// status page, driver ping) is up to the implementor.
pub trait HealthProbe: Send + Sync + 'static {
    fn probe(&self, worker: &Worker) -> impl Future<Output = bool> + Send;
}

/// Probe every worker once and apply the results, then run the failure decay
/// tick. Probes run concurrently without holding the balancer lock. A probe
/// that overruns `probe_timeout` counts as unhealthy; one that panics leaves
/// its worker untouched.
pub async fn run_health_check_round<P: HealthProbe>(
    balancer: &SharedBalancer,
    probe: &Arc<P>,
    probe_timeout: Duration,
) -> usize {
    let workers: Vec<Worker> = balancer.lock().await.workers().to_vec();

    let mut probes = JoinSet::new();
    for worker in workers {
        let probe = probe.clone();
        probes.spawn(async move {
            let healthy = tokio::time::timeout(probe_timeout, probe.probe(&worker))
                .await
                .unwrap_or(false);
            (worker.id, healthy)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => tracing::warn!(error = %e, "Health probe task failed"),
        }
    }

    let mut lb = balancer.lock().await;
    for (worker_id, healthy) in &results {
        lb.apply_probe(worker_id, *healthy);
    }
    let decayed = lb.decay_failures();
    let pruned = lb.prune_sessions();
    tracing::debug!(
        probed = results.len(),
        decayed,
        pruned,
        "Health check round complete"
    );
    results.len()
}

/// Run health-check rounds every `health_check_interval` until `token` is
/// cancelled.
pub fn spawn_health_checks<P: HealthProbe>(
    balancer: SharedBalancer,
    probe: Arc<P>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = balancer.lock().await.config().health_check_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("Health check loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    run_health_check_round(&balancer, &probe, interval).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::BalancerConfig;

    struct DownList(HashSet<String>);

    impl HealthProbe for DownList {
        async fn probe(&self, worker: &Worker) -> bool {
            !self.0.contains(&worker.id)
        }
    }

    struct Hangs;

    impl HealthProbe for Hangs {
        async fn probe(&self, _worker: &Worker) -> bool {
            tokio::time::sleep(Duration::from_secs(60)).await;
            true
        }
    }

    fn shared() -> SharedBalancer {
        let mut lb = LoadBalancer::new(BalancerConfig::default());
        lb.add_worker(Worker::new("a", "x", 1));
        lb.add_worker(Worker::new("b", "y", 1));
        Arc::new(Mutex::new(lb))
    }

    #[tokio::test]
    async fn round_applies_probe_results() {
        let balancer = shared();
        let probe = Arc::new(DownList(HashSet::from(["b".to_string()])));

        let probed = run_health_check_round(&balancer, &probe, Duration::from_secs(1)).await;
        assert_eq!(probed, 2);

        let lb = balancer.lock().await;
        assert!(lb.worker("a").unwrap().healthy);
        assert!(!lb.worker("b").unwrap().healthy);
    }

    #[tokio::test]
    async fn round_restores_recovered_worker() {
        let balancer = shared();
        balancer.lock().await.apply_probe("a", false);

        let probe = Arc::new(DownList(HashSet::new()));
        run_health_check_round(&balancer, &probe, Duration::from_secs(1)).await;

        assert!(balancer.lock().await.worker("a").unwrap().healthy);
    }

    #[tokio::test]
    async fn slow_probe_times_out_as_unhealthy() {
        let balancer = shared();
        let probe = Arc::new(Hangs);

        run_health_check_round(&balancer, &probe, Duration::from_millis(20)).await;

        let lb = balancer.lock().await;
        assert!(!lb.worker("a").unwrap().healthy);
        assert!(!lb.worker("b").unwrap().healthy);
    }

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let balancer = shared();
        let token = CancellationToken::new();
        let handle = spawn_health_checks(balancer, Arc::new(DownList(HashSet::new())), token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop")
            .expect("loop should not panic");
    }
}
