//! Replica pool: reconciles the running replicas with a desired count.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tilescale_core::{HealthStatus, epoch_secs};

use crate::error::{PoolError, PoolResult};
use crate::health::{HealthGate, HealthTracker, ProbeResult};
use crate::orchestrator::{Orchestrator, Replica};

/// One replica and its health history.
struct ReplicaSlot {
    replica: Replica,
    tracker: HealthTracker,
    launched_at: u64,
}

/// Read-only view of a replica for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaView {
    pub id: String,
    pub address: String,
    pub health: HealthStatus,
    pub ready: bool,
    pub launched_at: u64,
}

/// Outcome of one health poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Replicas that passed the gate for the first time this poll.
    pub admitted: u32,
    /// Replicas demoted and replaced this poll.
    pub replaced: u32,
    /// Ready replicas after the poll.
    pub ready: u32,
    /// Replicas launched but not yet admitted.
    pub pending: u32,
}

/// The set of worker replicas for one service.
///
/// Owned by exactly one control loop; nothing here is shared.
pub struct ReplicaPool {
    min_count: u32,
    max_count: u32,
    desired: u32,
    /// Replicas in launch order.
    slots: Vec<ReplicaSlot>,
    orchestrator: Arc<dyn Orchestrator>,
    gate: Arc<dyn HealthGate>,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
}

impl ReplicaPool {
    /// Create an empty pool. Call `set_desired_count(min)` to start it.
    pub fn new(
        min_count: u32,
        max_count: u32,
        orchestrator: Arc<dyn Orchestrator>,
        gate: Arc<dyn HealthGate>,
    ) -> Self {
        Self {
            min_count,
            max_count,
            desired: 0,
            slots: Vec::new(),
            orchestrator,
            gate,
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }

    /// Override the health gate thresholds (defaults: 3 failures, 1 success).
    pub fn with_thresholds(mut self, unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        self.unhealthy_threshold = unhealthy_threshold;
        self.healthy_threshold = healthy_threshold;
        self
    }

    /// Replicas admitted by the health gate.
    pub fn current_count(&self) -> u32 {
        self.slots.iter().filter(|s| s.tracker.is_ready()).count() as u32
    }

    /// Replicas launched, ready or not.
    pub fn total_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Last target accepted by `set_desired_count`.
    pub fn desired_count(&self) -> u32 {
        self.desired
    }

    pub fn min_count(&self) -> u32 {
        self.min_count
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn replicas(&self) -> Vec<ReplicaView> {
        self.slots
            .iter()
            .map(|s| ReplicaView {
                id: s.replica.id.clone(),
                address: s.replica.address.clone(),
                health: s.tracker.status(),
                ready: s.tracker.is_ready(),
                launched_at: s.launched_at,
            })
            .collect()
    }

    /// Accept a new desired count and converge the replica set toward it.
    ///
    /// Targets outside `[min_count, max_count]` are rejected without
    /// touching any replica. If the orchestrator fails part-way, the target
    /// is kept and later health polls continue converging toward it.
    pub async fn set_desired_count(&mut self, n: u32) -> PoolResult<()> {
        if n < self.min_count || n > self.max_count {
            return Err(PoolError::OutOfBounds {
                requested: n,
                min: self.min_count,
                max: self.max_count,
            });
        }

        if n != self.desired {
            info!(from = self.desired, to = n, "desired replica count changed");
        }
        self.desired = n;
        self.reconcile().await
    }

    /// Launch or terminate replicas until the total matches the desired count.
    async fn reconcile(&mut self) -> PoolResult<()> {
        let total = self.total_count();

        if total < self.desired {
            for _ in total..self.desired {
                let replica = self
                    .orchestrator
                    .launch()
                    .await
                    .map_err(|e| PoolError::Unreachable(e.to_string()))?;
                debug!(id = %replica.id, address = %replica.address, "replica launched");
                self.slots.push(ReplicaSlot {
                    replica,
                    tracker: HealthTracker::new(self.unhealthy_threshold, self.healthy_threshold),
                    launched_at: epoch_secs(),
                });
            }
        } else if total > self.desired {
            for _ in self.desired..total {
                let Some(idx) = self.next_victim() else {
                    break;
                };
                let id = self.slots[idx].replica.id.clone();
                self.orchestrator
                    .terminate(&id)
                    .await
                    .map_err(|e| PoolError::Unreachable(e.to_string()))?;
                self.slots.remove(idx);
                debug!(%id, "replica terminated");
            }
        }

        Ok(())
    }

    /// Pick the replica to drop on scale-in: newest not-ready first,
    /// then newest ready.
    fn next_victim(&self) -> Option<usize> {
        self.slots
            .iter()
            .rposition(|s| !s.tracker.is_ready())
            .or_else(|| self.slots.len().checked_sub(1))
    }

    /// Probe every replica, admit or demote, and replace demoted ones.
    pub async fn poll_health(&mut self) -> PoolResult<HealthReport> {
        let mut probes = JoinSet::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            let gate = Arc::clone(&self.gate);
            let replica = slot.replica.clone();
            probes.spawn(async move { (idx, gate.probe(&replica).await) });
        }

        let mut results = Vec::with_capacity(self.slots.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "health probe task failed"),
            }
        }

        let mut report = HealthReport::default();
        for (idx, result) in results {
            let slot = &mut self.slots[idx];
            let was_ready = slot.tracker.is_ready();
            let status = slot.tracker.record(result);

            if !was_ready && status == HealthStatus::Healthy {
                report.admitted += 1;
                info!(id = %slot.replica.id, "replica admitted by health gate");
            } else if result != ProbeResult::Healthy {
                debug!(
                    id = %slot.replica.id,
                    failures = slot.tracker.consecutive_failures(),
                    "replica failed health probe"
                );
            }
        }

        report.replaced = self.replace_unhealthy().await;
        self.reconcile().await?;

        report.ready = self.current_count();
        report.pending = self.total_count() - report.ready;
        Ok(report)
    }

    /// Terminate demoted replicas. Ones the orchestrator refuses to stop
    /// stay in the pool and are retried next poll.
    async fn replace_unhealthy(&mut self) -> u32 {
        let mut replaced = 0;
        let mut idx = 0;
        while idx < self.slots.len() {
            if !self.slots[idx].tracker.needs_replacement() {
                idx += 1;
                continue;
            }
            let id = self.slots[idx].replica.id.clone();
            match self.orchestrator.terminate(&id).await {
                Ok(()) => {
                    warn!(%id, "unhealthy replica terminated for replacement");
                    self.slots.remove(idx);
                    replaced += 1;
                }
                Err(e) => {
                    warn!(%id, error = %e, "failed to terminate unhealthy replica");
                    idx += 1;
                }
            }
        }
        replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHealthGate, FakeOrchestrator};

    fn test_pool(min: u32, max: u32) -> (ReplicaPool, Arc<FakeOrchestrator>, Arc<FakeHealthGate>) {
        let orch = Arc::new(FakeOrchestrator::new());
        let gate = Arc::new(FakeHealthGate::new());
        let pool = ReplicaPool::new(min, max, orch.clone(), gate.clone());
        (pool, orch, gate)
    }

    #[tokio::test]
    async fn launched_replicas_do_not_count_until_admitted() {
        let (mut pool, orch, _gate) = test_pool(2, 10);
        pool.set_desired_count(3).await.unwrap();

        assert_eq!(orch.launches(), 3);
        assert_eq!(pool.total_count(), 3);
        assert_eq!(pool.current_count(), 0);

        let report = pool.poll_health().await.unwrap();
        assert_eq!(report.admitted, 3);
        assert_eq!(report.ready, 3);
        assert_eq!(pool.current_count(), 3);
    }

    #[tokio::test]
    async fn rejects_out_of_bounds_targets() {
        let (mut pool, orch, _gate) = test_pool(2, 5);

        let err = pool.set_desired_count(6).await.unwrap_err();
        assert!(matches!(err, PoolError::OutOfBounds { requested: 6, min: 2, max: 5 }));
        let err = pool.set_desired_count(1).await.unwrap_err();
        assert!(matches!(err, PoolError::OutOfBounds { requested: 1, .. }));

        assert_eq!(orch.launches(), 0);
        assert_eq!(pool.desired_count(), 0);
    }

    #[tokio::test]
    async fn scale_in_drops_pending_replicas_first() {
        let (mut pool, orch, gate) = test_pool(2, 10);
        pool.set_desired_count(2).await.unwrap();
        pool.poll_health().await.unwrap();

        // Two more that never pass the gate.
        gate.fail("replica-2");
        gate.fail("replica-3");
        pool.set_desired_count(4).await.unwrap();
        pool.poll_health().await.unwrap();
        assert_eq!(pool.current_count(), 2);

        pool.set_desired_count(2).await.unwrap();
        assert_eq!(orch.live(), vec!["replica-0", "replica-1"]);
        assert_eq!(pool.current_count(), 2);
    }

    #[tokio::test]
    async fn unreachable_orchestrator_is_retryable() {
        let (mut pool, orch, _gate) = test_pool(2, 10);
        orch.set_unreachable(true);

        let err = pool.set_desired_count(3).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(pool.total_count(), 0);

        // Target is kept; the next poll converges once the substrate is back.
        orch.set_unreachable(false);
        pool.poll_health().await.unwrap();
        assert_eq!(pool.total_count(), 3);
    }

    #[tokio::test]
    async fn demoted_replicas_are_replaced() {
        let orch = Arc::new(FakeOrchestrator::new());
        let gate = Arc::new(FakeHealthGate::new());
        let mut pool = ReplicaPool::new(2, 10, orch.clone(), gate.clone()).with_thresholds(2, 1);
        pool.set_desired_count(2).await.unwrap();
        pool.poll_health().await.unwrap();
        assert_eq!(pool.current_count(), 2);

        gate.fail("replica-0");
        let report = pool.poll_health().await.unwrap();
        assert_eq!(report.replaced, 0);
        assert_eq!(pool.current_count(), 2);

        let report = pool.poll_health().await.unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(pool.total_count(), 2);
        assert_eq!(pool.current_count(), 1);
        assert!(!orch.live().contains(&"replica-0".to_string()));

        // Replacement is admitted on the following poll.
        let report = pool.poll_health().await.unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(pool.current_count(), 2);
    }

    #[tokio::test]
    async fn replicas_view_reports_health() {
        let (mut pool, _orch, gate) = test_pool(2, 10);
        pool.set_desired_count(2).await.unwrap();
        gate.fail("replica-1");
        pool.poll_health().await.unwrap();

        let views = pool.replicas();
        assert_eq!(views.len(), 2);
        assert!(views[0].ready);
        assert!(!views[1].ready);
        assert_eq!(views[1].health, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn setting_same_count_is_idempotent() {
        let (mut pool, orch, _gate) = test_pool(2, 10);
        pool.set_desired_count(3).await.unwrap();
        pool.set_desired_count(3).await.unwrap();
        assert_eq!(orch.launches(), 3);
        assert_eq!(orch.terminations(), 0);
    }
}
