//! In-memory orchestrator and health gate for tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::health::{HealthGate, ProbeResult};
use crate::orchestrator::{Orchestrator, Replica};

/// Orchestrator that hands out `replica-N` ids and can be made unreachable.
#[derive(Default)]
pub struct FakeOrchestrator {
    next_id: AtomicU32,
    unreachable: AtomicBool,
    live: Mutex<Vec<String>>,
    launches: AtomicU32,
    terminations: AtomicU32,
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Ids of replicas launched and not yet terminated.
    pub fn live(&self) -> Vec<String> {
        self.live.lock().unwrap().clone()
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> u32 {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn launch(&self) -> anyhow::Result<Replica> {
        if self.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("substrate unreachable");
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("replica-{n}");
        self.live.lock().unwrap().push(id.clone());
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Replica {
            id,
            address: format!("10.0.0.{n}:8000"),
        })
    }

    async fn terminate(&self, id: &str) -> anyhow::Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("substrate unreachable");
        }
        self.live.lock().unwrap().retain(|l| l != id);
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Health gate where every replica passes unless explicitly marked failing.
#[derive(Default)]
pub struct FakeHealthGate {
    failing: Mutex<HashSet<String>>,
    all_failing: AtomicBool,
}

impl FakeHealthGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn recover(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    pub fn fail_all(&self, failing: bool) {
        self.all_failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthGate for FakeHealthGate {
    async fn probe(&self, replica: &Replica) -> ProbeResult {
        if self.all_failing.load(Ordering::SeqCst)
            || self.failing.lock().unwrap().contains(&replica.id)
        {
            ProbeResult::Failed
        } else {
            ProbeResult::Healthy
        }
    }
}
