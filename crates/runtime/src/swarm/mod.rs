//! Bounded parallel sub-query execution
//!
//! A swarm fans one parent session out into at most ten workers, each
//! running the full pipeline under an isolated session id
//! (`parent:swarm:worker`). A shared token budget is the backpressure
//! mechanism: once completed workers have spent it, every worker still
//! pending is aborted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::SwarmConfig;
use crate::memory::MemoryManager;
use crate::pipeline::{AuditOutcome, Pipeline, PipelineRequest};
use crate::types::{SwarmError, SwarmId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwarmStatus {
    Pending,
    Running,
    Done,
    Partial,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Pending,
    Running,
    Done,
    Failed,
    Aborted,
}

/// One task handed to `spawn_swarm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub label: String,
    pub query: String,
}

/// Worker state, snapshotted into responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: usize,
    pub label: String,
    pub query: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditOutcome>,
    pub tokens: u64,
}

/// Full swarm state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmRecord {
    pub swarm_id: SwarmId,
    pub parent_session_id: String,
    pub caller_id: String,
    pub workers: Vec<WorkerRecord>,
    pub token_budget: u64,
    pub status: SwarmStatus,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// The swarm registry and executor.
pub struct SwarmManager {
    registry: DashMap<SwarmId, Arc<Mutex<SwarmRecord>>>,
    pipeline: Arc<Pipeline>,
    memory: Arc<MemoryManager>,
    config: SwarmConfig,
}

impl SwarmManager {
    pub fn new(pipeline: Arc<Pipeline>, memory: Arc<MemoryManager>, config: SwarmConfig) -> Self {
        Self {
            registry: DashMap::new(),
            pipeline,
            memory,
            config,
        }
    }

    /// Validate limits and register a new swarm in `pending` state.
    pub fn spawn_swarm(
        &self,
        parent_session_id: &str,
        caller_id: &str,
        tasks: Vec<WorkerSpec>,
        token_budget: Option<u64>,
    ) -> Result<SwarmRecord, SwarmError> {
        if tasks.is_empty() {
            return Err(SwarmError::NoTasks);
        }
        if tasks.len() > self.config.max_workers {
            return Err(SwarmError::TooManyTasks {
                given: tasks.len(),
                max: self.config.max_workers,
            });
        }
        self.make_room()?;

        let swarm_id = SwarmId::new();
        let workers = tasks
            .into_iter()
            .enumerate()
            .map(|(worker_id, spec)| WorkerRecord {
                worker_id,
                label: spec.label,
                query: spec.query,
                status: WorkerStatus::Pending,
                response: None,
                audit: None,
                tokens: 0,
            })
            .collect();
        let record = SwarmRecord {
            swarm_id,
            parent_session_id: parent_session_id.to_string(),
            caller_id: caller_id.to_string(),
            workers,
            token_budget: token_budget.unwrap_or(self.config.default_token_budget),
            status: SwarmStatus::Pending,
            total_tokens: 0,
            total_latency_ms: 0,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.registry
            .insert(swarm_id, Arc::new(Mutex::new(record.clone())));
        Ok(record)
    }

    fn make_room(&self) -> Result<(), SwarmError> {
        if self.registry.len() < self.config.max_swarms {
            return Ok(());
        }
        let evictable = self
            .registry
            .iter()
            .filter(|entry| {
                !matches!(
                    entry.value().lock().status,
                    SwarmStatus::Pending | SwarmStatus::Running
                )
            })
            .min_by_key(|entry| {
                let guard = entry.value().lock();
                guard.finished_at.unwrap_or(guard.created_at)
            })
            .map(|entry| *entry.key());
        match evictable {
            Some(key) => {
                self.registry.remove(&key);
                Ok(())
            }
            None => Err(SwarmError::CapacityFull {
                capacity: self.config.max_swarms,
            }),
        }
    }

    /// Launch all workers concurrently and wait for the swarm to settle.
    pub async fn execute_swarm(&self, swarm_id: SwarmId) -> Result<SwarmRecord, SwarmError> {
        let record = self
            .registry
            .get(&swarm_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SwarmError::NotFound(swarm_id))?;

        let (parent, caller, budget, worker_count) = {
            let mut guard = record.lock();
            if guard.status != SwarmStatus::Pending {
                return Err(SwarmError::NotRunnable(swarm_id));
            }
            guard.status = SwarmStatus::Running;
            (
                guard.parent_session_id.clone(),
                guard.caller_id.clone(),
                guard.token_budget,
                guard.workers.len(),
            )
        };

        let started = Instant::now();
        let total_tokens = Arc::new(AtomicU64::new(0));
        let budget_exceeded = Arc::new(AtomicBool::new(false));
        let semaphore = Arc::new(Semaphore::new(self.config.worker_concurrency));

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let record = Arc::clone(&record);
            let pipeline = Arc::clone(&self.pipeline);
            let memory = Arc::clone(&self.memory);
            let total_tokens = Arc::clone(&total_tokens);
            let budget_exceeded = Arc::clone(&budget_exceeded);
            let semaphore = Arc::clone(&semaphore);
            let parent = parent.clone();
            let caller = caller.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;

                // budget exhausted while we waited: abort instead of running
                if budget_exceeded.load(Ordering::SeqCst) {
                    let mut guard = record.lock();
                    if guard.workers[worker_id].status == WorkerStatus::Pending {
                        guard.workers[worker_id].status = WorkerStatus::Aborted;
                    }
                    return;
                }

                let query = {
                    let mut guard = record.lock();
                    if guard.workers[worker_id].status != WorkerStatus::Pending {
                        return;
                    }
                    guard.workers[worker_id].status = WorkerStatus::Running;
                    guard.workers[worker_id].query.clone()
                };

                let session_id = format!("{parent}:swarm:{worker_id}");
                let request = PipelineRequest {
                    query,
                    tenant_id: format!("swarm:{parent}"),
                    session_id: Some(session_id.clone()),
                    caller_id: caller,
                    ..Default::default()
                };
                let response = pipeline.run(request).await;

                let spent = response.usage.combined();
                let total = total_tokens.fetch_add(spent, Ordering::SeqCst) + spent;

                {
                    let mut guard = record.lock();
                    let worker = &mut guard.workers[worker_id];
                    if worker.status == WorkerStatus::Running {
                        worker.status = if response.success {
                            WorkerStatus::Done
                        } else {
                            WorkerStatus::Failed
                        };
                    }
                    worker.tokens = spent;
                    worker.response = Some(response.answer);
                    worker.audit = Some(response.audit);
                }

                if total >= budget {
                    budget_exceeded.store(true, Ordering::SeqCst);
                }
                memory.clear(&session_id);
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let snapshot = {
            let mut guard = record.lock();
            guard.total_tokens = total_tokens.load(Ordering::SeqCst);
            guard.total_latency_ms = started.elapsed().as_millis() as u64;
            guard.finished_at = Some(Utc::now());
            let done = guard
                .workers
                .iter()
                .filter(|w| w.status == WorkerStatus::Done)
                .count();
            guard.status = if done == guard.workers.len() {
                SwarmStatus::Done
            } else if done > 0 {
                SwarmStatus::Partial
            } else {
                SwarmStatus::Failed
            };
            guard.clone()
        };
        tracing::debug!(
            swarm = %swarm_id,
            status = ?snapshot.status,
            tokens = snapshot.total_tokens,
            "swarm settled"
        );
        Ok(snapshot)
    }

    /// Abort every worker not yet finished and mark the swarm aborted.
    pub fn abort_swarm(&self, swarm_id: SwarmId) -> Result<SwarmRecord, SwarmError> {
        let record = self
            .registry
            .get(&swarm_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SwarmError::NotFound(swarm_id))?;
        let mut guard = record.lock();
        let parent = guard.parent_session_id.clone();
        for worker in &mut guard.workers {
            if matches!(worker.status, WorkerStatus::Pending | WorkerStatus::Running) {
                worker.status = WorkerStatus::Aborted;
                self.memory
                    .clear(&format!("{parent}:swarm:{}", worker.worker_id));
            }
        }
        guard.status = SwarmStatus::Aborted;
        guard.finished_at = Some(Utc::now());
        Ok(guard.clone())
    }

    /// Abort a single worker.
    pub fn abort_worker(&self, swarm_id: SwarmId, worker_id: usize) -> Result<(), SwarmError> {
        let record = self
            .registry
            .get(&swarm_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SwarmError::NotFound(swarm_id))?;
        let mut guard = record.lock();
        let parent = guard.parent_session_id.clone();
        if let Some(worker) = guard.workers.get_mut(worker_id) {
            if matches!(worker.status, WorkerStatus::Pending | WorkerStatus::Running) {
                worker.status = WorkerStatus::Aborted;
                self.memory.clear(&format!("{parent}:swarm:{worker_id}"));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self, swarm_id: SwarmId) -> Option<SwarmRecord> {
        self.registry
            .get(&swarm_id)
            .map(|entry| entry.value().lock().clone())
    }

    pub fn swarm_count(&self) -> usize {
        self.registry.len()
    }

    /// Drop completed swarms past the retention TTL.
    pub fn sweep_completed(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.completed_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let cutoff = Utc::now() - ttl;
        let expired: Vec<SwarmId> = self
            .registry
            .iter()
            .filter(|entry| {
                let guard = entry.value().lock();
                !matches!(guard.status, SwarmStatus::Pending | SwarmStatus::Running)
                    && guard.finished_at.is_some_and(|at| at < cutoff)
            })
            .map(|entry| *entry.key())
            .collect();
        let count = expired.len();
        for key in expired {
            self.registry.remove(&key);
        }
        count
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.sweep_completed();
            }
        })
    }
}
