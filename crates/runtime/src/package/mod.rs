//! Immutable stage artifacts and the bounded per-tenant history
//!
//! Every pipeline run owns a [`DataPackage`] that records one artifact per
//! stage. Packages are finalized at S6 and snapshotted into the
//! [`TenantPackageStore`], which keeps the eight most recent packages per
//! tenant (the φ-8 window) and expires idle tenants after an hour.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::StoreConfig;
use crate::types::{PackageError, PackageId, StageId};

/// A single written stage artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage_id: StageId,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Immutable, per-request artifact recording each stage's output.
///
/// A stage may be overwritten before finalization (diagnosed with a warning);
/// after [`DataPackage::finalize`] all writes fail. Reads always return a
/// deep copy, so callers can never mutate stored data.
#[derive(Debug, Clone)]
pub struct DataPackage {
    id: PackageId,
    tenant_id: String,
    created_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
    current_stage: Option<StageId>,
    finalized: bool,
    stages: BTreeMap<StageId, StageEntry>,
}

impl DataPackage {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            id: PackageId::new(),
            tenant_id: tenant_id.into(),
            created_at: Utc::now(),
            finalized_at: None,
            current_stage: None,
            finalized: false,
            stages: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> PackageId {
        self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn current_stage(&self) -> Option<StageId> {
        self.current_stage
    }

    /// Write a stage artifact. The value is stored as an owned JSON tree, so
    /// no caller reference can alias it afterwards.
    pub fn write_stage(&mut self, stage: StageId, data: Value) -> Result<(), PackageError> {
        if self.finalized {
            return Err(PackageError::Finalized {
                package_id: self.id,
                stage,
            });
        }
        if self.stages.contains_key(&stage) {
            tracing::warn!(package = %self.id, %stage, "stage overwritten before finalization");
        }
        self.stages.insert(
            stage,
            StageEntry {
                stage_id: stage,
                timestamp: Utc::now(),
                data,
            },
        );
        self.current_stage = Some(stage);
        Ok(())
    }

    /// Read a stage artifact as a deep copy, or `None` if never written.
    pub fn read_stage(&self, stage: StageId) -> Option<Value> {
        self.stages.get(&stage).map(|entry| entry.data.clone())
    }

    /// Read a stage entry (timestamp included) as a deep copy.
    pub fn read_entry(&self, stage: StageId) -> Option<StageEntry> {
        self.stages.get(&stage).cloned()
    }

    pub fn written_stages(&self) -> Vec<StageId> {
        self.stages.keys().copied().collect()
    }

    /// Seal the package. Reads continue to work; writes fail from here on.
    pub fn finalize(&mut self) {
        if !self.finalized {
            self.finalized = true;
            self.finalized_at = Some(Utc::now());
        }
    }

    pub fn to_snapshot(&self) -> PackageSnapshot {
        PackageSnapshot {
            id: self.id,
            tenant_id: self.tenant_id.clone(),
            created_at: self.created_at,
            finalized_at: self.finalized_at,
            current_stage: self.current_stage,
            finalized: self.finalized,
            stages: self.stages.clone(),
        }
    }

    pub fn from_snapshot(snapshot: PackageSnapshot) -> Self {
        Self {
            id: snapshot.id,
            tenant_id: snapshot.tenant_id,
            created_at: snapshot.created_at,
            finalized_at: snapshot.finalized_at,
            current_stage: snapshot.current_stage,
            finalized: snapshot.finalized,
            stages: snapshot.stages,
        }
    }

    /// Compact digest used when enriching later queries from the window.
    pub fn compressed_summary(&self) -> PackageSummary {
        let s0 = self.stages.get(&StageId::Preflight).map(|e| &e.data);
        let s3 = self.stages.get(&StageId::Audit).map(|e| &e.data);

        let ticker = s0
            .and_then(|d| d.get("ticker"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let mode = s0
            .and_then(|d| d.get("mode"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let audit_pass = s3
            .and_then(|d| d.get("verdict"))
            .and_then(Value::as_str)
            .map(|v| matches!(v, "APPROVED" | "ACCEPTED" | "BYPASS"));

        PackageSummary {
            short_id: self.id.short(),
            current_stage: self.current_stage,
            ts_time: self.created_at.format("%H:%M:%S").to_string(),
            ticker,
            mode,
            audit_pass,
        }
    }
}

/// Serializable snapshot of a [`DataPackage`], stored in the tenant window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSnapshot {
    pub id: PackageId,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub current_stage: Option<StageId>,
    pub finalized: bool,
    pub stages: BTreeMap<StageId, StageEntry>,
}

/// Compressed per-package digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSummary {
    pub short_id: String,
    pub current_stage: Option<StageId>,
    pub ts_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_pass: Option<bool>,
}

#[derive(Debug)]
struct TenantHistory {
    packages: VecDeque<PackageSnapshot>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// Store statistics for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub tenants: usize,
    pub total_packages: usize,
}

/// Bounded per-tenant history of finalized packages.
///
/// Eviction is strict insertion-order FIFO: the newest write evicts the
/// oldest snapshot once the window is full, and reads never reorder anything.
pub struct TenantPackageStore {
    tenants: DashMap<String, TenantHistory>,
    config: StoreConfig,
}

impl TenantPackageStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            tenants: DashMap::new(),
            config,
        }
    }

    /// Snapshot the package and append it to the tenant's window, dropping
    /// the oldest snapshots while the window exceeds its bound.
    pub fn store_package(&self, tenant_id: &str, package: &DataPackage) {
        let now = Utc::now();
        let mut entry = self
            .tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantHistory {
                packages: VecDeque::new(),
                created_at: now,
                last_activity: now,
            });
        entry.packages.push_back(package.to_snapshot());
        while entry.packages.len() > self.config.window {
            entry.packages.pop_front();
        }
        entry.last_activity = now;
    }

    /// Return the newest `n` packages (capped at the window size) in
    /// insertion order, restored as independent `DataPackage` instances.
    pub fn get_recent_packages(&self, tenant_id: &str, n: usize) -> Vec<DataPackage> {
        let n = n.min(self.config.window);
        let Some(mut entry) = self.tenants.get_mut(tenant_id) else {
            return Vec::new();
        };
        entry.last_activity = Utc::now();
        let len = entry.packages.len();
        let start = len.saturating_sub(n);
        entry
            .packages
            .iter()
            .skip(start)
            .cloned()
            .map(DataPackage::from_snapshot)
            .collect()
    }

    /// Compressed summaries of the newest `n` packages, oldest first.
    pub fn recent_summaries(&self, tenant_id: &str, n: usize) -> Vec<PackageSummary> {
        self.get_recent_packages(tenant_id, n)
            .iter()
            .map(DataPackage::compressed_summary)
            .collect()
    }

    /// True when the tenant currently holds the given package id.
    pub fn contains_package(&self, tenant_id: &str, id: PackageId) -> bool {
        self.tenants
            .get(tenant_id)
            .map(|e| e.packages.iter().any(|p| p.id == id))
            .unwrap_or(false)
    }

    /// Delete everything the store holds for the tenant.
    pub fn nuke_tenant(&self, tenant_id: &str) -> bool {
        self.tenants.remove(tenant_id).is_some()
    }

    pub fn package_count(&self, tenant_id: &str) -> usize {
        self.tenants
            .get(tenant_id)
            .map(|e| e.packages.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> StoreStats {
        let total_packages = self.tenants.iter().map(|e| e.packages.len()).sum();
        StoreStats {
            tenants: self.tenants.len(),
            total_packages,
        }
    }

    /// Remove tenants idle beyond the session TTL.
    pub fn sweep_expired(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - ttl;
        let expired: Vec<String> = self
            .tenants
            .iter()
            .filter(|e| e.last_activity < cutoff)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.tenants.remove(&key);
        }
        if count > 0 {
            tracing::debug!(count, "expired idle tenants");
        }
        count
    }

    /// Spawn the periodic sweep task. Dropping the handle aborts nothing;
    /// call `abort()` on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = store.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.sweep_expired();
            }
        })
    }
}
