//! Persistence collaborator contract.
//!
//! The core only ever calls these three operations; actual storage (local
//! database, cloud sync, whatever the application shell wires in) lives
//! behind the trait. [`MemoryStore`] is a complete in-memory implementation
//! used by the demos and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::{Result, TrainerError},
    types::{CompletedSet, RepMetricData},
};

/// Where finished sets and rep curves go
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist one completed set
    ///
    /// # Errors
    ///
    /// Returns a store-specific error if the record cannot be written; the
    /// aggregator queues the record for retry rather than propagating.
    async fn save_completed_set(&self, set: &CompletedSet) -> Result<()>;

    /// Persist one rep's force/velocity curves
    ///
    /// # Errors
    ///
    /// Returns a store-specific error if the record cannot be written.
    async fn save_rep_metrics(&self, metrics: &RepMetricData) -> Result<()>;

    /// Most recent completed sets for an exercise, newest first
    ///
    /// # Errors
    ///
    /// Returns a store-specific error if history cannot be read.
    async fn load_recent_history(&self, exercise_id: Uuid, limit: usize)
        -> Result<Vec<CompletedSet>>;
}

/// In-memory [`SessionStore`]
///
/// Keeps everything in maps behind an async lock. Supports simulated write
/// failures so the aggregator's retry queue can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    sets: Vec<CompletedSet>,
    metrics: Vec<RepMetricData>,
    history: HashMap<Uuid, Vec<CompletedSet>>,
    fail_saves: bool,
}

impl MemoryStore {
    /// Number of completed sets persisted so far
    pub async fn completed_set_count(&self) -> usize {
        self.inner.read().await.sets.len()
    }

    /// Number of rep metric records persisted so far
    pub async fn rep_metric_count(&self) -> usize {
        self.inner.read().await.metrics.len()
    }

    /// Toggle simulated save failures
    pub async fn set_fail_saves(&self, fail: bool) {
        self.inner.write().await.fail_saves = fail;
    }

    /// Pre-load historical sets for progression analysis, newest first
    pub async fn seed_history(&self, sets: Vec<CompletedSet>) {
        let mut inner = self.inner.write().await;
        for set in sets {
            inner.history.entry(set.exercise_id).or_default().push(set);
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save_completed_set(&self, set: &CompletedSet) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.fail_saves {
            return Err(TrainerError::Other("store unavailable".to_string()));
        }
        inner.sets.push(set.clone());
        inner
            .history
            .entry(set.exercise_id)
            .or_default()
            .insert(0, set.clone());
        Ok(())
    }

    async fn save_rep_metrics(&self, metrics: &RepMetricData) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.fail_saves {
            return Err(TrainerError::Other("store unavailable".to_string()));
        }
        inner.metrics.push(metrics.clone());
        Ok(())
    }

    async fn load_recent_history(
        &self,
        exercise_id: Uuid,
        limit: usize,
    ) -> Result<Vec<CompletedSet>> {
        let inner = self.inner.read().await;
        Ok(inner
            .history
            .get(&exercise_id)
            .map(|sets| sets.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
