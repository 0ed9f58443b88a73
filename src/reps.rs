//! Rep and set aggregation.
//!
//! Consumes decoded rep-boundary events and motion samples, accumulates
//! per-rep force/velocity curves into [`RepMetricData`], folds finished reps
//! into [`CompletedSet`] records, and runs the progression analysis that
//! suggests weight increases. The aggregator exclusively owns the session
//! summary buffer until it is flushed to the persistence collaborator; a
//! failed persist is queued and retried on the next flush rather than
//! blocking whichever state transition triggered it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::Result,
    store::SessionStore,
    types::{
        CompletedSet, ProgressionEvent, ProgressionReason, RepMetricData, RepPhase,
        TelemetrySample,
    },
};

/// Minimum recorded sets before progression analysis will speak
pub const MIN_PROGRESSION_HISTORY: usize = 3;

/// Mean RPE at or below which the low-effort trend fires
pub const LOW_RPE_THRESHOLD: f32 = 6.5;

/// Distinct sessions that must hit the rep target for `RepsAchieved`
pub const REPS_ACHIEVED_SESSIONS: usize = 2;

/// How many historical sets the analysis looks back over
const HISTORY_WINDOW: usize = 10;

#[derive(Debug, Default)]
struct RepInProgress {
    concentric_force: Vec<f32>,
    eccentric_force: Vec<f32>,
    concentric_velocity: Vec<f32>,
    eccentric_velocity: Vec<f32>,
    position_range: Option<(u16, u16)>,
}

impl RepInProgress {
    fn absorb(&mut self, sample: TelemetrySample) {
        match sample.phase {
            RepPhase::Concentric => {
                self.concentric_force.push(sample.force);
                self.concentric_velocity.push(sample.velocity);
            }
            RepPhase::Eccentric => {
                self.eccentric_force.push(sample.force);
                self.eccentric_velocity.push(sample.velocity);
            }
        }
        self.position_range = Some(match self.position_range {
            None => (sample.position_mm, sample.position_mm),
            Some((lo, hi)) => (lo.min(sample.position_mm), hi.max(sample.position_mm)),
        });
    }

    fn finish(self, set_id: Uuid, rep_index: u32, duration_ms: u32) -> RepMetricData {
        #[allow(clippy::cast_precision_loss)]
        let duration_secs = duration_ms as f32 / 1000.0;
        RepMetricData {
            set_id,
            rep_index,
            concentric_force: self.concentric_force,
            eccentric_force: self.eccentric_force,
            concentric_velocity: self.concentric_velocity,
            eccentric_velocity: self.eccentric_velocity,
            duration_secs,
        }
    }
}

/// Accumulates reps into sets and analyses progression
pub struct RepAggregator {
    store: Arc<dyn SessionStore>,
    session_id: Uuid,
    set_id: Uuid,
    rep_count: u32,
    current_rep: RepInProgress,
    /// Per-rep cable travel ranges for the current set, in millimetres
    rep_ranges: Vec<(u16, u16)>,
    /// Finished reps of the current set, not yet folded into a record
    set_metrics: Vec<RepMetricData>,
    /// Unsaved records awaiting flush (retained across failed flushes)
    pending_sets: Vec<CompletedSet>,
    pending_metrics: Vec<RepMetricData>,
    /// At most one pending suggestion per exercise
    pending_progressions: HashMap<Uuid, ProgressionEvent>,
}

impl RepAggregator {
    /// Create an aggregator for one session
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, session_id: Uuid) -> Self {
        Self {
            store,
            session_id,
            set_id: Uuid::new_v4(),
            rep_count: 0,
            current_rep: RepInProgress::default(),
            rep_ranges: Vec::new(),
            set_metrics: Vec::new(),
            pending_sets: Vec::new(),
            pending_metrics: Vec::new(),
            pending_progressions: HashMap::new(),
        }
    }

    /// Reps completed in the current set
    #[must_use]
    pub const fn rep_count(&self) -> u32 {
        self.rep_count
    }

    /// Per-rep cable travel ranges accumulated for the current set
    #[must_use]
    pub fn rep_ranges(&self) -> &[(u16, u16)] {
        &self.rep_ranges
    }

    /// Clear rep state for a fresh workout
    ///
    /// Idempotent and safe from any state: always leaves the rep count at
    /// zero and the range accumulator empty.
    pub fn reset_for_new_workout(&mut self) {
        self.rep_count = 0;
        self.current_rep = RepInProgress::default();
        self.rep_ranges.clear();
        self.set_metrics.clear();
        self.set_id = Uuid::new_v4();
    }

    /// Fold one motion sample into the rep in progress
    pub fn on_sample(&mut self, sample: TelemetrySample) {
        self.current_rep.absorb(sample);
    }

    /// Close the rep in progress
    pub fn on_rep_boundary(&mut self, duration_ms: u32) {
        let rep = std::mem::take(&mut self.current_rep);
        if let Some(range) = rep.position_range {
            self.rep_ranges.push(range);
        }
        let metrics = rep.finish(self.set_id, self.rep_count, duration_ms);
        debug!(
            "rep {} closed: peak {:.0} N, mean concentric {:.2} m/s",
            self.rep_count,
            metrics.peak_force(),
            metrics.mean_concentric_velocity()
        );
        self.set_metrics.push(metrics);
        self.rep_count += 1;
    }

    /// Close the current set into a [`CompletedSet`] and queue it for flush
    ///
    /// The PR flag compares the working weight against the exercise's
    /// recorded history; history read failures degrade to "not a PR".
    pub async fn complete_set(
        &mut self,
        exercise_id: Uuid,
        weight_kg: f32,
        rpe: Option<f32>,
    ) -> CompletedSet {
        let is_personal_record = match self.store.load_recent_history(exercise_id, HISTORY_WINDOW).await {
            Ok(history) => !history.is_empty()
                && history.iter().all(|set| set.actual_weight_kg < weight_kg),
            Err(e) => {
                warn!("history read failed during PR check: {e}");
                false
            }
        };

        let set = CompletedSet {
            id: self.set_id,
            session_id: self.session_id,
            exercise_id,
            actual_reps: self.rep_count,
            actual_weight_kg: weight_kg,
            rpe,
            is_personal_record,
            completed_at: SystemTime::now(),
        };

        info!(
            "set complete: {} reps at {:.1} kg{}",
            set.actual_reps,
            set.actual_weight_kg,
            if set.is_personal_record { " (PR)" } else { "" }
        );

        self.pending_metrics.append(&mut self.set_metrics);
        self.pending_sets.push(set.clone());

        // Fresh accumulators for the next set
        self.rep_count = 0;
        self.rep_ranges.clear();
        self.current_rep = RepInProgress::default();
        self.set_id = Uuid::new_v4();

        set
    }

    /// Flush the summary buffer to the persistence collaborator
    ///
    /// Never fails from the caller's perspective: records that do not save
    /// stay queued and are retried on the next flush. Returns the number of
    /// records still pending afterwards.
    pub async fn flush(&mut self) -> usize {
        let mut unsaved_sets = Vec::new();
        for set in self.pending_sets.drain(..) {
            if let Err(e) = self.store.save_completed_set(&set).await {
                warn!("set persist failed, queued for retry: {e}");
                unsaved_sets.push(set);
            }
        }
        self.pending_sets = unsaved_sets;

        let mut unsaved_metrics = Vec::new();
        for metrics in self.pending_metrics.drain(..) {
            if let Err(e) = self.store.save_rep_metrics(&metrics).await {
                warn!("rep metrics persist failed, queued for retry: {e}");
                unsaved_metrics.push(metrics);
            }
        }
        self.pending_metrics = unsaved_metrics;

        self.pending_sets.len() + self.pending_metrics.len()
    }

    /// Records currently queued for a retry flush
    #[must_use]
    pub fn pending_record_count(&self) -> usize {
        self.pending_sets.len() + self.pending_metrics.len()
    }

    /// Analyse recorded history for a progression suggestion
    ///
    /// Returns `None` while a pending suggestion exists for the exercise or
    /// while history is below [`MIN_PROGRESSION_HISTORY`]. Otherwise at most
    /// one reason fires per call: a sustained low-RPE trend takes priority
    /// over achieved rep targets when both hold.
    ///
    /// # Errors
    ///
    /// Returns the store error if history cannot be read.
    pub async fn check_for_progression(
        &mut self,
        exercise_id: Uuid,
        target_reps: u32,
    ) -> Result<Option<ProgressionEvent>> {
        if self.pending_progressions.contains_key(&exercise_id) {
            debug!("progression suppressed: suggestion already pending");
            return Ok(None);
        }

        let history = self
            .store
            .load_recent_history(exercise_id, HISTORY_WINDOW)
            .await?;
        if history.len() < MIN_PROGRESSION_HISTORY {
            return Ok(None);
        }

        let reason = if low_rpe_trend(&history) {
            Some(ProgressionReason::LowRpe)
        } else if reps_achieved(&history, target_reps) {
            Some(ProgressionReason::RepsAchieved)
        } else {
            None
        };

        let Some(reason) = reason else {
            return Ok(None);
        };

        let previous_weight_kg = history
            .first()
            .map_or(0.0, |set| set.actual_weight_kg);
        let event = ProgressionEvent {
            exercise_id,
            previous_weight_kg,
            reason,
            resolved: false,
        };
        info!("progression suggested for {exercise_id}: {reason}");
        self.pending_progressions.insert(exercise_id, event.clone());
        Ok(Some(event))
    }

    /// Mark the pending suggestion for an exercise as resolved
    pub fn resolve_progression(&mut self, exercise_id: Uuid) {
        self.pending_progressions.remove(&exercise_id);
    }

    /// Seed a pending suggestion (restores state across app restarts)
    pub fn restore_pending_progression(&mut self, event: ProgressionEvent) {
        self.pending_progressions.insert(event.exercise_id, event);
    }
}

/// Mean RPE of the most recent logged sets at or below the threshold
fn low_rpe_trend(history: &[CompletedSet]) -> bool {
    let recent: Vec<f32> = history
        .iter()
        .filter_map(|set| set.rpe)
        .take(MIN_PROGRESSION_HISTORY)
        .collect();
    if recent.len() < MIN_PROGRESSION_HISTORY {
        return false;
    }
    #[allow(clippy::cast_precision_loss)]
    let mean = recent.iter().sum::<f32>() / recent.len() as f32;
    mean <= LOW_RPE_THRESHOLD
}

/// Target reps met across enough distinct sessions
fn reps_achieved(history: &[CompletedSet], target_reps: u32) -> bool {
    let sessions: std::collections::HashSet<Uuid> = history
        .iter()
        .filter(|set| set.actual_reps >= target_reps)
        .map(|set| set.session_id)
        .collect();
    sessions.len() >= REPS_ACHIEVED_SESSIONS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sample(phase: RepPhase, velocity: f32, force: f32, position_mm: u16) -> TelemetrySample {
        TelemetrySample {
            velocity,
            force,
            position_mm,
            phase,
        }
    }

    fn history_set(
        session_id: Uuid,
        exercise_id: Uuid,
        reps: u32,
        weight: f32,
        rpe: Option<f32>,
    ) -> CompletedSet {
        CompletedSet {
            id: Uuid::new_v4(),
            session_id,
            exercise_id,
            actual_reps: reps,
            actual_weight_kg: weight,
            rpe,
            is_personal_record: false,
            completed_at: SystemTime::now(),
        }
    }

    fn aggregator() -> (RepAggregator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let aggregator = RepAggregator::new(Arc::clone(&store) as Arc<dyn SessionStore>, Uuid::new_v4());
        (aggregator, store)
    }

    #[test]
    fn test_rep_accumulation_and_boundary() {
        let (mut aggregator, _store) = aggregator();

        aggregator.on_sample(sample(RepPhase::Concentric, 0.5, 200.0, 100));
        aggregator.on_sample(sample(RepPhase::Concentric, 0.6, 220.0, 400));
        aggregator.on_sample(sample(RepPhase::Eccentric, -0.4, 180.0, 250));
        aggregator.on_rep_boundary(2400);

        assert_eq!(aggregator.rep_count(), 1);
        assert_eq!(aggregator.rep_ranges(), &[(100, 400)]);
    }

    #[test]
    fn test_reset_for_new_workout_from_any_state() {
        let (mut aggregator, _store) = aggregator();

        aggregator.on_sample(sample(RepPhase::Concentric, 0.5, 200.0, 100));
        aggregator.on_rep_boundary(2000);
        aggregator.on_sample(sample(RepPhase::Concentric, 0.5, 200.0, 150));

        aggregator.reset_for_new_workout();
        assert_eq!(aggregator.rep_count(), 0);
        assert!(aggregator.rep_ranges().is_empty());

        // Idempotent
        aggregator.reset_for_new_workout();
        assert_eq!(aggregator.rep_count(), 0);
        assert!(aggregator.rep_ranges().is_empty());
    }

    #[tokio::test]
    async fn test_complete_set_builds_record_and_resets_counters() {
        let (mut aggregator, _store) = aggregator();
        let exercise_id = Uuid::new_v4();

        for _ in 0..8 {
            aggregator.on_sample(sample(RepPhase::Concentric, 0.5, 200.0, 300));
            aggregator.on_rep_boundary(2000);
        }
        let set = aggregator.complete_set(exercise_id, 30.0, Some(8.0)).await;

        assert_eq!(set.actual_reps, 8);
        assert!((set.actual_weight_kg - 30.0).abs() < f32::EPSILON);
        assert_eq!(aggregator.rep_count(), 0);
        assert!(aggregator.rep_ranges().is_empty());
        assert_eq!(aggregator.pending_record_count(), 9); // 1 set + 8 rep curves
    }

    #[tokio::test]
    async fn test_flush_persists_and_drains_queue() {
        let (mut aggregator, store) = aggregator();
        let exercise_id = Uuid::new_v4();

        aggregator.on_rep_boundary(2000);
        aggregator.complete_set(exercise_id, 25.0, None).await;

        let remaining = aggregator.flush().await;
        assert_eq!(remaining, 0);
        assert_eq!(store.completed_set_count().await, 1);
        assert_eq!(store.rep_metric_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_queues_for_retry() {
        let (mut aggregator, store) = aggregator();
        let exercise_id = Uuid::new_v4();

        aggregator.on_rep_boundary(2000);
        aggregator.complete_set(exercise_id, 25.0, None).await;

        store.set_fail_saves(true).await;
        let remaining = aggregator.flush().await;
        assert_eq!(remaining, 2);
        assert_eq!(store.completed_set_count().await, 0);

        // Store recovers; the retry drains the queue
        store.set_fail_saves(false).await;
        let remaining = aggregator.flush().await;
        assert_eq!(remaining, 0);
        assert_eq!(store.completed_set_count().await, 1);
    }

    #[tokio::test]
    async fn test_pr_flag_against_history() {
        let (mut aggregator, store) = aggregator();
        let exercise_id = Uuid::new_v4();
        store
            .seed_history(vec![
                history_set(Uuid::new_v4(), exercise_id, 10, 20.0, None),
                history_set(Uuid::new_v4(), exercise_id, 10, 22.5, None),
            ])
            .await;

        aggregator.on_rep_boundary(2000);
        let set = aggregator.complete_set(exercise_id, 25.0, None).await;
        assert!(set.is_personal_record);

        aggregator.on_rep_boundary(2000);
        let set = aggregator.complete_set(exercise_id, 20.0, None).await;
        assert!(!set.is_personal_record);
    }

    #[tokio::test]
    async fn test_progression_none_while_pending() {
        let (mut aggregator, store) = aggregator();
        let exercise_id = Uuid::new_v4();
        let session = Uuid::new_v4();
        store
            .seed_history(vec![
                history_set(session, exercise_id, 10, 20.0, Some(5.0)),
                history_set(session, exercise_id, 10, 20.0, Some(6.0)),
                history_set(session, exercise_id, 10, 20.0, Some(5.5)),
            ])
            .await;

        let first = aggregator
            .check_for_progression(exercise_id, 10)
            .await
            .unwrap();
        assert!(first.is_some());

        // A pending suggestion suppresses everything, history regardless
        let second = aggregator
            .check_for_progression(exercise_id, 10)
            .await
            .unwrap();
        assert!(second.is_none());

        aggregator.resolve_progression(exercise_id);
        let third = aggregator
            .check_for_progression(exercise_id, 10)
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_progression_requires_minimum_history() {
        let (mut aggregator, store) = aggregator();
        let exercise_id = Uuid::new_v4();
        store
            .seed_history(vec![
                history_set(Uuid::new_v4(), exercise_id, 12, 20.0, Some(4.0)),
                history_set(Uuid::new_v4(), exercise_id, 12, 20.0, Some(4.0)),
            ])
            .await;

        let suggestion = aggregator
            .check_for_progression(exercise_id, 10)
            .await
            .unwrap();
        assert!(suggestion.is_none());
    }

    #[tokio::test]
    async fn test_low_rpe_takes_priority_over_reps_achieved() {
        let (mut aggregator, store) = aggregator();
        let exercise_id = Uuid::new_v4();
        let (s1, s2, s3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        // Both conditions hold: low RPE everywhere, targets met in 3 sessions
        store
            .seed_history(vec![
                history_set(s1, exercise_id, 12, 20.0, Some(5.0)),
                history_set(s2, exercise_id, 12, 20.0, Some(5.0)),
                history_set(s3, exercise_id, 12, 20.0, Some(6.0)),
            ])
            .await;

        let suggestion = aggregator
            .check_for_progression(exercise_id, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(suggestion.reason, ProgressionReason::LowRpe);
    }

    #[tokio::test]
    async fn test_reps_achieved_fires_without_rpe_data() {
        let (mut aggregator, store) = aggregator();
        let exercise_id = Uuid::new_v4();
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .seed_history(vec![
                history_set(s1, exercise_id, 10, 20.0, None),
                history_set(s2, exercise_id, 11, 20.0, None),
                history_set(s1, exercise_id, 10, 20.0, None),
            ])
            .await;

        let suggestion = aggregator
            .check_for_progression(exercise_id, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(suggestion.reason, ProgressionReason::RepsAchieved);
    }
}
