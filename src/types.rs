use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration, time::SystemTime};
use uuid::Uuid;

/// Lifecycle state of a workout session
///
/// Exactly one `WorkoutState` is authoritative per session and it is owned
/// exclusively by the state machine. Transitions are total: every state has a
/// defined reaction to every event, even if the reaction is to ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkoutState {
    /// No session running; the initial and terminal state
    Idle,
    /// Countdown before the machine engages
    Initializing {
        /// Seconds remaining, counts 5 down to 1
        countdown_remaining: u8,
    },
    /// Actively lifting under tension
    Active,
    /// Positioned at a routine exercise/set, waiting for the first pull
    SetReady {
        /// Index into the routine's exercise list
        exercise_index: usize,
        /// Index into the exercise's set targets
        set_index: usize,
    },
    /// Resting between sets
    Resting {
        /// Seconds of rest remaining
        seconds_remaining: u32,
    },
    /// A set just finished; summary is on screen, machine disengaged
    SetSummary,
}

impl WorkoutState {
    /// Whether the machine should currently be under tension
    #[must_use]
    pub const fn is_engaged(&self) -> bool {
        matches!(self, Self::Active | Self::SetReady { .. })
    }
}

impl fmt::Display for WorkoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Initializing {
                countdown_remaining,
            } => write!(f, "Initializing({countdown_remaining})"),
            Self::Active => write!(f, "Active"),
            Self::SetReady {
                exercise_index,
                set_index,
            } => write!(f, "SetReady({exercise_index},{set_index})"),
            Self::Resting { seconds_remaining } => write!(f, "Resting({seconds_remaining})"),
            Self::SetSummary => write!(f, "SetSummary"),
        }
    }
}

/// Which phase of a rep the cable is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepPhase {
    /// Lifting phase, cable paying out against resistance
    Concentric,
    /// Lowering phase, cable retracting under control
    Eccentric,
}

/// One decoded motion telemetry sample
///
/// The trainer streams these at ~10 Hz while the cable is moving. Velocity is
/// signed (positive concentric); the LED resolvers work on its magnitude.
/// Smoothing is applied on the machine side before transmission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Cable velocity in m/s, signed by phase
    pub velocity: f32,
    /// Cable force in newtons
    pub force: f32,
    /// Cable extension in millimetres
    pub position_mm: u16,
    /// Current rep phase
    pub phase: RepPhase,
}

/// One of six ordered velocity bands, each mapped to a fixed color index
///
/// Bands are taken over the absolute velocity magnitude using fixed ascending
/// thresholds; see [`VelocityZone::from_velocity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VelocityZone {
    /// Bar not moving or barely moving
    Stalled,
    /// Grinding through a heavy rep
    Grind,
    /// Deliberate, slow tempo
    Slow,
    /// Steady working pace
    Steady,
    /// Fast, powerful movement
    Fast,
    /// Maximum intent, explosive speed
    Explosive,
}

/// Ascending zone boundaries in m/s over |velocity|
pub const ZONE_THRESHOLDS: [f32; 5] = [0.15, 0.30, 0.50, 0.75, 1.00];

impl VelocityZone {
    /// Map an absolute velocity magnitude to its zone
    #[must_use]
    pub fn from_velocity(velocity: f32) -> Self {
        let magnitude = velocity.abs();
        match ZONE_THRESHOLDS.iter().position(|t| magnitude < *t) {
            Some(0) => Self::Stalled,
            Some(1) => Self::Grind,
            Some(2) => Self::Slow,
            Some(3) => Self::Steady,
            Some(4) => Self::Fast,
            _ => Self::Explosive,
        }
    }

    /// Fixed color-scheme index for this zone (0..=5)
    #[must_use]
    pub const fn color_index(self) -> usize {
        match self {
            Self::Stalled => 0,
            Self::Grind => 1,
            Self::Slow => 2,
            Self::Steady => 3,
            Self::Fast => 4,
            Self::Explosive => 5,
        }
    }
}

impl fmt::Display for VelocityZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stalled => write!(f, "Stalled"),
            Self::Grind => write!(f, "Grind"),
            Self::Slow => write!(f, "Slow"),
            Self::Steady => write!(f, "Steady"),
            Self::Fast => write!(f, "Fast"),
            Self::Explosive => write!(f, "Explosive"),
        }
    }
}

/// An RGB color triple as sent in the color preset packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    /// Red channel
    pub r: u8,
    /// Green channel
    pub g: u8,
    /// Blue channel
    pub b: u8,
}

impl Rgb {
    /// Create a color from channel values
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Which resolver converts telemetry into a zone/color
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LedFeedbackMode {
    /// Color follows the velocity band of the current sample
    VelocityZone,
    /// Color compares actual rep cadence to a target tempo window
    TempoGuide {
        /// Target concentric duration in seconds
        concentric_secs: f32,
        /// Target eccentric duration in seconds
        eccentric_secs: f32,
    },
    /// Color follows the machine's resistance-level feedback
    Auto,
}

impl Default for LedFeedbackMode {
    fn default() -> Self {
        Self::VelocityZone
    }
}

/// Live configuration consumed by the feedback resolvers and the codec
///
/// Updated through the session's `update_workout_parameters`; a no-op while
/// the session is `Idle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutParameters {
    /// Concentric cable weight in kilograms
    pub weight_kg: f32,
    /// Eccentric cable weight in kilograms (often loaded heavier)
    pub eccentric_weight_kg: f32,
    /// Working reps for the current set; `None` means unlimited
    pub target_reps: Option<u8>,
    /// Warmup reps preceding the working reps
    pub warmup_reps: u8,
    /// Active feedback mode
    pub feedback_mode: LedFeedbackMode,
    /// LED brightness, 0.0..=1.0
    pub brightness: f32,
}

impl Default for WorkoutParameters {
    fn default() -> Self {
        Self {
            weight_kg: 10.0,
            eccentric_weight_kg: 10.0,
            target_reps: Some(10),
            warmup_reps: 0,
            feedback_mode: LedFeedbackMode::VelocityZone,
            brightness: 1.0,
        }
    }
}

/// Auto-stop thresholds, reset to defaults at every session start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoStopConfig {
    /// Whether auto-stop is armed
    pub enabled: bool,
    /// |velocity| below which the cable is considered slack, in m/s
    pub slack_velocity: f32,
    /// Force below which the cable is considered deloaded, in newtons
    pub slack_force: f32,
    /// How long the fault must persist before the session is stopped
    pub slack_duration: Duration,
}

impl Default for AutoStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slack_velocity: 0.02,
            slack_force: 5.0,
            slack_duration: Duration::from_secs(8),
        }
    }
}

/// Session-level timing and feedback configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WorkoutConfig {
    /// Countdown length in seconds before the machine engages
    pub countdown_seconds: u8,
    /// Interval between countdown ticks
    pub countdown_interval: Duration,
    /// Interval between rest-timer ticks
    pub rest_tick_interval: Duration,
    /// Rest length applied between sets when the routine does not override it
    pub default_rest_seconds: u32,
    /// Minimum spacing between non-forced color commands
    pub color_throttle: Duration,
    /// Consecutive agreeing samples required before a zone change is emitted
    pub hysteresis_samples: u8,
    /// Auto-stop defaults applied at each session start
    pub auto_stop: AutoStopConfig,
}

impl Default for WorkoutConfig {
    fn default() -> Self {
        Self {
            countdown_seconds: 5,
            countdown_interval: Duration::from_secs(1),
            rest_tick_interval: Duration::from_secs(1),
            default_rest_seconds: 90,
            color_throttle: Duration::from_millis(500),
            hysteresis_samples: 3,
            auto_stop: AutoStopConfig::default(),
        }
    }
}

/// An exercise within a routine, with its ordered per-set rep targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineExercise {
    /// Stable exercise identifier shared across sessions
    pub exercise_id: Uuid,
    /// Display name
    pub name: String,
    /// Target reps per set, in set order; `None` entries are unlimited sets
    pub set_rep_targets: Vec<Option<u8>>,
    /// Warmup reps before the working reps of each set
    pub warmup_reps: u8,
    /// Concentric cable weight in kilograms
    pub cable_weight_kg: f32,
    /// Rest after each set in seconds; `None` falls back to the session default
    pub rest_seconds: Option<u32>,
}

/// A group of exercises performed back to back with shared rest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Superset {
    /// Indices into the routine's exercise list
    pub exercise_indices: Vec<usize>,
    /// Rest after the full group, in seconds
    pub rest_seconds: u32,
}

/// An immutable workout plan, loaded once per session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    /// Routine identifier
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Ordered exercises
    pub exercises: Vec<RoutineExercise>,
    /// Superset groupings over the exercise list
    pub supersets: Vec<Superset>,
}

/// A finished set, immutable once persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedSet {
    /// Record identifier
    pub id: Uuid,
    /// Session this set belongs to
    pub session_id: Uuid,
    /// Exercise performed
    pub exercise_id: Uuid,
    /// Reps actually completed
    pub actual_reps: u32,
    /// Weight actually lifted in kilograms
    pub actual_weight_kg: f32,
    /// Logged Rate of Perceived Exertion (1-10), if the user entered one
    pub rpe: Option<f32>,
    /// Whether this set was flagged as a personal record
    pub is_personal_record: bool,
    /// Completion timestamp
    pub completed_at: SystemTime,
}

/// Per-rep force/velocity curves plus derived summaries
///
/// Owned by the rep aggregator until flushed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepMetricData {
    /// Set record these metrics belong to
    pub set_id: Uuid,
    /// Zero-based rep index within the set
    pub rep_index: u32,
    /// Ordered force samples from the concentric phase, in newtons
    pub concentric_force: Vec<f32>,
    /// Ordered force samples from the eccentric phase, in newtons
    pub eccentric_force: Vec<f32>,
    /// Ordered velocity samples from the concentric phase, in m/s
    pub concentric_velocity: Vec<f32>,
    /// Ordered velocity samples from the eccentric phase, in m/s
    pub eccentric_velocity: Vec<f32>,
    /// Rep duration in seconds
    pub duration_secs: f32,
}

impl RepMetricData {
    /// Peak force across both phases, in newtons
    #[must_use]
    pub fn peak_force(&self) -> f32 {
        self.concentric_force
            .iter()
            .chain(self.eccentric_force.iter())
            .fold(0.0_f32, |acc, f| acc.max(*f))
    }

    /// Mean force across both phases, in newtons
    #[must_use]
    pub fn average_force(&self) -> f32 {
        let count = self.concentric_force.len() + self.eccentric_force.len();
        if count == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .concentric_force
            .iter()
            .chain(self.eccentric_force.iter())
            .sum();
        #[allow(clippy::cast_precision_loss)]
        {
            sum / count as f32
        }
    }

    /// Mean concentric velocity, in m/s
    #[must_use]
    pub fn mean_concentric_velocity(&self) -> f32 {
        if self.concentric_velocity.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.concentric_velocity.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        {
            sum / self.concentric_velocity.len() as f32
        }
    }
}

/// Why a progression was suggested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressionReason {
    /// Recent sets show a sustained low perceived-effort trend
    LowRpe,
    /// The target rep count has been met across multiple sessions
    RepsAchieved,
}

impl fmt::Display for ProgressionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowRpe => write!(f, "low RPE trend"),
            Self::RepsAchieved => write!(f, "rep targets achieved"),
        }
    }
}

/// A weight-progression suggestion for an exercise
///
/// At most one pending event may exist per exercise; the rep aggregator
/// enforces this before emitting a new suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressionEvent {
    /// Exercise the suggestion applies to
    pub exercise_id: Uuid,
    /// Weight the exercise was last performed at, in kilograms
    pub previous_weight_kg: f32,
    /// Why the suggestion fired
    pub reason: ProgressionReason,
    /// Whether the user has accepted or dismissed the suggestion
    pub resolved: bool,
}
