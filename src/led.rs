//! LED biofeedback controller.
//!
//! Turns noisy motion telemetry into flicker-free color commands. Three
//! layers sit between a telemetry sample and the wire:
//!
//! 1. exponential smoothing — applied machine-side before transmission,
//!    assumed here;
//! 2. hysteresis — a candidate zone must repeat for a configured number of
//!    consecutive samples (default 3) before it replaces the emitted zone;
//! 3. throttle — a zone change goes to the link only if the throttle window
//!    (default 500 ms) has elapsed since the last color send.
//!
//! Forced sends (rest color, celebration steps, workout-end restoration)
//! bypass the throttle but never the hysteresis: the pipeline's accepted
//! zone survives a forced send, so normal resolution resumes from the last
//! known zone without flicker. A suppressed change is not an error; it is
//! coalesced into the next eligible send.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::{
    error::Result,
    link::DeviceLink,
    protocol::{self, Command},
    time::TimeSource,
    types::{LedFeedbackMode, RepPhase, Rgb, TelemetrySample, VelocityZone, WorkoutParameters},
};

/// The six-color zone scheme, in color-index order
pub const ZONE_COLORS: [Rgb; 6] = [
    Rgb::new(0x40, 0x40, 0x40), // stalled: dim white
    Rgb::new(0xFF, 0x20, 0x00), // grind: red
    Rgb::new(0xFF, 0x80, 0x00), // slow: orange
    Rgb::new(0xFF, 0xE0, 0x00), // steady: yellow
    Rgb::new(0x20, 0xE0, 0x20), // fast: green
    Rgb::new(0x80, 0x20, 0xFF), // explosive: purple
];

/// Color shown during rest periods
pub const REST_COLOR: Rgb = Rgb::new(0x00, 0x60, 0xFF);

/// All channels off
pub const COLOR_OFF: Rgb = Rgb::new(0, 0, 0);

/// Number of steps in the celebration sequence
pub const CELEBRATION_STEPS: usize = 18;

/// Spacing between celebration steps; 18 × 200 ms = 3.6 s
pub const CELEBRATION_STEP_INTERVAL: Duration = Duration::from_millis(200);

/// Color for a given celebration step
///
/// Three full cycles through the six zone colors in scheme order. The
/// sequence is deterministic so tests (and users) always see the same show.
#[must_use]
pub fn celebration_color(step: usize) -> Rgb {
    ZONE_COLORS[step % ZONE_COLORS.len()]
}

/// Hysteresis + throttle decision core
///
/// Pure except for reading the injected [`TimeSource`]; owns no IO. Feed it
/// candidate zones with [`ZonePipeline::observe`]; it answers with the zone
/// to emit, if any.
pub struct ZonePipeline {
    time: Arc<dyn TimeSource>,
    hysteresis_samples: u8,
    throttle: Duration,
    /// Zone that has survived hysteresis
    accepted: Option<VelocityZone>,
    /// Zone last put on the wire
    sent: Option<VelocityZone>,
    candidate: Option<(VelocityZone, u8)>,
    last_sent_at: Option<Instant>,
}

impl ZonePipeline {
    /// Create a pipeline with the given suppression settings
    #[must_use]
    pub fn new(time: Arc<dyn TimeSource>, hysteresis_samples: u8, throttle: Duration) -> Self {
        Self {
            time,
            hysteresis_samples: hysteresis_samples.max(1),
            throttle,
            accepted: None,
            sent: None,
            candidate: None,
            last_sent_at: None,
        }
    }

    /// Feed one candidate zone; returns the zone to send, if eligible
    pub fn observe(&mut self, zone: VelocityZone) -> Option<VelocityZone> {
        if Some(zone) == self.accepted {
            self.candidate = None;
        } else {
            let count = match self.candidate {
                Some((candidate, count)) if candidate == zone => count + 1,
                _ => 1,
            };
            if count >= self.hysteresis_samples {
                self.accepted = Some(zone);
                self.candidate = None;
            } else {
                self.candidate = Some((zone, count));
            }
        }

        self.eligible_send()
    }

    /// A pending accepted zone becomes sendable once the throttle window has
    /// elapsed; suppressed changes coalesce into this call
    fn eligible_send(&mut self) -> Option<VelocityZone> {
        let accepted = self.accepted?;
        if Some(accepted) == self.sent {
            return None;
        }
        let now = self.time.now();
        let open = self
            .last_sent_at
            .is_none_or(|at| now.duration_since(at) >= self.throttle);
        if !open {
            trace!("zone change to {accepted} throttled");
            return None;
        }
        self.sent = Some(accepted);
        self.last_sent_at = Some(now);
        Some(accepted)
    }

    /// Record a forced send; bypasses the throttle but keeps the accepted
    /// zone so resolution resumes without flicker
    pub fn note_forced_send(&mut self) {
        self.last_sent_at = Some(self.time.now());
        // Whatever is on the wire now is not a zone color
        self.sent = None;
    }

    /// Zone currently surviving hysteresis, if any
    #[must_use]
    pub const fn accepted_zone(&self) -> Option<VelocityZone> {
        self.accepted
    }

    /// Drop all accumulated zone state
    pub fn reset(&mut self) {
        self.accepted = None;
        self.sent = None;
        self.candidate = None;
    }
}

/// Drives the trainer's LED ring from live telemetry
///
/// The highest-rate consumer of the telemetry stream. Resolves each sample
/// to a candidate zone via the active mode's resolver, runs it through the
/// [`ZonePipeline`], and emits color preset packets over the [`DeviceLink`].
pub struct LedFeedbackController {
    link: Arc<dyn DeviceLink>,
    time: Arc<dyn TimeSource>,
    pipeline: ZonePipeline,
    params: WorkoutParameters,
    /// Last resistance level reported by the machine, for the auto resolver
    last_resistance_kg: Option<f32>,
    /// Tempo tracking: current phase and when it started
    phase: Option<(RepPhase, Instant)>,
    /// Zone resolved by the last completed tempo phase
    tempo_zone: Option<VelocityZone>,
}

impl LedFeedbackController {
    /// Create a controller over a link
    #[must_use]
    pub fn new(
        link: Arc<dyn DeviceLink>,
        time: Arc<dyn TimeSource>,
        params: WorkoutParameters,
        hysteresis_samples: u8,
        throttle: Duration,
    ) -> Self {
        let pipeline = ZonePipeline::new(Arc::clone(&time), hysteresis_samples, throttle);
        Self {
            link,
            time,
            pipeline,
            params,
            last_resistance_kg: None,
            phase: None,
            tempo_zone: None,
        }
    }

    /// Replace the live parameters consumed by the resolvers
    pub fn set_parameters(&mut self, params: WorkoutParameters) {
        self.params = params;
    }

    /// Zone currently accepted by the pipeline
    #[must_use]
    pub const fn current_zone(&self) -> Option<VelocityZone> {
        self.pipeline.accepted_zone()
    }

    /// Consume one telemetry sample, possibly emitting a color command
    ///
    /// # Errors
    ///
    /// Returns a link error if an emission fails to write.
    pub async fn on_sample(&mut self, sample: TelemetrySample) -> Result<()> {
        self.track_phase(sample.phase);
        let zone = self.resolve(sample);
        if let Some(zone) = self.pipeline.observe(zone) {
            debug!("emitting zone color {zone}");
            self.send_zone(zone).await?;
        }
        Ok(())
    }

    /// Consume a resistance-level feedback frame (auto mode input)
    pub fn on_load_feedback(&mut self, resistance_kg: f32) {
        self.last_resistance_kg = Some(resistance_kg);
    }

    /// Force the rest-period color, bypassing the throttle
    ///
    /// # Errors
    ///
    /// Returns a link error if the write fails.
    pub async fn force_rest_color(&mut self) -> Result<()> {
        self.force_color(REST_COLOR).await
    }

    /// Force one celebration step, bypassing the throttle
    ///
    /// # Errors
    ///
    /// Returns a link error if the write fails.
    pub async fn force_celebration_step(&mut self, step: usize) -> Result<()> {
        self.force_color(celebration_color(step)).await
    }

    /// Restore the pre-celebration zone color (workout-end restoration)
    ///
    /// Forced; resumes from the pipeline's last accepted zone so there is no
    /// flicker when normal resolution picks back up.
    ///
    /// # Errors
    ///
    /// Returns a link error if the write fails.
    pub async fn restore_zone_color(&mut self) -> Result<()> {
        let color = self
            .pipeline
            .accepted_zone()
            .map_or(COLOR_OFF, |zone| ZONE_COLORS[zone.color_index()]);
        self.force_color(color).await
    }

    /// Force the LEDs off (session stop)
    ///
    /// # Errors
    ///
    /// Returns a link error if the write fails.
    pub async fn force_off(&mut self) -> Result<()> {
        self.force_color(COLOR_OFF).await
    }

    /// Clear zone and tempo state for a fresh set
    pub fn reset(&mut self) {
        self.pipeline.reset();
        self.phase = None;
        self.tempo_zone = None;
        self.last_resistance_kg = None;
    }

    async fn send_zone(&mut self, zone: VelocityZone) -> Result<()> {
        let color = ZONE_COLORS[zone.color_index()];
        self.write_preset(color).await
    }

    async fn force_color(&mut self, color: Rgb) -> Result<()> {
        self.pipeline.note_forced_send();
        self.write_preset(color).await
    }

    /// The machine lights the first triple; the remaining slots preload the
    /// zone scheme
    async fn write_preset(&self, active: Rgb) -> Result<()> {
        let mut colors = ZONE_COLORS;
        colors[0] = active;
        let packet = protocol::encode(&Command::ColorPreset {
            brightness: self.params.brightness,
            colors,
        })?;
        self.link.send(&packet).await
    }

    fn resolve(&mut self, sample: TelemetrySample) -> VelocityZone {
        match self.params.feedback_mode {
            LedFeedbackMode::VelocityZone => VelocityZone::from_velocity(sample.velocity),
            LedFeedbackMode::TempoGuide { .. } => {
                self.tempo_zone.unwrap_or(VelocityZone::Steady)
            }
            LedFeedbackMode::Auto => self.resolve_load_zone(),
        }
    }

    /// Tempo mode grades each phase as it completes: the finished phase's
    /// duration against its target decides the zone shown through the next
    /// phase
    fn track_phase(&mut self, phase: RepPhase) {
        let now = self.time.now();
        match self.phase {
            None => self.phase = Some((phase, now)),
            Some((current, started)) if current != phase => {
                if let LedFeedbackMode::TempoGuide {
                    concentric_secs,
                    eccentric_secs,
                } = self.params.feedback_mode
                {
                    let target = match current {
                        RepPhase::Concentric => concentric_secs,
                        RepPhase::Eccentric => eccentric_secs,
                    };
                    let actual = now.duration_since(started).as_secs_f32();
                    self.tempo_zone = Some(Self::grade_tempo(actual, target));
                }
                self.phase = Some((phase, now));
            }
            Some(_) => {}
        }
    }

    fn grade_tempo(actual_secs: f32, target_secs: f32) -> VelocityZone {
        if target_secs <= 0.0 {
            return VelocityZone::Steady;
        }
        let ratio = actual_secs / target_secs;
        if ratio < 0.5 {
            VelocityZone::Explosive
        } else if ratio < 0.8 {
            VelocityZone::Fast
        } else if ratio <= 1.25 {
            VelocityZone::Steady
        } else if ratio <= 1.6 {
            VelocityZone::Slow
        } else {
            VelocityZone::Grind
        }
    }

    fn resolve_load_zone(&self) -> VelocityZone {
        let Some(resistance) = self.last_resistance_kg else {
            return VelocityZone::Stalled;
        };
        if self.params.weight_kg <= 0.0 {
            return VelocityZone::Stalled;
        }
        let ratio = resistance / self.params.weight_kg;
        if ratio < 0.25 {
            VelocityZone::Stalled
        } else if ratio < 0.5 {
            VelocityZone::Grind
        } else if ratio < 0.75 {
            VelocityZone::Slow
        } else if ratio < 1.0 {
            VelocityZone::Steady
        } else if ratio < 1.25 {
            VelocityZone::Fast
        } else {
            VelocityZone::Explosive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::RecordingLink;
    use crate::time::ManualTime;
    use crate::types::WorkoutConfig;

    fn pipeline(time: Arc<ManualTime>) -> ZonePipeline {
        let config = WorkoutConfig::default();
        ZonePipeline::new(time, config.hysteresis_samples, config.color_throttle)
    }

    fn sample(velocity: f32) -> TelemetrySample {
        TelemetrySample {
            velocity,
            force: 100.0,
            position_mm: 300,
            phase: RepPhase::Concentric,
        }
    }

    #[test]
    fn test_hysteresis_requires_three_consecutive_samples() {
        let time = Arc::new(ManualTime::new());
        let mut pipeline = pipeline(Arc::clone(&time));

        assert_eq!(pipeline.observe(VelocityZone::Steady), None);
        assert_eq!(pipeline.observe(VelocityZone::Steady), None);
        // Third consecutive agreement emits
        assert_eq!(
            pipeline.observe(VelocityZone::Steady),
            Some(VelocityZone::Steady)
        );
    }

    #[test]
    fn test_alternating_zones_never_emit() {
        // 10 samples alternating between two zones produce zero emissions;
        // 3 consecutive samples then produce exactly one.
        let time = Arc::new(ManualTime::new());
        let mut pipeline = pipeline(Arc::clone(&time));

        let mut emissions = 0;
        for i in 0..10 {
            let zone = if i % 2 == 0 {
                VelocityZone::Slow
            } else {
                VelocityZone::Steady
            };
            time.advance(Duration::from_millis(600));
            if pipeline.observe(zone).is_some() {
                emissions += 1;
            }
        }
        assert_eq!(emissions, 0);

        for _ in 0..3 {
            time.advance(Duration::from_millis(600));
            if pipeline.observe(VelocityZone::Steady).is_some() {
                emissions += 1;
            }
        }
        assert_eq!(emissions, 1);
    }

    #[test]
    fn test_throttle_coalesces_suppressed_change() {
        let time = Arc::new(ManualTime::new());
        let mut pipeline = pipeline(Arc::clone(&time));

        // Establish a first zone
        for _ in 0..3 {
            pipeline.observe(VelocityZone::Slow);
        }
        assert_eq!(pipeline.accepted_zone(), Some(VelocityZone::Slow));

        // New zone passes hysteresis inside the throttle window: suppressed
        for _ in 0..3 {
            assert_eq!(pipeline.observe(VelocityZone::Fast), None);
        }

        // Window opens; the pending change rides the next sample out
        time.advance(Duration::from_millis(500));
        assert_eq!(
            pipeline.observe(VelocityZone::Fast),
            Some(VelocityZone::Fast)
        );
    }

    #[test]
    fn test_no_two_sends_inside_throttle_window() {
        let time = Arc::new(ManualTime::new());
        let mut pipeline = pipeline(Arc::clone(&time));

        let zones = [
            VelocityZone::Slow,
            VelocityZone::Steady,
            VelocityZone::Fast,
            VelocityZone::Explosive,
        ];
        let mut last_send_at: Option<Instant> = None;
        for zone in zones {
            for _ in 0..4 {
                time.advance(Duration::from_millis(100));
                if pipeline.observe(zone).is_some() {
                    let now = time.now();
                    if let Some(prev) = last_send_at {
                        assert!(now.duration_since(prev) >= Duration::from_millis(500));
                    }
                    last_send_at = Some(now);
                }
            }
        }
        assert!(last_send_at.is_some());
    }

    #[test]
    fn test_forced_send_does_not_clear_accepted_zone() {
        let time = Arc::new(ManualTime::new());
        let mut pipeline = pipeline(Arc::clone(&time));

        for _ in 0..3 {
            pipeline.observe(VelocityZone::Fast);
        }
        pipeline.note_forced_send();
        assert_eq!(pipeline.accepted_zone(), Some(VelocityZone::Fast));

        // Same zone after the forced send: re-emitted once the window opens,
        // so the ring returns to the pre-forced color without flicker
        time.advance(Duration::from_millis(500));
        assert_eq!(
            pipeline.observe(VelocityZone::Fast),
            Some(VelocityZone::Fast)
        );
        // And only once
        time.advance(Duration::from_millis(500));
        assert_eq!(pipeline.observe(VelocityZone::Fast), None);
    }

    #[test]
    fn test_celebration_sequence_shape() {
        // Six colors, three full cycles, fixed order
        assert_eq!(CELEBRATION_STEPS, 18);
        assert_eq!(
            CELEBRATION_STEP_INTERVAL * u32::try_from(CELEBRATION_STEPS).unwrap(),
            Duration::from_millis(3600)
        );
        for step in 0..CELEBRATION_STEPS {
            assert_eq!(celebration_color(step), ZONE_COLORS[step % 6]);
        }
    }

    #[tokio::test]
    async fn test_controller_emits_color_packet_after_hysteresis() {
        let link = Arc::new(RecordingLink::default());
        let time = Arc::new(ManualTime::new());
        let mut controller = LedFeedbackController::new(
            Arc::clone(&link) as Arc<dyn DeviceLink>,
            Arc::clone(&time) as Arc<dyn TimeSource>,
            WorkoutParameters::default(),
            3,
            Duration::from_millis(500),
        );

        for _ in 0..3 {
            controller.on_sample(sample(0.6)).await.unwrap();
        }

        let frames = link.frames_with_opcode(0x11);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 34);
        // Active slot carries the steady-zone color
        let steady = ZONE_COLORS[VelocityZone::Steady.color_index()];
        assert_eq!(&frames[0][16..19], &[steady.r, steady.g, steady.b]);
    }

    #[tokio::test]
    async fn test_forced_rest_color_bypasses_throttle() {
        let link = Arc::new(RecordingLink::default());
        let time = Arc::new(ManualTime::new());
        let mut controller = LedFeedbackController::new(
            Arc::clone(&link) as Arc<dyn DeviceLink>,
            Arc::clone(&time) as Arc<dyn TimeSource>,
            WorkoutParameters::default(),
            3,
            Duration::from_millis(500),
        );

        for _ in 0..3 {
            controller.on_sample(sample(0.6)).await.unwrap();
        }
        // No time has advanced, yet the forced send goes out immediately
        controller.force_rest_color().await.unwrap();

        let frames = link.frames_with_opcode(0x11);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            &frames[1][16..19],
            &[REST_COLOR.r, REST_COLOR.g, REST_COLOR.b]
        );
    }

    #[tokio::test]
    async fn test_tempo_mode_grades_completed_phase() {
        let link = Arc::new(RecordingLink::default());
        let time = Arc::new(ManualTime::new());
        let params = WorkoutParameters {
            feedback_mode: LedFeedbackMode::TempoGuide {
                concentric_secs: 2.0,
                eccentric_secs: 3.0,
            },
            ..WorkoutParameters::default()
        };
        let mut controller = LedFeedbackController::new(
            Arc::clone(&link) as Arc<dyn DeviceLink>,
            Arc::clone(&time) as Arc<dyn TimeSource>,
            params,
            1,
            Duration::from_millis(0),
        );

        // Concentric phase lasting 2.0s: on pace
        controller
            .on_sample(TelemetrySample {
                phase: RepPhase::Concentric,
                ..sample(0.5)
            })
            .await
            .unwrap();
        time.advance(Duration::from_secs(2));
        controller
            .on_sample(TelemetrySample {
                phase: RepPhase::Eccentric,
                ..sample(-0.5)
            })
            .await
            .unwrap();

        assert_eq!(controller.current_zone(), Some(VelocityZone::Steady));
    }

    #[tokio::test]
    async fn test_auto_mode_follows_resistance_feedback() {
        let link = Arc::new(RecordingLink::default());
        let time = Arc::new(ManualTime::new());
        let params = WorkoutParameters {
            weight_kg: 40.0,
            feedback_mode: LedFeedbackMode::Auto,
            ..WorkoutParameters::default()
        };
        let mut controller = LedFeedbackController::new(
            Arc::clone(&link) as Arc<dyn DeviceLink>,
            Arc::clone(&time) as Arc<dyn TimeSource>,
            params,
            1,
            Duration::from_millis(0),
        );

        controller.on_load_feedback(38.0);
        controller.on_sample(sample(0.1)).await.unwrap();
        // 38/40 = 0.95: just under the programmed load
        assert_eq!(controller.current_zone(), Some(VelocityZone::Steady));
    }
}
