//! Workout session state machine.
//!
//! The top-level orchestrator. One [`WorkoutState`] is authoritative per
//! session and every mutation of it flows through a single ordered event
//! queue: user commands, decoded telemetry, timer ticks and link-state
//! changes are all pushed onto the same `mpsc` channel and processed
//! strictly one at a time by one runner task. A command issued in reaction
//! to event N is written to the link before event N+1 is looked at, which is
//! what makes a user-initiated stop and a telemetry-driven auto-stop unable
//! to race each other.
//!
//! Timers are not special: the countdown and rest timers are small ticker
//! tasks that push events into the queue like everyone else, and cancelling
//! them is a plain task abort. Shutdown is one cancellation of one channel.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, TrainerError},
    led::{LedFeedbackController, CELEBRATION_STEPS, CELEBRATION_STEP_INTERVAL},
    link::{ConnectionState, DeviceLink},
    protocol::{self, Command, EchoConfig, FaultCode, Notification, ProgramParams},
    reps::RepAggregator,
    store::SessionStore,
    time::{SystemTime, TimeSource},
    types::{
        AutoStopConfig, CompletedSet, ProgressionEvent, Routine, TelemetrySample, WorkoutConfig,
        WorkoutParameters, WorkoutState,
    },
};

/// Point-in-time view of the session, published on a watch channel
#[derive(Debug, Clone)]
pub struct WorkoutStatus {
    /// Authoritative workout state
    pub state: WorkoutState,
    /// Reps completed in the current set
    pub rep_count: u32,
    /// Set when the session was forced to `Idle` by a link failure
    pub link_error: bool,
    /// Live parameters
    pub parameters: WorkoutParameters,
}

/// Things the session announces as they happen
///
/// Unlike the status watch (which coalesces), every notification is
/// delivered in order to subscribers that keep up.
#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// Countdown tick; values arrive strictly decreasing 5,4,3,2,1
    CountdownTick(u8),
    /// The authoritative state changed
    StateChanged(WorkoutState),
    /// A set was closed and queued for persistence
    SetCompleted(CompletedSet),
    /// Progression analysis produced a suggestion
    ProgressionSuggested(ProgressionEvent),
    /// The summary buffer was flushed; count of records still pending retry
    SessionSaved {
        /// Records that failed to persist and stay queued
        pending: usize,
    },
}

enum SessionCommand {
    Start {
        skip_countdown: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        exiting_workout: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Reset {
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateParameters {
        params: WorkoutParameters,
        reply: oneshot::Sender<Result<()>>,
    },
    EnterSetReady {
        exercise_index: usize,
        set_index: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    SetEchoMode {
        config: EchoConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Save {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

enum SessionEvent {
    Command(SessionCommand),
    Frame(Bytes),
    CountdownTick,
    RestTick,
    CelebrationStep(usize),
    LinkState(ConnectionState),
}

/// Public handle to a running session
///
/// Cheap to clone; all methods enqueue onto the session's event queue and
/// wait for the runner's reply, so callers observe the same serialization
/// the telemetry pipeline does.
#[derive(Clone)]
pub struct WorkoutSession {
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    status_rx: watch::Receiver<WorkoutStatus>,
    notify_tx: broadcast::Sender<SessionNotification>,
}

impl WorkoutSession {
    /// Spawn a session over a link and store
    ///
    /// The routine, when given, drives `enter_set_ready` validation and
    /// per-set parameter resolution; without one the session runs freestyle.
    #[must_use]
    pub fn spawn(
        link: Arc<dyn DeviceLink>,
        store: Arc<dyn SessionStore>,
        routine: Option<Routine>,
        config: WorkoutConfig,
    ) -> Self {
        Self::spawn_with_time(link, store, routine, config, Arc::new(SystemTime))
    }

    /// Spawn a session with an explicit time source
    ///
    /// Used by tests to drive throttle/hysteresis/auto-stop deterministically.
    #[must_use]
    pub fn spawn_with_time(
        link: Arc<dyn DeviceLink>,
        store: Arc<dyn SessionStore>,
        routine: Option<Routine>,
        config: WorkoutConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (notify_tx, _) = broadcast::channel(256);

        let session_id = Uuid::new_v4();
        let params = routine
            .as_ref()
            .and_then(|r| r.exercises.first())
            .map_or_else(WorkoutParameters::default, |exercise| WorkoutParameters {
                weight_kg: exercise.cable_weight_kg,
                eccentric_weight_kg: exercise.cable_weight_kg,
                target_reps: exercise.set_rep_targets.first().copied().flatten(),
                warmup_reps: exercise.warmup_reps,
                ..WorkoutParameters::default()
            });

        let (status_tx, status_rx) = watch::channel(WorkoutStatus {
            state: WorkoutState::Idle,
            rep_count: 0,
            link_error: false,
            parameters: params.clone(),
        });

        let led = LedFeedbackController::new(
            Arc::clone(&link),
            Arc::clone(&time),
            params.clone(),
            config.hysteresis_samples,
            config.color_throttle,
        );
        let reps = RepAggregator::new(store, session_id);

        let runner = SessionRunner {
            state: WorkoutState::Idle,
            config: config.clone(),
            params,
            routine,
            link: Arc::clone(&link),
            led,
            reps,
            time,
            auto_stop: config.auto_stop,
            fault_since: None,
            stop_in_progress: false,
            link_error: false,
            current_exercise: None,
            freestyle_exercise_id: Uuid::new_v4(),
            countdown_timer: None,
            rest_timer: None,
            celebration_timer: None,
            status_tx,
            notify_tx: notify_tx.clone(),
            event_tx: event_tx.clone(),
        };

        Self::spawn_link_pumps(&link, &event_tx);
        tokio::spawn(runner.run(event_rx));

        Self {
            event_tx,
            status_rx,
            notify_tx,
        }
    }

    /// Forward link notifications and connection-state changes into the
    /// single event queue
    fn spawn_link_pumps(link: &Arc<dyn DeviceLink>, event_tx: &mpsc::UnboundedSender<SessionEvent>) {
        let mut notifications = link.notifications();
        let tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(frame) => {
                        if tx.send(SessionEvent::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("telemetry pump lagged, {skipped} frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut states = link.connection_state();
        let tx = event_tx.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow();
                if tx.send(SessionEvent::LinkState(state)).is_err() {
                    break;
                }
            }
        });
    }

    async fn command(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> SessionCommand) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.event_tx
            .send(SessionEvent::Command(build(reply_tx)))
            .map_err(|_| TrainerError::SessionClosed)?;
        reply_rx.await.map_err(|_| TrainerError::SessionClosed)?
    }

    /// Begin a workout from `Idle`
    ///
    /// With `skip_countdown` false the session counts 5,4,3,2,1 at the
    /// configured interval before engaging the machine; with it true the
    /// machine engages immediately. Engaging always writes PROGRAM PARAMS
    /// followed by START.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidTransition`] unless the session is
    /// `Idle`, or a link error if the engage writes fail (the session then
    /// lands back in `Idle` with the error flag set).
    pub async fn start_workout(&self, skip_countdown: bool) -> Result<()> {
        self.command(|reply| SessionCommand::Start {
            skip_countdown,
            reply,
        })
        .await
    }

    /// Stop the workout from any non-`Idle` state
    ///
    /// Sends STOP as a forced write, cancels pending timers, and flushes the
    /// session summary exactly once. Ends in `Idle` when `exiting_workout`
    /// is true, `SetSummary` otherwise. A guard flag keeps a second queued
    /// stop from double-sending the command.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidTransition`] if called while `Idle`.
    pub async fn stop_workout(&self, exiting_workout: bool) -> Result<()> {
        self.command(|reply| SessionCommand::Stop {
            exiting_workout,
            reply,
        })
        .await
    }

    /// Clear rep count and rep-range accumulators
    ///
    /// Idempotent and valid from any state.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::SessionClosed`] only if the session runner is
    /// gone.
    pub async fn reset_for_new_workout(&self) -> Result<()> {
        self.command(|reply| SessionCommand::Reset { reply }).await
    }

    /// Replace the live configuration consumed by downstream resolvers
    ///
    /// A no-op (not an error) while the session is `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::SessionClosed`] only if the session runner is
    /// gone.
    pub async fn update_workout_parameters(&self, params: WorkoutParameters) -> Result<()> {
        self.command(|reply| SessionCommand::UpdateParameters { params, reply })
            .await
    }

    /// Position the session at a routine exercise/set
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidIndex`] if the indices fall outside
    /// the loaded routine, or [`TrainerError::InvalidTransition`] when no
    /// routine is loaded.
    pub async fn enter_set_ready(&self, exercise_index: usize, set_index: usize) -> Result<()> {
        self.command(|reply| SessionCommand::EnterSetReady {
            exercise_index,
            set_index,
            reply,
        })
        .await
    }

    /// Switch the machine into adaptive-resistance (echo) mode
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidTransition`] unless the machine is
    /// engaged, or an encoding error if the config violates its documented
    /// ranges.
    pub async fn set_echo_mode(&self, config: EchoConfig) -> Result<()> {
        self.command(|reply| SessionCommand::SetEchoMode { config, reply })
            .await
    }

    /// Flush accumulated sets and rep metrics to the persistence collaborator
    ///
    /// Always succeeds locally: records that fail to persist stay queued for
    /// the next flush.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::SessionClosed`] only if the session runner is
    /// gone.
    pub async fn save_workout_session(&self) -> Result<()> {
        self.command(|reply| SessionCommand::Save { reply }).await
    }

    /// Tear the session down, cancelling the event queue and all timers
    pub fn shutdown(&self) {
        let _ = self
            .event_tx
            .send(SessionEvent::Command(SessionCommand::Shutdown));
    }

    /// Current status snapshot
    #[must_use]
    pub fn status(&self) -> WorkoutStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribe to status updates
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<WorkoutStatus> {
        self.status_rx.clone()
    }

    /// Subscribe to ordered session notifications
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<SessionNotification> {
        self.notify_tx.subscribe()
    }
}

struct SessionRunner {
    state: WorkoutState,
    config: WorkoutConfig,
    params: WorkoutParameters,
    routine: Option<Routine>,
    link: Arc<dyn DeviceLink>,
    led: LedFeedbackController,
    reps: RepAggregator,
    time: Arc<dyn TimeSource>,
    auto_stop: AutoStopConfig,
    /// When the current sustained fault condition began
    fault_since: Option<Instant>,
    /// Guard against a second queued stop double-sending STOP
    stop_in_progress: bool,
    link_error: bool,
    /// Routine position, when driven by a routine
    current_exercise: Option<(usize, usize)>,
    freestyle_exercise_id: Uuid,
    countdown_timer: Option<JoinHandle<()>>,
    rest_timer: Option<JoinHandle<()>>,
    celebration_timer: Option<JoinHandle<()>>,
    status_tx: watch::Sender<WorkoutStatus>,
    notify_tx: broadcast::Sender<SessionNotification>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionRunner {
    async fn run(mut self, mut event_rx: mpsc::UnboundedReceiver<SessionEvent>) {
        // Reset handshake so the machine starts from a known state
        if let Err(e) = self.send_command(&Command::InitReset).await {
            warn!("init/reset handshake failed: {e}");
        }

        while let Some(event) = event_rx.recv().await {
            if self.handle_event(event).await {
                break;
            }
        }

        self.cancel_timers();
        info!("session runner stopped");
    }

    /// Process one event; returns true on shutdown
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Command(command) => return self.handle_command(command).await,
            SessionEvent::Frame(frame) => self.handle_frame(&frame).await,
            SessionEvent::CountdownTick => self.handle_countdown_tick().await,
            SessionEvent::RestTick => self.handle_rest_tick().await,
            SessionEvent::CelebrationStep(step) => self.handle_celebration_step(step).await,
            SessionEvent::LinkState(state) => self.handle_link_state(state).await,
        }
        false
    }

    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Start {
                skip_countdown,
                reply,
            } => {
                let result = self.start_workout(skip_countdown).await;
                let _ = reply.send(result);
            }
            SessionCommand::Stop {
                exiting_workout,
                reply,
            } => {
                let result = self.stop_workout(exiting_workout).await;
                let _ = reply.send(result);
            }
            SessionCommand::Reset { reply } => {
                self.reps.reset_for_new_workout();
                self.led.reset();
                self.publish_status();
                let _ = reply.send(Ok(()));
            }
            SessionCommand::UpdateParameters { params, reply } => {
                if self.state == WorkoutState::Idle {
                    debug!("parameter update ignored while idle");
                } else {
                    self.params = params;
                    self.led.set_parameters(self.params.clone());
                    self.publish_status();
                }
                let _ = reply.send(Ok(()));
            }
            SessionCommand::EnterSetReady {
                exercise_index,
                set_index,
                reply,
            } => {
                let result = self.enter_set_ready(exercise_index, set_index).await;
                let _ = reply.send(result);
            }
            SessionCommand::SetEchoMode { config, reply } => {
                let result = if self.state.is_engaged() {
                    self.send_command(&Command::EchoControl(config)).await
                } else {
                    Err(TrainerError::InvalidTransition {
                        operation: "set_echo_mode",
                        state: self.state.to_string(),
                    })
                };
                let _ = reply.send(result);
            }
            SessionCommand::Save { reply } => {
                self.save_session().await;
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Shutdown => {
                info!("session shutdown requested");
                return true;
            }
        }
        false
    }

    async fn start_workout(&mut self, skip_countdown: bool) -> Result<()> {
        if self.state != WorkoutState::Idle {
            return Err(TrainerError::InvalidTransition {
                operation: "start_workout",
                state: self.state.to_string(),
            });
        }

        info!("starting workout (skip_countdown: {skip_countdown})");
        // Each session start arms auto-stop with its defaults
        self.auto_stop = self.config.auto_stop;
        self.fault_since = None;
        self.stop_in_progress = false;
        self.link_error = false;
        self.reps.reset_for_new_workout();
        self.led.reset();

        if skip_countdown {
            return self.engage().await;
        }

        self.transition(WorkoutState::Initializing {
            countdown_remaining: self.config.countdown_seconds,
        });
        self.notify(SessionNotification::CountdownTick(
            self.config.countdown_seconds,
        ));
        self.spawn_countdown_timer();
        Ok(())
    }

    /// Program the machine, then start it
    async fn engage(&mut self) -> Result<()> {
        let program = Command::ProgramParams(ProgramParams {
            warmup_reps: self.params.warmup_reps,
            target_reps: self.params.target_reps,
            set_count: self.current_set_count(),
            rest_seconds: u16::try_from(self.config.default_rest_seconds).unwrap_or(u16::MAX),
            weight_kg: self.params.weight_kg,
            eccentric_weight_kg: self.params.eccentric_weight_kg,
        });
        self.send_command(&program).await?;
        self.send_command(&Command::Start {
            weight_kg: self.params.weight_kg,
            warmup_reps: self.params.warmup_reps,
            target_reps: self.params.target_reps,
        })
        .await?;
        self.transition(WorkoutState::Active);
        Ok(())
    }

    async fn stop_workout(&mut self, exiting_workout: bool) -> Result<()> {
        if self.state == WorkoutState::Idle {
            return Err(TrainerError::InvalidTransition {
                operation: "stop_workout",
                state: self.state.to_string(),
            });
        }

        self.cancel_timers();

        if self.stop_in_progress {
            // Another stop already ran the wire and save side effects
            debug!("stop already in progress, transition only");
            self.transition(if exiting_workout {
                WorkoutState::Idle
            } else {
                WorkoutState::SetSummary
            });
            return Ok(());
        }
        self.stop_in_progress = true;

        info!("stopping workout (exiting: {exiting_workout})");
        // Forced send: the stop command never waits out the throttle
        if let Err(e) = self.send_command(&Command::Stop).await {
            warn!("stop command failed on the wire: {e}");
            self.link_error = true;
        }
        if exiting_workout {
            // Release cable tension on the way out
            if let Err(e) = self.send_command(&Command::TensionRelease).await {
                warn!("tension release failed: {e}");
            }
        }
        if let Err(e) = self.led.force_off().await {
            warn!("led off failed: {e}");
        }

        self.close_open_set().await;
        // The session is persisted on every exit path, hard stop included
        self.save_session().await;

        self.transition(if exiting_workout || self.link_error {
            WorkoutState::Idle
        } else {
            WorkoutState::SetSummary
        });
        Ok(())
    }

    async fn enter_set_ready(&mut self, exercise_index: usize, set_index: usize) -> Result<()> {
        let Some(routine) = &self.routine else {
            return Err(TrainerError::InvalidTransition {
                operation: "enter_set_ready",
                state: "no routine loaded".to_string(),
            });
        };
        let Some(exercise) = routine.exercises.get(exercise_index) else {
            return Err(TrainerError::InvalidIndex {
                exercise_index,
                set_index,
            });
        };
        if set_index >= exercise.set_rep_targets.len() {
            return Err(TrainerError::InvalidIndex {
                exercise_index,
                set_index,
            });
        }

        self.params.weight_kg = exercise.cable_weight_kg;
        self.params.eccentric_weight_kg = exercise.cable_weight_kg;
        self.params.target_reps = exercise.set_rep_targets[set_index];
        self.params.warmup_reps = exercise.warmup_reps;
        self.led.set_parameters(self.params.clone());
        self.current_exercise = Some((exercise_index, set_index));

        let program = Command::ProgramParams(ProgramParams {
            warmup_reps: self.params.warmup_reps,
            target_reps: self.params.target_reps,
            set_count: self.current_set_count(),
            rest_seconds: u16::try_from(self.rest_seconds_for_current()).unwrap_or(u16::MAX),
            weight_kg: self.params.weight_kg,
            eccentric_weight_kg: self.params.eccentric_weight_kg,
        });
        self.send_command(&program).await?;

        self.transition(WorkoutState::SetReady {
            exercise_index,
            set_index,
        });
        Ok(())
    }

    async fn handle_frame(&mut self, frame: &[u8]) {
        let notification = match protocol::decode(frame) {
            Ok(notification) => notification,
            Err(e) => {
                // Malformed or unknown inbound bytes never crash the pipeline
                warn!("dropping inbound frame: {e}");
                return;
            }
        };

        match notification {
            Notification::Motion(sample) => self.handle_motion(sample).await,
            Notification::RepBoundary {
                rep_count,
                duration_ms,
                ..
            } => self.handle_rep_boundary(rep_count, duration_ms).await,
            Notification::LoadFeedback { resistance_kg } => {
                self.led.on_load_feedback(resistance_kg);
            }
            Notification::Fault { code } => self.handle_fault(code).await,
        }
    }

    async fn handle_motion(&mut self, sample: TelemetrySample) {
        // The first pull out of SetReady starts the set
        if let WorkoutState::SetReady { .. } = self.state {
            if sample.velocity.abs() > self.auto_stop.slack_velocity {
                self.transition(WorkoutState::Active);
            }
        }
        if self.state != WorkoutState::Active {
            return;
        }

        // Fan-out: aggregator and LED controller read the same sample
        self.reps.on_sample(sample);
        if let Err(e) = self.led.on_sample(sample).await {
            self.handle_link_failure(&e).await;
            return;
        }

        if sample.velocity.abs() >= self.auto_stop.slack_velocity
            || sample.force >= self.auto_stop.slack_force
        {
            self.fault_since = None;
        } else {
            self.check_auto_stop().await;
        }
    }

    async fn handle_rep_boundary(&mut self, machine_count: u16, duration_ms: u32) {
        if self.state != WorkoutState::Active {
            return;
        }
        self.reps.on_rep_boundary(duration_ms);
        debug!(
            "rep boundary: local {} machine {}",
            self.reps.rep_count(),
            machine_count
        );
        self.publish_status();

        let Some(target) = self.params.target_reps else {
            return; // unlimited set, the user decides when it ends
        };
        let total = u32::from(target) + u32::from(self.params.warmup_reps);
        if self.reps.rep_count() >= total {
            self.finish_set().await;
        }
    }

    /// Close the set, celebrate, and move into rest
    async fn finish_set(&mut self) {
        let set = self.close_open_set().await;
        if let Some(set) = set {
            if let Some(target) = self.params.target_reps {
                match self
                    .reps
                    .check_for_progression(set.exercise_id, u32::from(target))
                    .await
                {
                    Ok(Some(event)) => self.notify(SessionNotification::ProgressionSuggested(event)),
                    Ok(None) => {}
                    Err(e) => warn!("progression analysis failed: {e}"),
                }
            }
        }
        self.save_session().await;

        self.spawn_celebration_timer();

        let rest = self.rest_seconds_for_current();
        self.transition(WorkoutState::Resting {
            seconds_remaining: rest,
        });
        self.spawn_rest_timer();
    }

    async fn close_open_set(&mut self) -> Option<CompletedSet> {
        if self.reps.rep_count() == 0 {
            return None;
        }
        let exercise_id = self.current_exercise_id();
        let set = self
            .reps
            .complete_set(exercise_id, self.params.weight_kg, None)
            .await;
        self.notify(SessionNotification::SetCompleted(set.clone()));
        self.publish_status();
        Some(set)
    }

    async fn handle_fault(&mut self, code: FaultCode) {
        warn!("machine fault reported: {code:?}");
        match code {
            FaultCode::Overload => {
                // Overload releases tension immediately, then stops the set
                if let Err(e) = self.send_command(&Command::TensionRelease).await {
                    warn!("tension release after overload failed: {e}");
                }
                if self.state != WorkoutState::Idle {
                    let _ = self.stop_workout(false).await;
                }
            }
            FaultCode::CableSlack | FaultCode::Deload => {
                if self.state == WorkoutState::Active {
                    self.check_auto_stop().await;
                }
            }
            FaultCode::Unknown(byte) => {
                debug!("unknown fault byte {byte:02X} ignored");
            }
        }
    }

    /// Sustained slack/deload beyond the configured window forces a stop
    async fn check_auto_stop(&mut self) {
        if !self.auto_stop.enabled || self.state != WorkoutState::Active {
            return;
        }
        let now = self.time.now();
        match self.fault_since {
            None => self.fault_since = Some(now),
            Some(since) => {
                if now.duration_since(since) >= self.auto_stop.slack_duration {
                    warn!("auto-stop: sustained slack/deload condition");
                    self.fault_since = None;
                    let _ = self.stop_workout(false).await;
                }
            }
        }
    }

    async fn handle_countdown_tick(&mut self) {
        let WorkoutState::Initializing {
            countdown_remaining,
        } = self.state
        else {
            return; // stale tick after a stop; ignored by design of total transitions
        };

        if countdown_remaining > 1 {
            let next = countdown_remaining - 1;
            self.notify(SessionNotification::CountdownTick(next));
            self.transition(WorkoutState::Initializing {
                countdown_remaining: next,
            });
        } else {
            if let Some(timer) = self.countdown_timer.take() {
                timer.abort();
            }
            if let Err(e) = self.engage().await {
                self.handle_link_failure(&e).await;
            }
        }
    }

    async fn handle_rest_tick(&mut self) {
        let WorkoutState::Resting { seconds_remaining } = self.state else {
            return;
        };

        if seconds_remaining > 1 {
            self.transition(WorkoutState::Resting {
                seconds_remaining: seconds_remaining - 1,
            });
            return;
        }

        if let Some(timer) = self.rest_timer.take() {
            timer.abort();
        }

        // Rest over: advance within the routine when there is a next set
        let next = self.current_exercise.and_then(|(exercise, set)| {
            let routine = self.routine.as_ref()?;
            let targets = &routine.exercises.get(exercise)?.set_rep_targets;
            (set + 1 < targets.len()).then_some((exercise, set + 1))
        });
        match next {
            Some((exercise_index, set_index)) => {
                if let Err(e) = self.enter_set_ready(exercise_index, set_index).await {
                    warn!("advance to next set failed: {e}");
                    self.transition(WorkoutState::SetSummary);
                }
            }
            None => self.transition(WorkoutState::SetSummary),
        }
    }

    async fn handle_celebration_step(&mut self, step: usize) {
        if let Err(e) = self.led.force_celebration_step(step).await {
            warn!("celebration step failed: {e}");
            return;
        }
        if step + 1 == CELEBRATION_STEPS {
            if let Some(timer) = self.celebration_timer.take() {
                timer.abort();
            }
            let restored = if matches!(self.state, WorkoutState::Resting { .. }) {
                self.led.force_rest_color().await
            } else {
                self.led.restore_zone_color().await
            };
            if let Err(e) = restored {
                warn!("post-celebration color restore failed: {e}");
            }
        }
    }

    async fn handle_link_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {}
            ConnectionState::Reconnecting => {
                debug!("link reconnecting");
            }
            ConnectionState::Disconnected => {
                if self.state != WorkoutState::Idle {
                    error!("link lost mid-session");
                    self.cancel_timers();
                    self.close_open_set().await;
                    self.save_session().await;
                    self.link_error = true;
                    self.transition(WorkoutState::Idle);
                }
            }
        }
    }

    /// A failed write surfaces as a transition to `Idle` with the error
    /// flag; the write itself is never retried here
    async fn handle_link_failure(&mut self, error: &TrainerError) {
        error!("device link failure: {error}");
        self.cancel_timers();
        self.close_open_set().await;
        self.save_session().await;
        self.link_error = true;
        self.stop_in_progress = false;
        self.transition(WorkoutState::Idle);
    }

    async fn save_session(&mut self) {
        let pending = self.reps.flush().await;
        self.notify(SessionNotification::SessionSaved { pending });
    }

    async fn send_command(&self, command: &Command) -> Result<()> {
        let packet = protocol::encode(command)?;
        self.link.send(&packet).await
    }

    fn current_exercise_id(&self) -> Uuid {
        self.current_exercise
            .and_then(|(exercise, _)| {
                self.routine
                    .as_ref()
                    .and_then(|r| r.exercises.get(exercise))
                    .map(|e| e.exercise_id)
            })
            .unwrap_or(self.freestyle_exercise_id)
    }

    fn current_set_count(&self) -> u8 {
        self.current_exercise
            .and_then(|(exercise, _)| {
                let routine = self.routine.as_ref()?;
                let targets = routine.exercises.get(exercise)?.set_rep_targets.len();
                u8::try_from(targets).ok()
            })
            .unwrap_or(1)
    }

    fn rest_seconds_for_current(&self) -> u32 {
        self.current_exercise
            .and_then(|(exercise, _)| {
                self.routine
                    .as_ref()
                    .and_then(|r| r.exercises.get(exercise))
                    .and_then(|e| e.rest_seconds)
            })
            .unwrap_or(self.config.default_rest_seconds)
    }

    fn spawn_countdown_timer(&mut self) {
        self.abort_countdown();
        let tx = self.event_tx.clone();
        let interval = self.config.countdown_interval;
        self.countdown_timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                if tx.send(SessionEvent::CountdownTick).is_err() {
                    break;
                }
            }
        }));
    }

    fn spawn_rest_timer(&mut self) {
        if let Some(timer) = self.rest_timer.take() {
            timer.abort();
        }
        let tx = self.event_tx.clone();
        let interval = self.config.rest_tick_interval;
        self.rest_timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(SessionEvent::RestTick).is_err() {
                    break;
                }
            }
        }));
    }

    fn spawn_celebration_timer(&mut self) {
        if let Some(timer) = self.celebration_timer.take() {
            timer.abort();
        }
        let tx = self.event_tx.clone();
        self.celebration_timer = Some(tokio::spawn(async move {
            for step in 0..CELEBRATION_STEPS {
                if tx.send(SessionEvent::CelebrationStep(step)).is_err() {
                    break;
                }
                tokio::time::sleep(CELEBRATION_STEP_INTERVAL).await;
            }
        }));
    }

    fn abort_countdown(&mut self) {
        if let Some(timer) = self.countdown_timer.take() {
            timer.abort();
        }
    }

    fn cancel_timers(&mut self) {
        self.abort_countdown();
        if let Some(timer) = self.rest_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.celebration_timer.take() {
            timer.abort();
        }
    }

    fn transition(&mut self, next: WorkoutState) {
        if self.state != next {
            info!("state {} -> {}", self.state, next);
            self.state = next;
            self.notify(SessionNotification::StateChanged(next));
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(WorkoutStatus {
            state: self.state,
            rep_count: self.reps.rep_count(),
            link_error: self.link_error,
            parameters: self.params.clone(),
        });
    }

    fn notify(&self, notification: SessionNotification) {
        let _ = self.notify_tx.send(notification);
    }
}
