#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

//! # Cablers 🏋️
//!
//! A Rust library for controlling cable-resistance trainers via Bluetooth
//! Low Energy.
//!
//! The crate drives a digital cable machine end to end: it encodes the
//! machine's binary command packets, decodes the live motion telemetry the
//! machine streams back, turns that telemetry into flicker-free LED
//! biofeedback, counts reps and sets, and owns the full workout lifecycle
//! (countdown, active lifting, rest, set summary, progression suggestions).
//!
//! ## Architecture
//!
//! - [`protocol`] — pure encode/decode over the trainer's BLE characteristic.
//! - [`link`] — the [`DeviceLink`](link::DeviceLink) transport abstraction;
//!   [`ble`] provides the btleplug-backed implementation.
//! - [`led`] — velocity-zone biofeedback with hysteresis and send throttling.
//! - [`reps`] — per-rep metric aggregation, set records, and progression
//!   analysis.
//! - [`session`] — the workout session state machine. All state mutation
//!   flows through one ordered event queue; user commands, decoded telemetry
//!   and timer ticks are processed strictly one at a time, so a user-initiated
//!   stop can never race an auto-stop.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cablers::{BleManager, MemoryStore, WorkoutConfig, WorkoutSession};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Discover and connect to a trainer
//!     let link = BleManager::connect_first().await?;
//!
//!     // Spin up a session against an in-memory store
//!     let store = Arc::new(MemoryStore::default());
//!     let session = WorkoutSession::spawn(Arc::new(link), store, None, WorkoutConfig::default());
//!
//!     // Count down 5..1, program the machine, start lifting
//!     session.start_workout(false).await?;
//!
//!     // ... lift ...
//!
//!     // Hard stop: releases cable tension and flushes the session summary
//!     session.stop_workout(true).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Safety Warning
//!
//! ⚠️ This library controls physical exercise equipment under load. Always
//! keep a physical means of releasing cable tension available and leave
//! auto-stop enabled unless you have a specific reason not to.

/// Bluetooth Low Energy transport backed by btleplug
pub mod ble;
/// Error types and handling
pub mod error;
/// LED biofeedback controller
pub mod led;
/// Device link abstraction consumed by the session core
pub mod link;
/// Protocol packet encoding and decoding
pub mod protocol;
/// Rep and set aggregation plus progression analysis
pub mod reps;
/// Workout session state machine
pub mod session;
/// Persistence collaborator contract
pub mod store;
/// Injectable time source for deterministic timing
pub mod time;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{BleLink, BleManager};
pub use error::{Result, TrainerError};
pub use led::{LedFeedbackController, ZonePipeline};
pub use link::{ConnectionState, DeviceLink};
pub use reps::RepAggregator;
pub use session::{SessionNotification, WorkoutSession, WorkoutStatus};
pub use store::{MemoryStore, SessionStore};
pub use types::{
    AutoStopConfig, CompletedSet, LedFeedbackMode, ProgressionEvent, ProgressionReason,
    RepMetricData, Routine, RoutineExercise, Superset, TelemetrySample, VelocityZone,
    WorkoutConfig, WorkoutParameters, WorkoutState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Trainer BLE control service UUID
///
/// Vendor service in the Nordic UART style carrying both the command
/// characteristic and the telemetry notification characteristic.
pub const TRAINER_SERVICE_UUID: &str = "A0E40000-7C3B-4D52-A8F1-2E90B14C6A01";

/// Telemetry characteristic UUID for machine-to-app notifications
///
/// The trainer streams motion samples, rep boundaries, load feedback and
/// fault frames on this characteristic at roughly 10 Hz while a cable is
/// moving.
pub const TRAINER_TX_CHAR_UUID: &str = "A0E40003-7C3B-4D52-A8F1-2E90B14C6A01";

/// Command characteristic UUID for app-to-machine packets
///
/// All outbound command packets documented in [`protocol`] are written to
/// this characteristic without response.
pub const TRAINER_RX_CHAR_UUID: &str = "A0E40002-7C3B-4D52-A8F1-2E90B14C6A01";

/// Manufacturer ID present in the trainer's BLE advertisement data
pub const TRAINER_MANUFACTURER_ID: u16 = 0x02E4;
