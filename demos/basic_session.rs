//! Basic workout session example.
//!
//! Connects to the nearest trainer, runs a single ten-rep set at 20 kg with
//! the full countdown, prints session events as they happen, and stops after
//! a minute or on Ctrl-C.
//!
//! Run with: `cargo run --example basic_session`

use cablers::{
    BleManager, MemoryStore, SessionNotification, WorkoutConfig, WorkoutSession,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("🔍 Scanning for cable trainers...");
    let link = BleManager::connect_first().await?;
    println!("✅ Connected!");

    let store = Arc::new(MemoryStore::default());
    let session = WorkoutSession::spawn(
        Arc::new(link),
        Arc::clone(&store) as Arc<dyn cablers::SessionStore>,
        None,
        WorkoutConfig::default(),
    );

    let mut events = session.notifications();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionNotification::CountdownTick(n) => println!("⏱  {n}..."),
                SessionNotification::StateChanged(state) => println!("➡️  {state}"),
                SessionNotification::SetCompleted(set) => {
                    println!(
                        "💪 Set complete: {} reps at {:.1} kg{}",
                        set.actual_reps,
                        set.actual_weight_kg,
                        if set.is_personal_record { " 🏆 PR!" } else { "" }
                    );
                }
                SessionNotification::ProgressionSuggested(event) => {
                    println!(
                        "📈 Consider adding weight to this exercise ({})",
                        event.reason
                    );
                }
                SessionNotification::SessionSaved { pending } => {
                    println!("💾 Session saved ({pending} records pending retry)");
                }
            }
        }
    });

    println!("Starting workout with countdown...");
    session.start_workout(false).await?;

    // Lift until the timer runs out or the user bails
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(60)) => {
            println!("⏰ Time's up");
        }
        _ = tokio::signal::ctrl_c() => {
            println!("🛑 Interrupted");
        }
    }

    session.stop_workout(true).await?;
    println!(
        "Done. {} sets persisted this session.",
        store.completed_set_count().await
    );
    session.shutdown();
    Ok(())
}
