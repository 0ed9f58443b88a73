//! Live telemetry and LED zone monitor.
//!
//! Connects to a trainer and prints every decoded telemetry frame alongside
//! the velocity zone the LED controller would show, without starting a
//! workout. Useful for checking cable sensors and the zone thresholds.
//!
//! Run with: `cargo run --example led_monitor`

use cablers::{protocol, BleManager, DeviceLink, VelocityZone};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("🔍 Scanning for cable trainers...");
    let link = BleManager::connect_first().await?;
    println!("✅ Connected! Pull a cable to see telemetry. Ctrl-C to quit.\n");

    let mut notifications = link.notifications();
    loop {
        tokio::select! {
            frame = notifications.recv() => {
                let Ok(frame) = frame else { break };
                match protocol::decode(&frame) {
                    Ok(protocol::Notification::Motion(sample)) => {
                        let zone = VelocityZone::from_velocity(sample.velocity);
                        println!(
                            "{:>9?} | {:6.2} m/s | {:7.1} N | {:4} mm | {zone}",
                            sample.phase, sample.velocity, sample.force, sample.position_mm
                        );
                    }
                    Ok(protocol::Notification::RepBoundary { rep_count, duration_ms, .. }) => {
                        println!("── rep {rep_count} ({duration_ms} ms) ──");
                    }
                    Ok(protocol::Notification::LoadFeedback { resistance_kg }) => {
                        println!("   load feedback: {resistance_kg:.1} kg");
                    }
                    Ok(protocol::Notification::Fault { code }) => {
                        println!("⚠️  fault: {code:?}");
                    }
                    Err(e) => {
                        // Frames from other firmware features are expected
                        eprintln!("   undecoded frame: {e}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n🛑 Bye");
                break;
            }
        }
    }

    link.disconnect().await?;
    Ok(())
}
