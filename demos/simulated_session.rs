//! Demonstration of a posture session against the simulated peripheral.
//!
//! This example shows how to:
//! 1. Connect a session to a simulated posture corrector
//! 2. Drive posture changes from a background script
//! 3. Fold posture events into day statistics
//! 4. Print the resulting summary
//!
//! Run with: cargo run --example simulated_session

use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use posture_agent::{
    activity::create_shared_log,
    device::{ConnectionSession, PeripheralProfile, PostureScript, SimulatedTransport},
    stats::{report, MemoryStore, PostureAggregator},
};

fn main() {
    println!("Posture Agent - Simulated Session Demo");
    println!("======================================");
    println!();

    let activity = create_shared_log();
    let transport = SimulatedTransport::new(PeripheralProfile::default());
    let peripheral = transport.peripheral();
    peripheral.set_value(b"ok");

    let mut session = ConnectionSession::new(transport).with_activity_log(activity.clone());
    let mut aggregator = PostureAggregator::new(MemoryStore::new()).with_activity_log(activity.clone());
    let (tx, rx) = unbounded();

    if let Err(e) = session.connect("D4:D4:DA:44:28:86", tx) {
        eprintln!("Failed to connect: {e}");
        return;
    }

    let _script = PostureScript::start(peripheral, Duration::from_millis(500), 0.4);
    println!("Recording for 6 seconds...");
    println!();

    let deadline = Instant::now() + Duration::from_secs(6);
    while Instant::now() < deadline {
        session.pump(Duration::from_millis(100));
        for event in rx.try_iter() {
            println!("  event: {event:?}");
            if let Err(e) = aggregator.handle_event(event) {
                eprintln!("  store error: {e}");
            }
        }
    }

    session.disconnect();
    for event in rx.try_iter() {
        println!("  event: {event:?}");
        let _ = aggregator.handle_event(event);
    }

    println!();
    match report::today(aggregator.store(), chrono::Local::now().date_naive()) {
        Ok(stat) => {
            println!("{}", report::format_summary(&stat));
            println!(
                "  (usage {}s, hunched {}s)",
                stat.usage_duration, stat.hunched_posture_duration
            );
        }
        Err(e) => eprintln!("Failed to read statistics: {e}"),
    }
    println!();
    println!("{}", activity.summary());
}
