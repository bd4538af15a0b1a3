//! Travel Log Example
//!
//! Demonstrates document replication between two stores:
//! - Seeding a second device with a one-shot push
//! - Offline edits on both sides settled by the field merge resolver
//! - A continuous session picking up live changes
//! - Status and per-document listeners
//!
//! Run with: cargo run -p rust_travel_log

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use foliodb_replicator::{
    Activity, Direction, Endpoint, MergeResolver, Replicator, ReplicatorConfig,
};
use foliodb_store::{MemoryStore, ReplicaStore};

/// Builds a session configuration between two in-process stores.
fn session(local: &MemoryStore, target: &MemoryStore, direction: Direction) -> ReplicatorConfig {
    ReplicatorConfig::new(
        Arc::new(local.clone()),
        Arc::new(local.blobs()),
        Endpoint::local(Arc::new(target.clone()), Arc::new(target.blobs())),
        direction,
    )
}

/// Runs one session to completion, printing transitions as they happen.
fn run_and_report(replicator: &Replicator) {
    replicator.start().expect("start replication");
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut last = Activity::Stopped;
    let mut seen_running = false;
    while Instant::now() < deadline {
        let activity = replicator.status().activity;
        if activity != last {
            println!("  [~] {activity}");
            last = activity;
        }
        if activity.is_active() {
            seen_running = true;
        } else if seen_running {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    println!("  [!] session did not finish in time");
}

fn wait_until(secs: u64, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline && !done() {
        thread::sleep(Duration::from_millis(10));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Travel Log Example");
    println!("==================\n");

    // Two devices, each with its own store.
    let phone = MemoryStore::new();
    let laptop = MemoryStore::new();
    println!("[OK] Stores opened (phone and laptop)");

    println!("\n[+] Writing journal entries on the phone...");
    phone.save(
        "day-1-kyoto",
        &json!({"title": "Kyoto", "day": 1, "notes": "Fushimi Inari at dawn"}),
    )?;
    phone.save(
        "day-2-osaka",
        &json!({"title": "Osaka", "day": 2, "notes": "Okonomiyaki in Dotonbori"}),
    )?;
    phone.save(
        "day-3-nara",
        &json!({"title": "Nara", "day": 3, "notes": "Deer everywhere"}),
    )?;
    println!("[OK] {} entries saved", phone.document_count()?);

    // Seed the laptop with a one-shot push.
    println!("\n[*] Pushing the journal to the laptop...");
    let seed = Replicator::new(session(&phone, &laptop, Direction::Push));
    let traffic = seed.add_document_listener(|event| {
        let verb = if event.pushing { "sent" } else { "received" };
        match &event.error {
            Some(error) => println!("  [!] {} failed: {error}", event.doc_id),
            None => println!("  [>] {verb} {}", event.doc_id),
        }
    });
    run_and_report(&seed);
    seed.remove_document_listener(traffic);
    println!("[OK] Laptop now holds {} entries", laptop.document_count()?);

    // Both devices edit the same entry while apart.
    println!("\n[+] Editing day-1 on both devices while offline...");
    phone.save(
        "day-1-kyoto",
        &json!({
            "title": "Kyoto",
            "day": 1,
            "notes": "Fushimi Inari at dawn",
            "weather": "light rain",
        }),
    )?;
    laptop.save(
        "day-1-kyoto",
        &json!({
            "title": "Kyoto",
            "day": 1,
            "notes": "Fushimi Inari at dawn",
            "dinner": "yudofu near Nanzen-ji",
        }),
    )?;

    // Sync both ways and let the merge resolver fold the edits together.
    println!("\n[*] Syncing both ways with the field merge resolver...");
    let sync = Replicator::new(
        session(&phone, &laptop, Direction::PushAndPull).with_resolver(Arc::new(MergeResolver)),
    );
    run_and_report(&sync);

    let merged = phone.get("day-1-kyoto")?.expect("entry survives the merge");
    println!("[OK] Both edits survived: {merged}");
    assert_eq!(phone.get_raw("day-1-kyoto")?, laptop.get_raw("day-1-kyoto")?);
    println!("[OK] Phone and laptop expose the same revision");

    // Keep a live session running and let it pick up new entries.
    println!("\n[*] Starting a continuous session...");
    let live =
        Replicator::new(session(&phone, &laptop, Direction::PushAndPull).with_continuous(true));
    live.start()?;
    wait_until(10, || live.status().activity == Activity::Idle);
    println!("[OK] Session is idle and watching for changes");

    println!("\n[+] Writing day-4 on the laptop...");
    laptop.save(
        "day-4-kobe",
        &json!({"title": "Kobe", "day": 4, "notes": "Harbor lights at night"}),
    )?;
    wait_until(10, || {
        phone
            .get("day-4-kobe")
            .map(|doc| doc.is_some())
            .unwrap_or(false)
    });
    println!("[OK] day-4 arrived on the phone");

    live.stop();
    wait_until(10, || live.status().activity == Activity::Stopped);
    println!("[OK] Continuous session stopped");

    println!("\n[#] Summary:");
    println!("  Phone entries:  {}", phone.document_count()?);
    println!("  Laptop entries: {}", laptop.document_count()?);

    Ok(())
}
