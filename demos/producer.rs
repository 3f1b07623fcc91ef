//! Example Producer
//!
//! Creates (or joins) a queue and pushes numbered messages into it.
//! Shape comes from VENOM_QUEUE_CAPACITY / VENOM_QUEUE_SLOT_SIZE.
//!
//!     cargo run --example producer -- /venom_demo 1000

use std::thread;
use std::time::{Duration, Instant};
use venom_queue::{OpenFlags, Queue, QueueConfig, QueueError};

fn main() {
    let mut args = std::env::args().skip(1);
    let name = args.next().unwrap_or_else(|| "/venom_demo".to_string());
    let total: u64 = args.next().and_then(|n| n.parse().ok()).unwrap_or(1000);

    println!("[Producer] Queue: {}", name);

    let config = QueueConfig::from_env();
    let queue = match Queue::open_with(&name, OpenFlags::CREATE | OpenFlags::PRODUCER, &config) {
        Ok(q) => q,
        Err(e) => {
            eprintln!("[Producer] Failed to open queue: {} ({})", e, e.status());
            std::process::exit(1);
        }
    };

    println!(
        "[Producer] {} queue: capacity={} slot_size={}",
        if queue.is_creator() { "Created" } else { "Joined" },
        queue.capacity(),
        queue.slot_size()
    );

    let start = Instant::now();
    let mut full_retries = 0u64;
    for seq in 0..total {
        let msg = format!("message #{} from pid {}", seq, std::process::id());
        loop {
            match queue.push(msg.as_bytes()) {
                Ok(()) => break,
                Err(QueueError::Full) => {
                    full_retries += 1;
                    thread::sleep(Duration::from_micros(100));
                }
                Err(e) => {
                    eprintln!("[Producer] Push failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "[Producer] Sent {} messages in {:.3}s ({:.0} msg/s, {} full retries)",
        total,
        elapsed,
        total as f64 / elapsed,
        full_retries
    );
    println!("[Producer] Queue left with {} messages; run `venomq unlink {}` to remove it",
        queue.len().unwrap_or(0), name);
}
