//! Example Consumer
//!
//! Attaches to an existing queue and drains it until it stays empty.
//!
//!     cargo run --example consumer -- /venom_demo

use std::thread;
use std::time::{Duration, Instant};
use venom_queue::{OpenFlags, Queue, QueueError};

const IDLE_LIMIT: Duration = Duration::from_secs(2);

fn main() {
    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/venom_demo".to_string());

    println!("[Consumer] Queue: {}", name);

    let queue = match Queue::open(&name, 0, 0, OpenFlags::CONSUMER) {
        Ok(q) => q,
        Err(e) => {
            eprintln!("[Consumer] Failed to attach: {} ({})", e, e.status());
            std::process::exit(1);
        }
    };

    let mut buf = vec![0u8; queue.slot_size()];
    let mut received = 0u64;
    let mut last_message = Instant::now();

    loop {
        match queue.pop(&mut buf) {
            Ok(len) => {
                received += 1;
                last_message = Instant::now();
                if received % 100 == 1 {
                    println!("[Consumer] {}", String::from_utf8_lossy(&buf[..len]));
                }
            }
            Err(QueueError::Empty) => {
                if last_message.elapsed() > IDLE_LIMIT {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                eprintln!("[Consumer] Pop failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    match queue.stats() {
        Ok(stats) => println!(
            "[Consumer] Received {} messages (queue totals: pushed={} popped={} recoveries={})",
            received, stats.total_pushed, stats.total_popped, stats.lock_recoveries
        ),
        Err(e) => eprintln!("[Consumer] Stats failed: {}", e),
    }
}
