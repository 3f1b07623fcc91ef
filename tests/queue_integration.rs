use std::process::{Child, Command};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use venom_queue::{diagnose, OpenFlags, Queue, QueueError, QueueState, Status};

const CHILD_QUEUE_ENV: &str = "VENOM_QUEUE_TEST_CHILD_QUEUE";

fn unique(tag: &str) -> String {
    let name = format!("/venom_it_{}_{}", tag, std::process::id());
    let _ = Queue::unlink(&name);
    name
}

fn all_roles() -> OpenFlags {
    OpenFlags::CREATE | OpenFlags::PRODUCER | OpenFlags::CONSUMER
}

fn pop_string(q: &Queue) -> Result<String, QueueError> {
    let bytes = q.pop_vec(q.slot_size())?;
    Ok(String::from_utf8(bytes).unwrap())
}

/// Re-run this test binary restricted to a single child test
fn spawn_child(test: &str, queue: &str) -> Child {
    Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture"])
        .env(CHILD_QUEUE_ENV, queue)
        .spawn()
        .unwrap()
}

#[test]
fn test_capacity_scenario() {
    let name = unique("capacity");
    let q = Queue::open(&name, 4, 64, all_roles()).unwrap();

    for i in 0..4 {
        q.push(format!("msg-{}", i).as_bytes()).unwrap();
    }
    let err = q.push(b"overflow").unwrap_err();
    assert_eq!(err.status(), Status::Full);

    assert_eq!(pop_string(&q).unwrap(), "msg-0");
    q.push(b"new").unwrap();

    for expected in ["msg-1", "msg-2", "msg-3", "new"] {
        assert_eq!(pop_string(&q).unwrap(), expected);
    }
    assert_eq!(pop_string(&q).unwrap_err().status(), Status::Empty);

    Queue::unlink(&name).unwrap();
}

#[test]
fn test_producer_consumer_handles() {
    let name = unique("roles");
    let producer = Queue::open(&name, 64, 128, OpenFlags::CREATE | OpenFlags::PRODUCER).unwrap();
    let consumer = Queue::open(&name, 0, 0, OpenFlags::CONSUMER).unwrap();

    producer.push(b"Unit Test Message").unwrap();

    let mut buf = [0u8; 128];
    let len = consumer.pop(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"Unit Test Message");
    assert!(matches!(consumer.pop(&mut buf), Err(QueueError::Empty)));

    producer.close().unwrap();
    consumer.close().unwrap();
    Queue::unlink(&name).unwrap();
}

#[test]
fn test_fresh_queue_is_empty() {
    let name = unique("fresh");
    let q = Queue::open(&name, 8, 16, all_roles()).unwrap();
    assert!(q.is_empty().unwrap());
    assert!(!q.is_full().unwrap());
    assert!(matches!(q.pop_vec(16), Err(QueueError::Empty)));
    Queue::unlink(&name).unwrap();
}

#[test]
fn test_fifo_across_handles() {
    let name = unique("fifo");
    let p1 = Queue::open(&name, 32, 32, OpenFlags::CREATE | OpenFlags::PRODUCER).unwrap();
    let p2 = Queue::open(&name, 0, 0, OpenFlags::PRODUCER).unwrap();
    let c1 = Queue::open(&name, 0, 0, OpenFlags::CONSUMER).unwrap();
    let c2 = Queue::open(&name, 0, 0, OpenFlags::CONSUMER).unwrap();

    for i in 0..20 {
        let producer = if i % 3 == 0 { &p1 } else { &p2 };
        producer.push(format!("{:02}", i).as_bytes()).unwrap();
    }
    for i in 0..20 {
        let consumer = if i % 2 == 0 { &c1 } else { &c2 };
        assert_eq!(pop_string(consumer).unwrap(), format!("{:02}", i));
    }
    assert!(matches!(pop_string(&c1), Err(QueueError::Empty)));

    Queue::unlink(&name).unwrap();
}

#[test]
fn test_size_bounds() {
    let name = unique("size");
    let q = Queue::open(&name, 4, 8, all_roles()).unwrap();

    let err = q.push(b"nine bytes").unwrap_err();
    assert_eq!(err.status(), Status::TooBig);
    assert_eq!(q.len().unwrap(), 0);

    q.push(b"eight!!!").unwrap();
    let mut small = [0u8; 3];
    let err = q.pop(&mut small).unwrap_err();
    assert_eq!(err.status(), Status::TooBig);
    assert!(matches!(err, QueueError::BufferTooSmall { needed: 8, capacity: 3 }));
    assert_eq!(q.len().unwrap(), 1);

    let mut large = [0u8; 8];
    assert_eq!(q.pop(&mut large).unwrap(), 8);
    assert_eq!(&large, b"eight!!!");

    Queue::unlink(&name).unwrap();
}

#[test]
fn test_attach_consistency() {
    let name = unique("consistency");
    let a = Queue::open(&name, 8, 32, all_roles()).unwrap();
    let b = Queue::open(&name, 0, 0, OpenFlags::PRODUCER | OpenFlags::CONSUMER).unwrap();

    a.push(b"one").unwrap();
    assert_eq!((a.len().unwrap(), b.len().unwrap()), (1, 1));
    b.push(b"two").unwrap();
    assert_eq!((a.len().unwrap(), b.len().unwrap()), (2, 2));
    assert_eq!(pop_string(&b).unwrap(), "one");
    assert_eq!((a.len().unwrap(), b.len().unwrap()), (1, 1));

    Queue::unlink(&name).unwrap();
}

#[test]
fn test_attach_only_shape_checks() {
    let name = unique("shape");
    let _q = Queue::open(&name, 8, 32, OpenFlags::CREATE | OpenFlags::PRODUCER).unwrap();

    let err = Queue::open(&name, 16, 32, OpenFlags::CONSUMER).err().unwrap();
    assert!(matches!(err, QueueError::ShapeMismatch { field: "capacity", .. }));
    assert_eq!(err.status(), Status::Invalid);

    let err = Queue::open(&name, 8, 64, OpenFlags::CONSUMER).err().unwrap();
    assert!(matches!(err, QueueError::ShapeMismatch { field: "slot_size", .. }));

    let exact = Queue::open(&name, 8, 32, OpenFlags::CONSUMER).unwrap();
    assert_eq!((exact.capacity(), exact.slot_size()), (8, 32));

    // create intent on an existing segment adopts its shape
    let adopted = Queue::open(&name, 2, 2, OpenFlags::CREATE | OpenFlags::CONSUMER).unwrap();
    assert!(!adopted.is_creator());
    assert_eq!((adopted.capacity(), adopted.slot_size()), (8, 32));

    Queue::unlink(&name).unwrap();
}

#[test]
fn test_attach_missing_queue() {
    let name = unique("missing");
    let err = Queue::open(&name, 0, 0, OpenFlags::CONSUMER).err().unwrap();
    assert_eq!(err.status(), Status::NotFound);
}

#[test]
fn test_invalid_names() {
    for bad in ["", "/", "/a/b"] {
        let err = Queue::open(bad, 4, 4, all_roles()).err().unwrap();
        assert_eq!(err.status(), Status::Invalid, "{:?}", bad);
    }
}

#[test]
fn test_unlink_semantics() {
    let name = unique("unlink");
    assert_eq!(Queue::unlink(&name).unwrap_err().status(), Status::NotFound);

    let old = Queue::open(&name, 4, 16, all_roles()).unwrap();
    old.push(b"old generation").unwrap();

    Queue::unlink(&name).unwrap();
    assert_eq!(Queue::unlink(&name).unwrap_err().status(), Status::NotFound);
    assert_eq!(
        Queue::open(&name, 0, 0, OpenFlags::CONSUMER).err().unwrap().status(),
        Status::NotFound
    );

    // the unlinked generation keeps working for its existing handle
    old.push(b"still here").unwrap();
    assert_eq!(old.len().unwrap(), 2);

    let fresh = Queue::open(&name, 4, 16, all_roles()).unwrap();
    assert!(fresh.is_creator());
    assert!(fresh.is_empty().unwrap());
    fresh.push(b"new generation").unwrap();

    assert_eq!(pop_string(&old).unwrap(), "old generation");
    assert_eq!(pop_string(&fresh).unwrap(), "new generation");

    Queue::unlink(&name).unwrap();
}

#[test]
fn test_close_keeps_segment() {
    let name = unique("close");
    let q = Queue::open(&name, 4, 16, all_roles()).unwrap();
    q.push(b"persisted").unwrap();
    q.close().unwrap();

    let again = Queue::open(&name, 0, 0, OpenFlags::CONSUMER).unwrap();
    assert_eq!(pop_string(&again).unwrap(), "persisted");
    Queue::unlink(&name).unwrap();
}

#[test]
fn test_concurrent_threads_preserve_every_message() {
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 2_000;

    let name = unique("threads");
    let _owner = Queue::open(&name, 64, 16, OpenFlags::CREATE | OpenFlags::PRODUCER).unwrap();
    let barrier = Arc::new(Barrier::new(PRODUCERS as usize + 1));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let name = name.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let q = Queue::open(&name, 0, 0, OpenFlags::PRODUCER).unwrap();
                barrier.wait();
                for seq in 0..PER_PRODUCER {
                    let msg = [id.to_le_bytes(), seq.to_le_bytes()].concat();
                    loop {
                        match q.push(&msg) {
                            Ok(()) => break,
                            Err(QueueError::Full) => thread::yield_now(),
                            Err(e) => panic!("push failed: {}", e),
                        }
                    }
                }
            })
        })
        .collect();

    let consumer = Queue::open(&name, 0, 0, OpenFlags::CONSUMER).unwrap();
    barrier.wait();

    // per-producer order must be preserved by a single global FIFO
    let mut next = vec![0u32; PRODUCERS as usize];
    let mut received = 0;
    let mut buf = [0u8; 16];
    while received < PRODUCERS * PER_PRODUCER {
        match consumer.pop(&mut buf) {
            Ok(8) => {
                let id = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
                let seq = u32::from_le_bytes(buf[4..8].try_into().unwrap());
                assert_eq!(seq, next[id], "producer {} out of order", id);
                next[id] += 1;
                received += 1;
            }
            Ok(n) => panic!("unexpected message length {}", n),
            Err(QueueError::Empty) => thread::yield_now(),
            Err(e) => panic!("pop failed: {}", e),
        }
    }

    for p in producers {
        p.join().unwrap();
    }
    assert!(consumer.is_empty().unwrap());
    let stats = consumer.stats().unwrap();
    assert_eq!(stats.total_pushed, u64::from(PRODUCERS * PER_PRODUCER));
    assert_eq!(stats.total_popped, stats.total_pushed);

    Queue::unlink(&name).unwrap();
}

#[test]
fn test_cross_process_producer() {
    let name = unique("xproc");
    let consumer = Queue::open(&name, 16, 32, OpenFlags::CREATE | OpenFlags::CONSUMER).unwrap();

    let mut child = spawn_child("child_producer", &name);

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut expected = 0;
    while expected < 100 {
        match pop_string(&consumer) {
            Ok(msg) => {
                assert_eq!(msg, format!("child-{}", expected));
                expected += 1;
            }
            Err(QueueError::Empty) => {
                assert!(Instant::now() < deadline, "child stopped producing");
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("pop failed: {}", e),
        }
    }

    assert!(child.wait().unwrap().success());
    Queue::unlink(&name).unwrap();
}

/// Child side of `test_cross_process_producer`; a no-op when run directly
#[test]
fn child_producer() {
    let Ok(name) = std::env::var(CHILD_QUEUE_ENV) else {
        return;
    };
    let q = Queue::open(&name, 0, 0, OpenFlags::PRODUCER).unwrap();
    for i in 0..100 {
        let msg = format!("child-{}", i);
        while let Err(QueueError::Full) = q.push(msg.as_bytes()) {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[test]
fn test_survives_killed_participant() {
    let name = unique("killed");
    let q = Queue::open(&name, 8, 32, all_roles()).unwrap();

    let mut child = spawn_child("child_churn", &name);
    let deadline = Instant::now() + Duration::from_secs(30);
    while q.stats().unwrap().total_pushed < 10_000 {
        assert!(Instant::now() < deadline, "child never started churning");
        thread::sleep(Duration::from_millis(1));
    }

    // the child stays unreaped while the queue is used; a zombie that died
    // holding the lock must not wedge it
    child.kill().unwrap();

    let stats = q.stats().unwrap();
    assert!(stats.count <= stats.capacity);
    assert_eq!((stats.head + stats.count) % stats.capacity, stats.tail);

    while q.pop_vec(32).is_ok() {}
    q.push(b"after crash").unwrap();
    assert_eq!(pop_string(&q).unwrap(), "after crash");

    let diag = diagnose(&name).unwrap();
    assert_eq!(diag.state, QueueState::Empty);

    child.wait().unwrap();
    Queue::unlink(&name).unwrap();
}

/// Child side of `test_survives_killed_participant`; loops until killed
#[test]
fn child_churn() {
    let Ok(name) = std::env::var(CHILD_QUEUE_ENV) else {
        return;
    };
    let q = Queue::open(&name, 0, 0, OpenFlags::PRODUCER | OpenFlags::CONSUMER).unwrap();
    let mut buf = [0u8; 32];
    loop {
        let _ = q.push(b"churn");
        let _ = q.pop(&mut buf);
    }
}
