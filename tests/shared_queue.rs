use std::sync::mpsc;
use std::time::{Duration, Instant};

use ipc_mq::{Error, QueueConfig, Result, SharedQueue};
use tempfile::tempdir;

#[test]
fn handles_share_one_queue() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("jobs");
    let mut producer = SharedQueue::create(&path, &QueueConfig::new(8, 64))?;
    let mut consumer = SharedQueue::open(&path)?;

    producer.send(b"low", 1)?;
    producer.send(b"high", 10)?;
    producer.send(b"mid", 5)?;
    assert_eq!(consumer.len(), 3);

    let mut buf = [0u8; 64];
    let mut order = Vec::new();
    for _ in 0..3 {
        let (len, prio) = consumer.receive(&mut buf)?;
        order.push((prio, String::from_utf8_lossy(&buf[..len]).into_owned()));
    }
    assert_eq!(
        order,
        vec![(10, "high".into()), (5, "mid".into()), (1, "low".into())]
    );
    assert!(producer.is_empty());
    Ok(())
}

#[test]
fn create_twice_fails_and_open_or_create_attaches() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("q");
    let config = QueueConfig::new(4, 16);
    let mut first = SharedQueue::create(&path, &config)?;
    assert!(matches!(
        SharedQueue::create(&path, &config),
        Err(Error::AlreadyExists(_))
    ));
    first.send(b"kept", 3)?;

    let mut second = SharedQueue::open_or_create(&path, &QueueConfig::new(99, 99))?;
    assert_eq!(second.capacity(), 4);
    assert_eq!(second.max_message_size(), 16);
    let mut buf = [0u8; 16];
    assert_eq!(second.receive(&mut buf)?, (4, 3));
    Ok(())
}

#[test]
fn open_and_destroy_missing_queue() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("missing");
    assert!(matches!(SharedQueue::open(&path), Err(Error::NotFound(_))));
    assert!(matches!(SharedQueue::destroy(&path), Err(Error::NotFound(_))));

    SharedQueue::create(&path, &QueueConfig::new(1, 1))?;
    SharedQueue::destroy(&path)?;
    assert!(!path.exists());
    Ok(())
}

#[test]
fn nonblocking_handle_reports_full_and_empty() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("q");
    let config = QueueConfig::new(1, 8).with_nonblocking(true);
    let mut queue = SharedQueue::create(&path, &config)?;
    let mut buf = [0u8; 8];

    assert!(matches!(queue.receive(&mut buf), Err(Error::QueueEmpty)));
    queue.send(b"one", 0)?;
    assert!(matches!(queue.send(b"two", 0), Err(Error::CapacityExceeded)));
    assert_eq!(queue.len(), 1);
    Ok(())
}

#[test]
fn timed_operations_expire() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("q");
    let mut queue = SharedQueue::create(&path, &QueueConfig::new(1, 8))?;
    let mut buf = [0u8; 8];

    let start = Instant::now();
    assert!(matches!(
        queue.receive_timeout(&mut buf, Duration::from_millis(30)),
        Err(Error::Timeout)
    ));
    assert!(start.elapsed() >= Duration::from_millis(25));

    queue.send(b"full", 0)?;
    assert!(matches!(
        queue.send_timeout(b"more", 0, Duration::from_millis(30)),
        Err(Error::Timeout)
    ));
    assert!(queue.wait_not_empty(Some(Duration::ZERO))?);
    Ok(())
}

#[test]
fn blocked_receiver_wakes_on_send() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("q");
    let mut producer = SharedQueue::create(&path, &QueueConfig::new(2, 16))?;
    let mut consumer = SharedQueue::open(&path)?;

    let (done_tx, done_rx) = mpsc::channel();
    let handle = std::thread::spawn(move || -> Result<(usize, i32)> {
        let mut buf = [0u8; 16];
        let msg = consumer.receive_timeout(&mut buf, Duration::from_secs(5))?;
        let _ = done_tx.send(());
        Ok(msg)
    });

    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
    producer.send(b"wake", 7)?;
    done_rx.recv_timeout(Duration::from_secs(5)).expect("receiver woke");
    assert_eq!(handle.join().expect("receiver thread")?, (4, 7));
    Ok(())
}

#[test]
fn blocked_sender_wakes_on_receive() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("q");
    let mut consumer = SharedQueue::create(&path, &QueueConfig::new(1, 16))?;
    let mut producer = SharedQueue::open(&path)?;
    producer.send(b"first", 1)?;

    let handle = std::thread::spawn(move || -> Result<()> {
        producer.send_timeout(b"second", 2, Duration::from_secs(5))
    });

    std::thread::sleep(Duration::from_millis(30));
    let mut buf = [0u8; 16];
    assert_eq!(consumer.receive(&mut buf)?.1, 1);
    handle.join().expect("sender thread")?;
    assert_eq!(consumer.receive(&mut buf)?.1, 2);
    Ok(())
}

#[test]
fn many_producers_one_consumer() -> Result<()> {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 200;

    let dir = tempdir()?;
    let path = dir.path().join("q");
    let mut consumer = SharedQueue::create(&path, &QueueConfig::new(16, 8))?;

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let path = path.clone();
        handles.push(std::thread::spawn(move || -> Result<()> {
            let mut queue = SharedQueue::open(&path)?;
            for i in 0..PER_PRODUCER {
                queue.send_timeout(&(i as u32).to_le_bytes(), p as i32, Duration::from_secs(10))?;
            }
            Ok(())
        }));
    }

    let mut buf = [0u8; 8];
    let mut per_producer = [0usize; PRODUCERS];
    for _ in 0..PRODUCERS * PER_PRODUCER {
        let (len, prio) = consumer.receive_timeout(&mut buf, Duration::from_secs(10))?;
        assert_eq!(len, 4);
        per_producer[prio as usize] += 1;
    }
    for handle in handles {
        handle.join().expect("producer thread")?;
    }
    assert_eq!(per_producer, [PER_PRODUCER; PRODUCERS]);
    assert!(consumer.is_empty());
    Ok(())
}

#[test]
fn observer_length_tracks_without_lock() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("q");
    let mut producer = SharedQueue::create(&path, &QueueConfig::new(8, 4))?;
    let observer = SharedQueue::open(&path)?;

    for i in 0..8 {
        assert!(observer.len() <= i);
        producer.send(b"x", i as i32)?;
        assert!(observer.len() <= i + 1);
    }
    assert!(observer.wait_not_empty(Some(Duration::from_millis(10)))?);
    Ok(())
}
