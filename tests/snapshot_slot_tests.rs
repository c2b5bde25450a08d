use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tyretherm::snapshot::*;

#[test]
fn test_latest_after_n_publishes() {
    let (mut writer, reader) = snapshot_channel::<u32>();
    assert!(reader.latest().is_none());

    for n in 1..=25u32 {
        writer.publish(n * 10, n % 3 != 0);
    }

    let latest = reader.latest().unwrap();
    assert_eq!(latest.sequence, 25);
    assert_eq!(latest.payload, 250);
    assert!(latest.valid);
    assert_eq!(writer.next_sequence(), 26);
}

#[test]
fn test_readers_share_one_slot() {
    let (mut writer, reader) = snapshot_channel::<f32>();
    let other = reader.clone();
    let third = writer.reader();

    writer.publish(1.5, true);
    assert_eq!(reader.latest(), other.latest());
    assert_eq!(third.latest().map(|s| s.payload), Some(1.5));
}

#[test]
fn test_staleness_is_judged_by_timestamp() {
    let (mut writer, reader) = snapshot_channel::<u8>();
    let t0 = Instant::now();
    writer.publish_at(1, true, t0);

    let snapshot = reader.latest().unwrap();
    let later = t0 + Duration::from_millis(300);
    assert_eq!(snapshot.age(later), Duration::from_millis(300));
    assert!(snapshot.is_stale(later, Duration::from_millis(200)));
    assert!(!snapshot.is_stale(later, Duration::from_millis(500)));
}

/// Payload a torn read would expose as mismatched words.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Wide {
    words: [u64; 8],
}

#[test]
fn test_concurrent_reads_are_whole_and_monotonic() {
    const PUBLISHES: u64 = 200_000;

    let (mut writer, reader) = snapshot_channel::<Wide>();
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let reader = reader.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last = 0u64;
                let mut observed = 0u64;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    if let Some(snapshot) = reader.latest() {
                        let words = snapshot.payload.words;
                        assert!(words.iter().all(|&w| w == words[0]), "torn read: {:?}", words);
                        assert_eq!(words[0], snapshot.sequence);
                        assert!(snapshot.sequence >= last, "went back from {} to {}", last, snapshot.sequence);
                        last = snapshot.sequence;
                        observed += 1;
                    }
                    if finished {
                        break;
                    }
                }
                observed
            })
        })
        .collect();

    for sequence in 1..=PUBLISHES {
        writer.publish(Wide { words: [sequence; 8] }, true);
    }
    done.store(true, Ordering::Release);

    for handle in readers {
        assert!(handle.join().unwrap() > 0);
    }
    assert_eq!(reader.latest().unwrap().sequence, PUBLISHES);
}
