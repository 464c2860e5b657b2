//! Capture-thread to tick handoff through the lock-free frame channel.

mod common;

use cadenza::{CircularBuffer, StepOutcome, Synchronizer, frame_channel};
use common::{HOP, as_row, config, melody};
use std::thread;

#[test]
fn frames_cross_threads_in_order() {
    let (mut producer, mut consumer) = frame_channel(1, HOP * 64);
    let samples: Vec<f32> = (0..HOP * 16).map(|i| i as f32).collect();
    let to_send = samples.clone();
    let writer = thread::spawn(move || {
        for chunk in to_send.chunks(100) {
            let mut sent = 0;
            while sent < chunk.len() {
                sent += producer.push(&chunk[sent..]);
                thread::yield_now();
            }
        }
        producer.dropped()
    });

    let mut buffer = CircularBuffer::new(1, HOP * 64);
    let mut received = Vec::new();
    while received.len() < samples.len() {
        consumer.drain_into(&mut buffer);
        if let Ok(block) = buffer.read(buffer.available()) {
            received.extend(block.iter().copied());
        }
        thread::yield_now();
    }
    assert_eq!(writer.join().unwrap(), 0);
    assert_eq!(received, samples);
    assert_eq!(buffer.dropped(), 0);
}

#[test]
fn overflow_is_counted_not_blocking() {
    let (mut producer, mut consumer) = frame_channel(2, 8);
    let interleaved = vec![0.5f32; 2 * 20];
    assert_eq!(producer.push(&interleaved), 8);
    assert_eq!(producer.dropped(), 12);
    assert_eq!(consumer.dropped(), 12);

    let mut buffer = CircularBuffer::new(2, 4);
    assert_eq!(consumer.drain_into(&mut buffer), 8);
    assert_eq!(buffer.available(), 4);
    assert_eq!(buffer.dropped(), 4);
}

#[test]
fn synchronizer_consumes_from_the_channel() {
    let reference = melody(12, 1);
    let mut sync = Synchronizer::new(config(), &as_row(&reference)).unwrap();
    let (mut producer, mut consumer) = frame_channel(1, HOP * 4);
    let mut buffer = CircularBuffer::new(1, HOP * 8);

    let mut ticks = 0;
    for chunk in reference.chunks(HOP / 2) {
        producer.push(chunk);
        consumer.drain_into(&mut buffer);
        sync.record_dropped(0);
        while let Some(outcome) = sync.step_buffered(&mut buffer, 0.0) {
            assert!(matches!(outcome, StepOutcome::Tracking(_)));
            ticks += 1;
        }
    }
    assert_eq!(ticks, 12);
    assert_eq!(sync.stats().dropped_frames, 0);
    assert!(sync.aligner().reference_index() >= 9);
}
