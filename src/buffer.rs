//! Live audio buffering between the capture thread and the tick.
//!
//! Two pieces:
//! - [`CircularBuffer`]: bounded `(channels, capacity)` sample store owned by
//!   the consumer. Writing past capacity overwrites the oldest unread frames
//!   (stale audio hurts alignment more than missing audio) and counts them.
//! - [`frame_channel`]: lock-free SPSC transport (`rtrb`) from a real-time
//!   capture callback to the consumer. The producer never blocks and cannot
//!   reach the consumer's end of the ring, so on overflow it discards the
//!   *newest* samples and counts them in a shared atomic.
//!
//! Size the channel to a few hops and drain it into the [`CircularBuffer`]
//! every tick. Overflow then happens in the buffer, which keeps the most
//! recent audio.

use ndarray::{Array2, ArrayView2};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded multi-channel circular sample buffer with drop-oldest overflow.
#[derive(Debug, Clone)]
pub struct CircularBuffer {
    buffer: Array2<f32>,
    write_index: usize,
    read_index: usize,
    count: usize,
    dropped: u64,
    shape_errors: u64,
}

impl CircularBuffer {
    /// Create a buffer holding `capacity` frames of `channels` samples.
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            buffer: Array2::zeros((channels.max(1), capacity.max(1))),
            write_index: 0,
            read_index: 0,
            count: 0,
            dropped: 0,
            shape_errors: 0,
        }
    }

    pub fn channels(&self) -> usize {
        self.buffer.nrows()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.ncols()
    }

    /// Number of unread frames.
    pub fn available(&self) -> usize {
        self.count
    }

    /// Frames discarded because the writer overran the reader.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Writes rejected for having the wrong channel count.
    pub fn shape_errors(&self) -> u64 {
        self.shape_errors
    }

    /// Append `(channels, n)` frames, overwriting the oldest unread frames
    /// when full. Returns the number of frames accepted.
    pub fn write(&mut self, frames: ArrayView2<f32>) -> usize {
        if frames.nrows() != self.channels() {
            self.shape_errors += 1;
            log::warn!(
                "CircularBuffer::write: expected {} channels, got {}",
                self.channels(),
                frames.nrows()
            );
            return 0;
        }
        let capacity = self.capacity();
        let n = frames.ncols();
        // only the newest `capacity` frames can survive
        let skip = n.saturating_sub(capacity);
        for column in frames.columns().into_iter().skip(skip) {
            self.buffer.column_mut(self.write_index).assign(&column);
            self.write_index = (self.write_index + 1) % capacity;
        }
        self.dropped += (self.count + n).saturating_sub(capacity) as u64;
        self.count = (self.count + n - skip).min(capacity);
        self.read_index = (self.write_index + capacity - self.count) % capacity;
        n
    }

    /// Append interleaved samples (`frame0 ch0, frame0 ch1, ...`).
    pub fn write_interleaved(&mut self, samples: &[f32]) -> usize {
        let channels = self.channels();
        let frames = samples.len() / channels;
        if frames == 0 {
            return 0;
        }
        let view = ArrayView2::from_shape((frames, channels), &samples[..frames * channels]);
        match view {
            Ok(v) => self.write(v.t()),
            Err(_) => 0,
        }
    }

    /// Read `n` frames starting at the read index.
    pub fn read(&mut self, n: usize) -> crate::Result<Array2<f32>> {
        if n > self.count {
            return Err(crate::Error::InsufficientFrames {
                requested: n,
                available: self.count,
            });
        }
        let capacity = self.capacity();
        let mut out = Array2::<f32>::zeros((self.channels(), n));
        for i in 0..n {
            out.column_mut(i)
                .assign(&self.buffer.column((self.read_index + i) % capacity));
        }
        self.read_index = (self.read_index + n) % capacity;
        self.count -= n;
        Ok(out)
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.read_index = self.write_index;
        self.count = 0;
    }
}

/// Create a lock-free frame transport carrying `capacity` interleaved frames.
///
/// Pushing into a full channel drops the frames being pushed, not the queued
/// ones.
pub fn frame_channel(channels: usize, capacity: usize) -> (FrameProducer, FrameConsumer) {
    let channels = channels.max(1);
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1) * channels);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        FrameProducer {
            producer,
            channels,
            dropped: Arc::clone(&dropped),
        },
        FrameConsumer {
            consumer,
            channels,
            dropped,
            scratch: Vec::new(),
        },
    )
}

/// Real-time side of [`frame_channel`]. Safe to call from an audio callback.
pub struct FrameProducer {
    producer: rtrb::Producer<f32>,
    channels: usize,
    dropped: Arc<AtomicU64>,
}

impl FrameProducer {
    /// Push interleaved samples; returns the number of whole frames queued.
    ///
    /// Never blocks or allocates. Frames that do not fit are counted as
    /// dropped.
    pub fn push(&mut self, interleaved: &[f32]) -> usize {
        let frames = interleaved.len() / self.channels;
        let room = self.producer.slots() / self.channels;
        let accepted = frames.min(room);
        if accepted > 0
            && let Ok(chunk) = self.producer.write_chunk_uninit(accepted * self.channels)
        {
            chunk.fill_from_iter(interleaved[..accepted * self.channels].iter().copied());
        }
        if accepted < frames {
            self.dropped
                .fetch_add((frames - accepted) as u64, Ordering::Relaxed);
        }
        accepted
    }

    /// Frames dropped at the transport so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Tick side of [`frame_channel`].
pub struct FrameConsumer {
    consumer: rtrb::Consumer<f32>,
    channels: usize,
    dropped: Arc<AtomicU64>,
    scratch: Vec<f32>,
}

impl FrameConsumer {
    /// Move every complete frame available into `buffer`.
    ///
    /// Returns the number of frames moved. A buffer with a different channel
    /// count gets nothing: the frames are discarded and counted as one shape
    /// error on the buffer.
    pub fn drain_into(&mut self, buffer: &mut CircularBuffer) -> usize {
        let frames = self.consumer.slots() / self.channels;
        if frames == 0 {
            return 0;
        }
        let Ok(chunk) = self.consumer.read_chunk(frames * self.channels) else {
            return 0;
        };
        self.scratch.clear();
        let (first, second) = chunk.as_slices();
        self.scratch.extend_from_slice(first);
        self.scratch.extend_from_slice(second);
        chunk.commit_all();
        if buffer.channels() != self.channels {
            buffer.shape_errors += 1;
            log::warn!(
                "FrameConsumer::drain_into: channel carries {} channels, buffer has {}",
                self.channels,
                buffer.channels()
            );
            return 0;
        }
        buffer.write_interleaved(&self.scratch);
        frames
    }

    /// Frames dropped at the transport so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
