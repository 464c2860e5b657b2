//! Real-time accompaniment following for Rust.
//!
//! Cadenza listens to a live soloist, aligns the performance against a
//! reference recording of the solo part, and time-stretches a pre-recorded
//! accompaniment so that it stays with the soloist. The pipeline per tick is:
//!
//! 1. one hop of live audio is turned into a 12-bin CENS chroma vector,
//! 2. Online Time Warping advances the alignment against the reference,
//! 3. the timing error between accompaniment and soloist drives a PID or
//!    fuzzy rate controller,
//! 4. a streaming phase vocoder renders the accompaniment at that rate.
//!
//! # Quick Start
//!
//! ```rust
//! use cadenza::{SyncConfig, StepOutcome, io, synchronizer};
//! use ndarray::Array2;
//!
//! let config = SyncConfig { hop_length: 512, fft_size: 2048, window_length: 2048, ..SyncConfig::default() };
//! let solo = io::tone(440.0, 16000, 2.0);
//! let reference = Array2::from_shape_vec((1, solo.len()), solo.clone()).unwrap();
//! let accompaniment = Array2::from_shape_vec((1, solo.len()), io::tone(220.0, 16000, 2.0)).unwrap();
//!
//! let (mut sync, mut vocoder) = synchronizer::session(config, &reference, &accompaniment).unwrap();
//! for hop in solo.chunks_exact(512).take(8) {
//!     let frames = Array2::from_shape_vec((1, 512), hop.to_vec()).unwrap();
//!     if let StepOutcome::Tracking(report) = sync.step(frames.view(), vocoder.get_time()) {
//!         assert!(report.rate > 0.0);
//!     }
//!     let _block = vocoder.get_next_frames(512);
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`synchronizer`] | Per-tick loop, session construction, runtime counters |
//! | [`feature`] | CENS chroma extractor and reference feature sequences |
//! | [`align`] | Online Time Warping and its banded cost matrix |
//! | [`effects`] | Streaming variable-rate phase vocoder |
//! | [`control`] | PID and fuzzy rate controllers, Kalman pre-filter |
//! | [`buffer`] | Circular audio buffer and lock-free frame transport |
//! | [`config`] | Session configuration (serde/YAML) |
//! | [`io`] | Audio decoding, resampling and WAV output |
//! | [`spectrum`] | Centered STFT |
//! | [`convert`] | Pitch, frequency and time conversions |
//! | [`window`] | Window and fade functions |
//! | [`fft`] | Cached FFT plans |
//!
//! # Error Handling
//!
//! Construction returns [`Result<T>`]. Once a session is running nothing in
//! the tick path fails: malformed frames and dropped frames are counted in
//! [`SyncStats`], and the end of a session is reported as
//! [`StepOutcome::SessionEnded`].
//!
//! # Feature Flags
//!
//! | Flag | Description |
//! |------|-------------|
//! | `parallel` | Compute STFT frames with rayon |

#![cfg_attr(not(test), forbid(unsafe_code))]
#![cfg_attr(test, deny(unsafe_code))]

pub mod error;
pub use error::{Error, Result};

pub mod align;
pub mod buffer;
pub mod config;
pub mod control;
pub mod convert;
pub mod effects;
pub mod feature;
pub mod fft;
pub mod io;
pub mod spectrum;
pub mod synchronizer;
pub mod window;

pub use buffer::{CircularBuffer, FrameConsumer, FrameProducer, frame_channel};
pub use config::{ControllerConfig, KalmanConfig, SyncConfig};
pub use effects::{PhaseVocoder, RateHandle, StftCache};
pub use synchronizer::{StepOutcome, SyncStats, Synchronizer, TickReport};
