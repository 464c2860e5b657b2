//! The per-tick loop that follows a soloist and steers the accompaniment.
//!
//! A [`Synchronizer`] owns the CENS extractor, the online aligner and the
//! rate controller. Each call to [`Synchronizer::step`] consumes one hop of
//! live audio, moves the alignment forward and publishes a new playback rate
//! through the shared [`RateHandle`] that the [`PhaseVocoder`] reads.
//!
//! A session ends when the live sequence is full. With the default
//! `end_of_reference_patience` of `None` it does not end just because the
//! reference is exhausted: the estimate saturates at the last reference frame
//! and ticks keep reporting it. Silent hops hold the estimate in place.

use crate::align::{OnlineTimeWarping, OtwParams};
use crate::buffer::CircularBuffer;
use crate::config::SyncConfig;
use crate::control::RateController;
use crate::convert::frame_position_to_time;
use crate::effects::phase_vocoder::{PhaseVocoder, RateHandle, StftCache, VocoderOptions};
use crate::feature::{CENS_BINS, CensExtractor, reference_features};
use crate::{Error, Result, io};
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::path::Path;
use std::sync::Arc;

/// What one tick observed and decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    /// Controller output for this tick
    pub rate: f32,
    /// Reference position of the soloist in seconds
    pub estimated_reference_time: f64,
    pub reference_index: usize,
    pub live_index: usize,
    /// `accompanist_time - estimated_reference_time`
    pub error: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Tracking(TickReport),
    /// The session is over; every later step returns this too.
    SessionEnded,
}

impl StepOutcome {
    pub fn report(&self) -> Option<&TickReport> {
        match self {
            StepOutcome::Tracking(report) => Some(report),
            StepOutcome::SessionEnded => None,
        }
    }
}

/// Runtime counters of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub ticks: u64,
    pub frame_shape_errors: u64,
    pub dropped_frames: u64,
}

/// Live-to-reference follower driving the accompaniment rate.
///
/// # Example
/// ```
/// use cadenza::{SyncConfig, Synchronizer};
/// use ndarray::Array2;
///
/// let config = SyncConfig { hop_length: 512, fft_size: 2048, window_length: 2048, ..SyncConfig::default() };
/// let solo = cadenza::io::tone(440.0, 16000, 1.0);
/// let reference = Array2::from_shape_vec((1, solo.len()), solo.clone()).unwrap();
/// let mut sync = Synchronizer::new(config, &reference).unwrap();
///
/// let frames = Array2::from_shape_vec((1, 512), solo[..512].to_vec()).unwrap();
/// let outcome = sync.step(frames.view(), 0.0);
/// assert!(outcome.report().is_some());
/// ```
pub struct Synchronizer {
    config: SyncConfig,
    extractor: CensExtractor,
    aligner: OnlineTimeWarping,
    controller: RateController,
    rate: RateHandle,
    mono: Vec<f32>,
    performance: Vec<f32>,
    stats: SyncStats,
    recorded_drops: u64,
    buffer_drops: u64,
    buffer_shape_errors: u64,
    ticks_at_end: usize,
    ended: bool,
}

impl Synchronizer {
    /// Build a synchronizer from reference audio `(channels, samples)` at the
    /// configured sample rate. The reference is mono-mixed before analysis.
    ///
    /// # Errors
    /// Invalid config, empty or non-finite reference audio.
    pub fn new(config: SyncConfig, reference: &Array2<f32>) -> Result<Self> {
        config.validate()?;
        io::valid_audio(reference.view())?;
        let mono = io::to_mono(reference.view());
        let samples = mono.row(0).to_vec();
        let mut extractor = CensExtractor::new(config.sample_rate, config.fft_size)?;
        let features = reference_features(&mut extractor, &samples, config.hop_length)?;
        Self::build(config, extractor, features)
    }

    /// Build a synchronizer from precomputed reference CENS features
    /// `(12, R)`.
    pub fn with_features(config: SyncConfig, features: Array2<f32>) -> Result<Self> {
        config.validate()?;
        if features.nrows() != CENS_BINS {
            return Err(Error::ShapeMismatch {
                expected: format!("({}, R) reference features", CENS_BINS),
                got: format!("{:?}", features.dim()),
            });
        }
        let extractor = CensExtractor::new(config.sample_rate, config.fft_size)?;
        Self::build(config, extractor, features)
    }

    fn build(config: SyncConfig, extractor: CensExtractor, features: Array2<f32>) -> Result<Self> {
        let aligner = OnlineTimeWarping::new(features, OtwParams::from(&config))?;
        log::info!(
            "Synchronizer: {} reference frames ({:.2}s), capacity {} ticks, controller {:?}",
            aligner.reference_len(),
            frame_position_to_time(
                aligner.reference_len() as f64,
                config.sample_rate,
                config.hop_length
            ),
            aligner.capacity(),
            config.controller
        );
        Ok(Self {
            controller: RateController::new(&config),
            mono: vec![0.0; config.hop_length],
            performance: Vec::new(),
            rate: RateHandle::default(),
            stats: SyncStats::default(),
            recorded_drops: 0,
            buffer_drops: 0,
            buffer_shape_errors: 0,
            ticks_at_end: 0,
            ended: false,
            extractor,
            aligner,
            config,
        })
    }

    /// Advance the session by one tick.
    ///
    /// `frames` is `(channels, hop_length)` live audio; `accompanist_time`
    /// is the accompaniment's current source position in seconds (usually
    /// [`PhaseVocoder::get_time`]).
    pub fn step(&mut self, frames: ArrayView2<f32>, accompanist_time: f64) -> StepOutcome {
        if self.ended {
            return StepOutcome::SessionEnded;
        }
        let hop = self.config.hop_length;
        let (channels, n) = frames.dim();
        if channels != self.config.channels || n > hop {
            self.stats.frame_shape_errors += 1;
            log::warn!(
                "Synchronizer::step: expected ({}, {}) frames, got ({}, {})",
                self.config.channels,
                hop,
                channels,
                n
            );
        }

        let used = n.min(hop);
        self.mono.iter_mut().for_each(|v| *v = 0.0);
        if channels > 0 {
            let scale = 1.0 / channels as f32;
            for (i, column) in frames.columns().into_iter().take(used).enumerate() {
                self.mono[i] = column.sum() * scale;
            }
        }
        self.record(used);

        let feature = self.extractor.extract(&self.mono[..used]);
        let Some(j) = self.aligner.insert(ArrayView1::from(&feature[..])) else {
            return self.end("live sequence is full");
        };
        if self.aligner.at_end_of_reference() {
            self.ticks_at_end += 1;
            if let Some(patience) = self.config.end_of_reference_patience
                && self.ticks_at_end > patience
            {
                return self.end("reference exhausted");
            }
        }

        let estimated_reference_time =
            frame_position_to_time(j as f64, self.config.sample_rate, hop);
        let error = if accompanist_time.is_finite() {
            accompanist_time - estimated_reference_time
        } else {
            0.0
        };
        let rate = self.controller.update(error as f32);
        if j > self.config.search_width {
            self.rate.set(rate);
        }
        self.stats.ticks += 1;

        let live_index = self.aligner.live_index().unwrap_or(0);
        log::debug!(
            "tick {}: j={} est={:.3}s acc={:.3}s err={:+.3}s rate={:.3}",
            live_index,
            j,
            estimated_reference_time,
            accompanist_time,
            error,
            rate
        );
        StepOutcome::Tracking(TickReport {
            rate,
            estimated_reference_time,
            reference_index: j,
            live_index,
            error,
        })
    }

    /// Run one tick if `buffer` holds a full hop, folding the buffer's drop
    /// and shape counters into [`stats`](Self::stats).
    ///
    /// Returns `None` while less than a hop is buffered. The hop is consumed
    /// even after the session has ended.
    pub fn step_buffered(
        &mut self,
        buffer: &mut CircularBuffer,
        accompanist_time: f64,
    ) -> Option<StepOutcome> {
        self.buffer_drops = buffer.dropped();
        self.buffer_shape_errors = buffer.shape_errors();
        let frames = buffer.read(self.config.hop_length).ok()?;
        Some(self.step(frames.view(), accompanist_time))
    }

    /// Add frames dropped by an upstream transport to the session counters.
    pub fn record_dropped(&mut self, n: u64) {
        if n > 0 {
            log::warn!("Synchronizer: {} live frames dropped upstream", n);
        }
        self.recorded_drops += n;
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            ticks: self.stats.ticks,
            frame_shape_errors: self.stats.frame_shape_errors + self.buffer_shape_errors,
            dropped_frames: self.recorded_drops + self.buffer_drops,
        }
    }

    /// Handle to the playback rate the controller publishes.
    pub fn rate_handle(&self) -> RateHandle {
        self.rate.clone()
    }

    pub fn aligner(&self) -> &OnlineTimeWarping {
        &self.aligner
    }

    /// Alignment path `(reference, live)` so far.
    pub fn path(&self) -> &[(usize, usize)] {
        self.aligner.path()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Seconds of live audio consumed so far.
    pub fn live_time(&self) -> f64 {
        self.performance.len() as f64 / self.config.sample_rate as f64
    }

    /// The mono live performance as received by [`step`](Self::step).
    pub fn performance(&self) -> &[f32] {
        &self.performance
    }

    /// Write the recorded live performance to a WAV file.
    pub fn save_performance<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let audio = Array2::from_shape_vec((1, self.performance.len()), self.performance.clone())?;
        io::save_wav(path, &audio, self.config.sample_rate)
    }

    /// Forget all live input and start over against the same reference.
    pub fn reset(&mut self) -> Result<()> {
        let reference = self.aligner.reference().clone();
        self.aligner = OnlineTimeWarping::new(reference, OtwParams::from(&self.config))?;
        self.controller.reset();
        self.rate.set(1.0);
        self.performance.clear();
        self.stats = SyncStats::default();
        self.recorded_drops = 0;
        self.buffer_drops = 0;
        self.buffer_shape_errors = 0;
        self.ticks_at_end = 0;
        self.ended = false;
        Ok(())
    }

    fn record(&mut self, used: usize) {
        let limit = self.aligner.capacity() * self.config.hop_length;
        let room = limit.saturating_sub(self.performance.len());
        self.performance
            .extend_from_slice(&self.mono[..used.min(room)]);
    }

    fn end(&mut self, reason: &str) -> StepOutcome {
        log::info!(
            "Synchronizer: session ended after {} ticks ({})",
            self.stats.ticks,
            reason
        );
        self.ended = true;
        StepOutcome::SessionEnded
    }
}

/// Build a synchronizer and a vocoder over `accompaniment` that follows its
/// rate. Both inputs are `(channels, samples)` at the configured sample rate.
pub fn session(
    config: SyncConfig,
    reference: &Array2<f32>,
    accompaniment: &Array2<f32>,
) -> Result<(Synchronizer, PhaseVocoder)> {
    let sync = Synchronizer::new(config, reference)?;
    let cache = Arc::new(StftCache::from_config(accompaniment, sync.config())?);
    let vocoder = PhaseVocoder::new(
        cache,
        sync.rate_handle(),
        VocoderOptions::from(sync.config()),
    )?;
    Ok((sync, vocoder))
}

/// [`session`] over audio files, decoded and resampled to the configured rate.
/// The reference is mixed to mono; the accompaniment keeps its channels.
pub fn session_from_files<P: AsRef<Path>, Q: AsRef<Path>>(
    config: SyncConfig,
    reference_path: P,
    accompaniment_path: Q,
) -> Result<(Synchronizer, PhaseVocoder)> {
    let sr = Some(config.sample_rate);
    let (reference, _) = io::load_audio(reference_path, sr, true)?;
    let (accompaniment, spec) = io::load_audio(accompaniment_path, sr, false)?;
    log::info!(
        "session_from_files: reference {} samples, accompaniment {} x {} samples at {} Hz",
        reference.ncols(),
        spec.channels,
        accompaniment.ncols(),
        spec.sample_rate
    );
    session(config, &reference, &accompaniment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::convert::midi_to_hz;

    const SR: u32 = 16000;
    const HOP: usize = 512;

    fn config() -> SyncConfig {
        SyncConfig {
            sample_rate: SR,
            hop_length: HOP,
            fft_size: 2048,
            window_length: 2048,
            search_width: 4,
            ..SyncConfig::default()
        }
    }

    /// One distinct pitch class per hop.
    fn melody(hops: usize) -> Array2<f32> {
        let mut samples = Vec::with_capacity(hops * HOP);
        for h in 0..hops {
            let f = midi_to_hz(69.0 + (h % 12) as f32);
            let w = 2.0 * std::f32::consts::PI * f / SR as f32;
            samples.extend((0..HOP).map(|i| 0.5 * (w * (h * HOP + i) as f32).sin()));
        }
        Array2::from_shape_vec((1, samples.len()), samples).unwrap()
    }

    fn hop_at(audio: &Array2<f32>, h: usize) -> Array2<f32> {
        audio
            .slice(ndarray::s![.., h * HOP..(h + 1) * HOP])
            .to_owned()
    }

    #[test]
    fn test_reference_fed_back_tracks_diagonal() {
        let reference = melody(40);
        let mut sync = Synchronizer::new(config(), &reference).unwrap();
        for h in 0..40 {
            let frames = hop_at(&reference, h);
            let report = *sync.step(frames.view(), 0.0).report().unwrap();
            assert_eq!(report.live_index, h);
            assert!(report.reference_index.abs_diff(h) <= 2, "tick {h}: j={}", report.reference_index);
        }
        assert_eq!(sync.stats().ticks, 40);
        assert_eq!(sync.stats().frame_shape_errors, 0);
    }

    #[test]
    fn test_rate_is_held_until_past_search_width() {
        let reference = melody(30);
        let mut sync = Synchronizer::new(config(), &reference).unwrap();
        let handle = sync.rate_handle();
        // the accompaniment claims to be far ahead, so the controller wants to slow down
        for h in 0..3 {
            let report = *sync.step(hop_at(&reference, h).view(), 10.0).report().unwrap();
            assert!(report.rate < 1.0);
            assert!(report.reference_index <= 4);
            assert_eq!(handle.get(), 1.0);
        }
        let mut applied = false;
        for h in 3..30 {
            let report = *sync.step(hop_at(&reference, h).view(), 10.0).report().unwrap();
            if report.reference_index > 4 {
                assert_eq!(handle.get(), report.rate);
                applied = true;
            }
        }
        assert!(applied);
    }

    #[test]
    fn test_single_frame_reference_ends_when_full() {
        let reference = melody(1);
        let mut sync = Synchronizer::new(config(), &reference).unwrap();
        let frames = hop_at(&reference, 0);
        for _ in 0..4 {
            let report = *sync.step(frames.view(), 0.0).report().unwrap();
            assert_eq!(report.reference_index, 0);
        }
        assert_eq!(sync.step(frames.view(), 0.0), StepOutcome::SessionEnded);
        assert_eq!(sync.step(frames.view(), 0.0), StepOutcome::SessionEnded);
        assert!(sync.is_ended());
        assert_eq!(sync.stats().ticks, 4);
    }

    #[test]
    fn test_patience_ends_session() {
        let reference = melody(6);
        let cfg = SyncConfig {
            end_of_reference_patience: Some(2),
            ..config()
        };
        let mut sync = Synchronizer::new(cfg, &reference).unwrap();
        let mut ended_at = None;
        for tick in 0..24 {
            let frames = hop_at(&reference, tick.min(5));
            if sync.step(frames.view(), 0.0) == StepOutcome::SessionEnded {
                ended_at = Some(tick);
                break;
            }
        }
        let tick = ended_at.expect("session should end before the live buffer fills");
        assert!(tick < 23);
        assert!(sync.aligner().at_end_of_reference());
    }

    #[test]
    fn test_default_session_outlives_the_reference() {
        let reference = melody(4);
        assert_eq!(config().end_of_reference_patience, None);
        let mut sync = Synchronizer::new(config(), &reference).unwrap();
        for tick in 0..16 {
            let frames = hop_at(&reference, tick.min(3));
            let report = *sync.step(frames.view(), 0.0).report().unwrap();
            if tick >= 3 {
                assert_eq!(report.reference_index, 3);
            }
        }
        assert!(sync.aligner().at_end_of_reference());
        assert_eq!(sync.step(hop_at(&reference, 3).view(), 0.0), StepOutcome::SessionEnded);
    }

    #[test]
    fn test_bad_shapes_are_counted_not_fatal() {
        let reference = melody(10);
        let mut sync = Synchronizer::new(config(), &reference).unwrap();
        let stereo = Array2::<f32>::zeros((2, HOP));
        let long = Array2::<f32>::zeros((1, HOP * 2));
        let short = Array2::<f32>::zeros((1, HOP / 2));
        assert!(sync.step(stereo.view(), 0.0).report().is_some());
        assert!(sync.step(long.view(), 0.0).report().is_some());
        assert!(sync.step(short.view(), 0.0).report().is_some());
        assert_eq!(sync.stats().frame_shape_errors, 2);
        assert_eq!(sync.stats().ticks, 3);
        assert_eq!(sync.performance().len(), HOP * 2 + HOP / 2);
    }

    #[test]
    fn test_step_buffered_waits_for_a_full_hop() {
        let reference = melody(10);
        let mut sync = Synchronizer::new(config(), &reference).unwrap();
        let mut buffer = CircularBuffer::new(1, HOP * 2);
        let audio = hop_at(&reference, 0);
        buffer.write(audio.slice(ndarray::s![.., ..HOP / 2]));
        assert!(sync.step_buffered(&mut buffer, 0.0).is_none());
        buffer.write(audio.slice(ndarray::s![.., HOP / 2..]));
        assert!(matches!(
            sync.step_buffered(&mut buffer, 0.0),
            Some(StepOutcome::Tracking(_))
        ));
        assert_eq!(buffer.available(), 0);

        let flood = Array2::<f32>::zeros((1, HOP * 3));
        buffer.write(flood.view());
        sync.record_dropped(5);
        sync.step_buffered(&mut buffer, 0.0);
        assert_eq!(sync.stats().dropped_frames, HOP as u64 + 5);
    }

    #[test]
    fn test_with_features_checks_shape() {
        let bad = Array2::<f32>::zeros((13, 4));
        assert!(matches!(
            Synchronizer::with_features(config(), bad),
            Err(Error::ShapeMismatch { .. })
        ));
        let features = Array2::<f32>::from_elem((CENS_BINS, 4), 1.0 / (CENS_BINS as f32).sqrt());
        let sync = Synchronizer::with_features(config(), features).unwrap();
        assert_eq!(sync.aligner().reference_len(), 4);
    }

    #[test]
    fn test_session_shares_rate() {
        let reference = melody(20);
        let cfg = SyncConfig {
            controller: ControllerConfig::Fuzzy,
            ..config()
        };
        let (sync, mut vocoder) = session(cfg, &reference, &reference).unwrap();
        sync.rate_handle().set(0.75);
        assert_eq!(vocoder.rate(), 0.75);
        assert!(vocoder.get_next_frames(HOP).is_some());
    }

    #[test]
    fn test_reset_and_save_performance() {
        let reference = melody(8);
        let mut sync = Synchronizer::new(config(), &reference).unwrap();
        for h in 0..8 {
            sync.step(hop_at(&reference, h).view(), 0.0);
        }
        assert!((sync.live_time() - 8.0 * HOP as f64 / SR as f64).abs() < 1e-9);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("performance.wav");
        sync.save_performance(&path).unwrap();
        let (saved, spec) = io::load_audio(&path, None, true).unwrap();
        assert_eq!(spec.sample_rate, SR);
        assert_eq!(saved.ncols(), 8 * HOP);

        sync.reset().unwrap();
        assert_eq!(sync.stats(), SyncStats::default());
        assert!(sync.path().is_empty());
        assert_eq!(sync.live_time(), 0.0);
    }

    #[test]
    fn test_invalid_construction() {
        let empty = Array2::<f32>::zeros((1, 0));
        assert!(matches!(
            Synchronizer::new(config(), &empty),
            Err(Error::EmptyAudio)
        ));
        let cfg = SyncConfig {
            max_run_count: 1,
            ..config()
        };
        assert!(Synchronizer::new(cfg, &melody(2)).is_err());
    }
}
