//! Variable-rate phase vocoder over a pre-computed accompaniment STFT.
//!
//! The accompaniment is analysed once into an immutable [`StftCache`].
//! [`PhaseVocoder`] then walks the cache at a fractional position `s`, moving
//! `s` by the current playback rate for every synthesized column, so the
//! accompaniment can be slowed down or sped up without changing its pitch.
//! The rate lives in a [`RateHandle`] shared with the controller.

use crate::config::SyncConfig;
use crate::convert::{bin_angular_frequencies, frame_position_to_time, samples_to_time};
use crate::fft::RealFftPlan;
use crate::spectrum::{StftConfig, stft};
use crate::window;
use crate::{Error, Result};
use ndarray::{Array2, Array3};
use num_complex::Complex32;
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Immutable `(channels, bins, frames)` STFT of the accompaniment.
#[derive(Debug, Clone)]
pub struct StftCache {
    spectra: Array3<Complex32>,
    window: Vec<f32>,
    n_fft: usize,
    win_length: usize,
    hop_length: usize,
    sample_rate: u32,
}

impl StftCache {
    /// Analyse `audio` (`(channels, samples)`) with a centered Hann STFT.
    ///
    /// # Errors
    /// `EmptyAudio`/`NonFiniteAudio` for unusable audio. `InvalidParameter` if
    /// `win_length` is not in `1..=n_fft`, `hop_length` is not in
    /// `1..=win_length`, or the window overlap-added at `hop_length` would
    /// leave gaps (NOLA).
    pub fn new(
        audio: &Array2<f32>,
        sample_rate: u32,
        n_fft: usize,
        win_length: usize,
        hop_length: usize,
    ) -> Result<Self> {
        crate::io::valid_audio(audio.view())?;
        if sample_rate == 0 {
            return Err(Error::invalid("sample_rate", sample_rate, "must be > 0"));
        }
        if n_fft < 2 {
            return Err(Error::invalid("n_fft", n_fft, "must be >= 2"));
        }
        if win_length == 0 || win_length > n_fft {
            return Err(Error::invalid(
                "win_length",
                win_length,
                &format!("must be in 1..={}", n_fft),
            ));
        }
        if hop_length == 0 || hop_length > win_length {
            return Err(Error::invalid(
                "hop_length",
                hop_length,
                &format!("must be in 1..={}", win_length),
            ));
        }
        let config = StftConfig::hann(n_fft, win_length, hop_length);
        let window = window::pad_center(&config.window, n_fft);
        if !window::satisfies_nola(&window, hop_length) {
            return Err(Error::invalid(
                "hop_length",
                hop_length,
                "window overlap-add has gaps at this hop",
            ));
        }

        let (channels, n_samples) = audio.dim();
        let n_frames = config.n_frames(n_samples);
        let mut spectra = Array3::<Complex32>::zeros((channels, n_fft / 2 + 1, n_frames));
        for (c, channel) in audio.rows().into_iter().enumerate() {
            let samples = channel.to_vec();
            let s = stft(&samples, &config)?;
            spectra.index_axis_mut(ndarray::Axis(0), c).assign(&s);
        }
        log::info!(
            "StftCache: {} channels, {} frames ({:.2}s) n_fft={} win={} hop={}",
            channels,
            n_frames,
            samples_to_time(n_samples as f64, sample_rate),
            n_fft,
            win_length,
            hop_length
        );
        Ok(Self {
            spectra,
            window,
            n_fft,
            win_length,
            hop_length,
            sample_rate,
        })
    }

    /// Build the cache with the session's analysis parameters, peak
    /// normalizing the audio first when the config asks for it.
    pub fn from_config(audio: &Array2<f32>, config: &SyncConfig) -> Result<Self> {
        if config.normalize_accompaniment {
            let normalized = peak_normalize(audio);
            Self::new(
                &normalized,
                config.sample_rate,
                config.fft_size,
                config.window_length,
                config.hop_length,
            )
        } else {
            Self::new(
                audio,
                config.sample_rate,
                config.fft_size,
                config.window_length,
                config.hop_length,
            )
        }
    }

    pub fn spectra(&self) -> &Array3<Complex32> {
        &self.spectra
    }

    pub fn channels(&self) -> usize {
        self.spectra.dim().0
    }

    pub fn n_bins(&self) -> usize {
        self.spectra.dim().1
    }

    /// Number of STFT frames `M`.
    pub fn n_frames(&self) -> usize {
        self.spectra.dim().2
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn win_length(&self) -> usize {
        self.win_length
    }

    pub fn hop_length(&self) -> usize {
        self.hop_length
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Length of the analysed audio in seconds (frame resolution).
    pub fn duration(&self) -> f64 {
        frame_position_to_time(
            self.n_frames().saturating_sub(1) as f64,
            self.sample_rate,
            self.hop_length,
        )
    }
}

/// Scale `audio` so its largest absolute sample is 1. Silence is returned as is.
pub fn peak_normalize(audio: &Array2<f32>) -> Array2<f32> {
    let peak = audio.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if peak > 0.0 && peak.is_finite() {
        audio / peak
    } else {
        audio.clone()
    }
}

/// Shared playback rate.
///
/// Cloning yields another handle to the same value. Reads and writes are
/// single atomic operations, so the controller can publish a new rate while
/// the vocoder synthesizes on another thread.
#[derive(Debug, Clone)]
pub struct RateHandle(Arc<AtomicU32>);

impl RateHandle {
    pub fn new(rate: f32) -> Self {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        Self(Arc::new(AtomicU32::new(rate.to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Publish a new rate. Non-positive or non-finite rates are rejected and
    /// the previous rate is kept.
    pub fn set(&self, rate: f32) -> bool {
        if !(rate.is_finite() && rate > 0.0) {
            log::warn!("RateHandle::set: rejected rate {}", rate);
            return false;
        }
        self.0.store(rate.to_bits(), Ordering::Relaxed);
        true
    }
}

impl Default for RateHandle {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Synthesis options of the streaming vocoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocoderOptions {
    /// Columns synthesized per refill
    pub synthesis_block: usize,
    /// Fade applied at the very start and end of the stream (0 disables)
    pub fade_length: usize,
}

impl Default for VocoderOptions {
    fn default() -> Self {
        Self {
            synthesis_block: 6,
            fade_length: 128,
        }
    }
}

impl From<&SyncConfig> for VocoderOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            synthesis_block: config.synthesis_block,
            fade_length: config.fade_length,
        }
    }
}

/// Streaming variable-rate phase vocoder.
///
/// # Example
/// ```
/// use cadenza::effects::phase_vocoder::{PhaseVocoder, RateHandle, StftCache, VocoderOptions};
/// use ndarray::Array2;
/// use std::sync::Arc;
///
/// let tone = cadenza::io::tone(440.0, 16000, 1.0);
/// let audio = Array2::from_shape_vec((1, tone.len()), tone).unwrap();
/// let cache = Arc::new(StftCache::new(&audio, 16000, 1024, 1024, 256).unwrap());
/// let rate = RateHandle::new(0.5);
/// let mut vocoder = PhaseVocoder::new(cache, rate.clone(), VocoderOptions::default()).unwrap();
///
/// let mut total = 0;
/// while let Some(block) = vocoder.get_next_frames(512) {
///     total += block.ncols();
/// }
/// assert!(total > 30000); // about twice the source length
/// ```
pub struct PhaseVocoder {
    cache: Arc<StftCache>,
    rate: RateHandle,
    options: VocoderOptions,
    phase_advance: Vec<f32>,
    phase: Array2<f32>,
    position: f64,
    fft: RealFftPlan,
    half: Vec<Complex32>,
    frame: Vec<f32>,
    overlap: Array2<f32>,
    norm: Vec<f32>,
    pending: Vec<VecDeque<f32>>,
    /// `(samples, rate)` runs covering `pending`, oldest first
    pending_rates: VecDeque<(usize, f32)>,
    column_rate: f32,
    skip: usize,
    emitted: usize,
    columns: usize,
    flushed: bool,
    played: f64,
    fade_in: Vec<f32>,
}

impl PhaseVocoder {
    /// # Errors
    /// `InvalidParameter` for a zero synthesis block or a cache with no frames.
    pub fn new(cache: Arc<StftCache>, rate: RateHandle, options: VocoderOptions) -> Result<Self> {
        if options.synthesis_block == 0 {
            return Err(Error::invalid("synthesis_block", 0, "must be >= 1"));
        }
        if cache.n_frames() == 0 {
            return Err(Error::invalid("cache", 0, "STFT cache has no frames"));
        }
        let n_fft = cache.n_fft();
        let hop = cache.hop_length() as f32;
        let channels = cache.channels();
        let phase_advance = bin_angular_frequencies(n_fft)
            .into_iter()
            .map(|w| w * hop)
            .collect();
        let phase = cache
            .spectra()
            .index_axis(ndarray::Axis(2), 0)
            .mapv(|x| x.arg());
        log::debug!(
            "PhaseVocoder: {} frames, block={} fade={} rate={}",
            cache.n_frames(),
            options.synthesis_block,
            options.fade_length,
            rate.get()
        );
        Ok(Self {
            phase_advance,
            phase,
            position: 0.0,
            fft: RealFftPlan::new(n_fft),
            half: vec![Complex32::new(0.0, 0.0); cache.n_bins()],
            frame: vec![0.0; n_fft],
            overlap: Array2::zeros((channels, n_fft)),
            norm: vec![0.0; n_fft],
            pending: vec![VecDeque::new(); channels],
            pending_rates: VecDeque::new(),
            column_rate: rate.get(),
            skip: n_fft / 2,
            emitted: 0,
            columns: 0,
            flushed: false,
            played: 0.0,
            fade_in: window::fade_in(options.fade_length),
            cache,
            rate,
            options,
        })
    }

    /// Handle to the shared playback rate.
    pub fn rate_handle(&self) -> RateHandle {
        self.rate.clone()
    }

    /// Current playback rate.
    pub fn rate(&self) -> f32 {
        self.rate.get()
    }

    /// Fractional STFT frame position `s`.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Number of columns synthesized so far.
    pub fn columns_synthesized(&self) -> usize {
        self.columns
    }

    /// Source-domain time of the synthesis position, `s · hop / sr`.
    pub fn get_time(&self) -> f64 {
        frame_position_to_time(
            self.position,
            self.cache.sample_rate(),
            self.cache.hop_length(),
        )
    }

    /// Source-domain seconds handed out by [`get_next_frames`](Self::get_next_frames),
    /// each sample weighted by the rate it was synthesized at.
    pub fn played_time(&self) -> f64 {
        self.played
    }

    /// True once the whole cache has been synthesized and handed out.
    pub fn is_finished(&self) -> bool {
        self.flushed && self.pending_len() == 0
    }

    pub fn cache(&self) -> &StftCache {
        &self.cache
    }

    /// Produce the next `n` output samples per channel.
    ///
    /// Returns exactly `n` columns while the accompaniment lasts, then one
    /// shorter final block, then `None`.
    pub fn get_next_frames(&mut self, n: usize) -> Option<Array2<f32>> {
        let last_frame = self.cache.n_frames().saturating_sub(1) as f64;
        while self.pending_len() < n && self.position < last_frame {
            self.synthesize_block(last_frame);
        }
        if self.position >= last_frame && !self.flushed {
            self.flush();
        }

        let available = self.pending_len();
        let count = if available >= n {
            n
        } else if self.flushed && available > 0 {
            available
        } else {
            return None;
        };
        if count == 0 {
            return None;
        }

        let mut out = Array2::<f32>::zeros((self.cache.channels(), count));
        for (c, queue) in self.pending.iter_mut().enumerate() {
            for (i, v) in queue.drain(..count).enumerate() {
                out[(c, i)] = v;
            }
        }
        self.played += self.take_played(count);
        Some(out)
    }

    /// Source seconds covered by the next `count` pending samples.
    fn take_played(&mut self, mut count: usize) -> f64 {
        let mut source_samples = 0.0;
        while count > 0 {
            let Some(run) = self.pending_rates.front_mut() else {
                break;
            };
            let n = run.0.min(count);
            source_samples += n as f64 * run.1 as f64;
            run.0 -= n;
            count -= n;
            if run.0 == 0 {
                self.pending_rates.pop_front();
            }
        }
        samples_to_time(source_samples, self.cache.sample_rate())
    }

    fn pending_len(&self) -> usize {
        self.pending.first().map_or(0, |q| q.len())
    }

    fn synthesize_block(&mut self, last_frame: f64) {
        for _ in 0..self.options.synthesis_block {
            if self.position >= last_frame {
                break;
            }
            self.synthesize_column();
        }
    }

    /// Emit one column at the current position, then advance phase and position.
    fn synthesize_column(&mut self) {
        let spectra = self.cache.spectra();
        let s0 = self.position.floor() as usize;
        let alpha = (self.position - s0 as f64) as f32;
        let n_fft = self.cache.n_fft();
        let hop = self.cache.hop_length();
        let window = &self.cache.window;
        self.column_rate = self.rate.get();

        for c in 0..self.cache.channels() {
            for k in 0..self.half.len() {
                let a = spectra[(c, k, s0)];
                let b = spectra[(c, k, s0 + 1)];
                let mag = (1.0 - alpha) * a.norm() + alpha * b.norm();
                let phi = self.phase[(c, k)];
                self.half[k] = Complex32::from_polar(mag, phi);

                let expected = self.phase_advance[k];
                let delta = wrap_phase(b.arg() - a.arg() - expected);
                self.phase[(c, k)] = wrap_phase(phi + expected + delta);
            }

            if let Err(e) = self.fft.inverse(&self.half, &mut self.frame) {
                log::warn!("PhaseVocoder: inverse FFT failed: {}", e);
                self.frame.iter_mut().for_each(|v| *v = 0.0);
            }
            let mut acc = self.overlap.row_mut(c);
            for i in 0..n_fft {
                acc[i] += self.frame[i] * window[i];
            }
        }
        for (n, w) in self.norm.iter_mut().zip(window.iter()) {
            *n += w * w;
        }

        // the first hop can no longer receive contributions
        self.release(hop);
        self.columns += 1;
        self.position += self.column_rate as f64;
    }

    /// Normalize and move the first `count` accumulator samples to the
    /// output queue, then shift the accumulator left by `count`.
    fn release(&mut self, count: usize) {
        let n_fft = self.cache.n_fft();
        let count = count.min(n_fft);
        let mut queued = 0;
        for i in 0..count {
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            queued += 1;
            let norm = self.norm[i];
            let gain = self.fade_in.get(self.emitted).copied().unwrap_or(1.0);
            for (c, queue) in self.pending.iter_mut().enumerate() {
                let v = self.overlap[(c, i)];
                let v = if norm > 1e-8 { v / norm } else { v };
                queue.push_back(v * gain);
            }
            self.emitted += 1;
        }
        match self.pending_rates.back_mut() {
            Some(run) if run.1 == self.column_rate => run.0 += queued,
            _ if queued > 0 => self.pending_rates.push_back((queued, self.column_rate)),
            _ => {}
        }
        for mut row in self.overlap.rows_mut() {
            if let Some(slice) = row.as_slice_mut() {
                slice.copy_within(count.., 0);
                slice[n_fft - count..].iter_mut().for_each(|v| *v = 0.0);
            }
        }
        self.norm.copy_within(count.., 0);
        self.norm[n_fft - count..].iter_mut().for_each(|v| *v = 0.0);
    }

    /// Drain the accumulator tail once the cache is exhausted, dropping the
    /// final half window of centering padding, and fade the stream out.
    fn flush(&mut self) {
        let n_fft = self.cache.n_fft();
        let hop = self.cache.hop_length();
        if self.columns > 0 {
            let tail = (n_fft - hop).saturating_sub(n_fft / 2);
            self.release(tail);
        }
        self.flushed = true;

        let fade = window::fade_out(self.options.fade_length.min(self.pending_len()));
        for queue in self.pending.iter_mut() {
            let start = queue.len() - fade.len();
            for (v, g) in queue.range_mut(start..).zip(fade.iter()) {
                *v *= g;
            }
        }
        log::debug!(
            "PhaseVocoder: exhausted after {} columns, {} samples emitted",
            self.columns,
            self.emitted
        );
    }
}

fn wrap_phase(phase: f32) -> f32 {
    phase - 2.0 * PI * (phase / (2.0 * PI)).round()
}

/// Stretch a mono signal by a constant `rate` (> 1 is faster and shorter).
///
/// Offline convenience over [`PhaseVocoder`]; no fades are applied.
pub fn time_stretch(
    y: &[f32],
    sr: u32,
    rate: f32,
    n_fft: usize,
    hop_length: usize,
) -> Result<Vec<f32>> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(Error::invalid("rate", rate, "must be positive"));
    }
    let audio = Array2::from_shape_vec((1, y.len()), y.to_vec())?;
    let cache = Arc::new(StftCache::new(&audio, sr, n_fft, n_fft, hop_length)?);
    let options = VocoderOptions {
        synthesis_block: 8,
        fade_length: 0,
    };
    let mut vocoder = PhaseVocoder::new(cache, RateHandle::new(rate), options)?;
    let mut out = Vec::with_capacity((y.len() as f32 / rate) as usize + n_fft);
    while let Some(block) = vocoder.get_next_frames(4 * hop_length) {
        out.extend(block.row(0).iter());
    }
    Ok(out)
}
