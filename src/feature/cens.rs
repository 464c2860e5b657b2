use crate::convert::{fft_frequencies, pitch_class, pitch_frequencies};
use crate::fft::RealFftPlan;
use crate::window;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView1};

/// Number of pitch classes in a CENS vector (index 0 = C).
pub const CENS_BINS: usize = 12;

const N_PITCHES: usize = 128;
const TRIANGLE_POINTS: usize = 128;
// Upper-exclusive thresholds of the logarithmic quantizer; a value above
// threshold `i` scores `i + 1`.
const QUANT_THRESHOLDS: [f32; 4] = [0.05, 0.1, 0.2, 0.4];

/// Pitch filterbank mapping an rfft power spectrum to 128 MIDI pitches.
///
/// Row `p` is a Hann-shaped bump spanning the frequencies of MIDI `p - 0.5`
/// to `p + 0.5` (shifted by `tuning` semitones), sampled at every FFT bin.
///
/// # Returns
/// Matrix of shape `(128, n_fft/2 + 1)`
pub fn pitch_filterbank(sr: u32, n_fft: usize, tuning: f32) -> Array2<f32> {
    let bin_freqs = fft_frequencies(sr, n_fft);
    let edges = pitch_frequencies(-0.5 + tuning, N_PITCHES, 0.0);
    let bump = window::hann_symmetric(TRIANGLE_POINTS);
    let last = (TRIANGLE_POINTS - 1) as f32;

    let mut fb = Array2::<f32>::zeros((N_PITCHES, bin_freqs.len()));
    for (p, pair) in edges.windows(2).take(N_PITCHES).enumerate() {
        let (lo, hi) = (pair[0], pair[1]);
        for (k, &f) in bin_freqs.iter().enumerate() {
            if f < lo || f > hi {
                continue;
            }
            let pos = (f - lo) / (hi - lo) * last;
            let i = (pos.floor() as usize).min(TRIANGLE_POINTS - 2);
            let frac = pos - i as f32;
            fb[(p, k)] = bump[i] * (1.0 - frac) + bump[i + 1] * frac;
        }
    }
    fb
}

/// Fold a pitch filterbank onto the 12 pitch classes.
pub fn chroma_filterbank(sr: u32, n_fft: usize, tuning: f32) -> Array2<f32> {
    let pitches = pitch_filterbank(sr, n_fft, tuning);
    let mut chroma = Array2::<f32>::zeros((CENS_BINS, pitches.ncols()));
    for (p, row) in pitches.rows().into_iter().enumerate() {
        let mut target = chroma.row_mut(pitch_class(p));
        target += &row;
    }
    chroma
}

/// Turn a raw 12-bin chroma energy vector into a CENS vector.
///
/// L1 normalization, logarithmic quantization to `{0, 1, 2, 3, 4}`, then L2
/// normalization. Zero energy at either normalization falls back to a uniform
/// vector.
pub fn cens_from_chroma(chroma: [f32; CENS_BINS]) -> [f32; CENS_BINS] {
    let l1: f32 = chroma.iter().map(|v| v.abs()).sum();
    let distribution = if l1 > 0.0 && l1.is_finite() {
        chroma.map(|v| v / l1)
    } else {
        [1.0 / CENS_BINS as f32; CENS_BINS]
    };

    let quantized =
        distribution.map(|v| QUANT_THRESHOLDS.iter().filter(|&&t| v > t).count() as f32);

    let l2 = quantized.iter().map(|v| v * v).sum::<f32>().sqrt();
    if l2 > 0.0 {
        quantized.map(|v| v / l2)
    } else {
        [1.0 / (CENS_BINS as f32).sqrt(); CENS_BINS]
    }
}

/// Streaming CENS extractor.
///
/// All buffers and the FFT plan are allocated once at construction, so
/// [`CensExtractor::extract`] can run inside the real-time tick.
///
/// # Example
/// ```
/// use cadenza::feature::CensExtractor;
/// use cadenza::io;
///
/// let mut extractor = CensExtractor::new(16000, 4096).unwrap();
/// let a440 = io::tone(440.0, 16000, 0.25);
/// let cens = extractor.extract(&a440);
/// let loudest = (0..12).max_by(|&a, &b| cens[a].total_cmp(&cens[b])).unwrap();
/// assert_eq!(loudest, 9); // A
/// ```
pub struct CensExtractor {
    sample_rate: u32,
    n_fft: usize,
    window: Vec<f32>,
    filterbank: Array2<f32>,
    fft: RealFftPlan,
    frame: Vec<f32>,
    power: Vec<f32>,
}

impl CensExtractor {
    /// # Errors
    /// `InvalidParameter` if `sample_rate` is zero or `n_fft < 2`.
    pub fn new(sample_rate: u32, n_fft: usize) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::invalid("sample_rate", sample_rate, "must be > 0"));
        }
        if n_fft < 2 {
            return Err(Error::invalid("n_fft", n_fft, "must be >= 2"));
        }
        let filterbank = chroma_filterbank(sample_rate, n_fft, 0.0);
        log::debug!(
            "CensExtractor: sr={} n_fft={} bins={}",
            sample_rate,
            n_fft,
            filterbank.ncols()
        );
        Ok(Self {
            sample_rate,
            n_fft,
            window: window::hann_symmetric(n_fft),
            power: vec![0.0; filterbank.ncols()],
            filterbank,
            fft: RealFftPlan::new(n_fft),
            frame: vec![0.0; n_fft],
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    /// Folded `(12, n_fft/2 + 1)` chroma filterbank.
    pub fn filterbank(&self) -> &Array2<f32> {
        &self.filterbank
    }

    /// Compute the CENS vector of one block of mono samples.
    ///
    /// Input shorter than `n_fft` is zero-padded, longer input is truncated.
    /// Non-finite samples count as silence.
    pub fn extract(&mut self, samples: &[f32]) -> [f32; CENS_BINS] {
        let n = samples.len().min(self.n_fft);
        for (i, out) in self.frame.iter_mut().enumerate() {
            let s = if i < n { samples[i] } else { 0.0 };
            *out = if s.is_finite() { s * self.window[i] } else { 0.0 };
        }

        match self.fft.forward(&self.frame) {
            Ok(spectrum) => {
                for (p, x) in self.power.iter_mut().zip(spectrum.iter()) {
                    *p = x.norm_sqr();
                }
            }
            Err(e) => {
                log::warn!("CensExtractor::extract: FFT failed: {}", e);
                self.power.iter_mut().for_each(|p| *p = 0.0);
            }
        }

        let power = ArrayView1::from(&self.power[..]);
        let mut chroma = [0.0f32; CENS_BINS];
        for (c, row) in self.filterbank.rows().into_iter().enumerate() {
            chroma[c] = row.dot(&power);
        }
        cens_from_chroma(chroma)
    }
}

/// CENS sequence of a mono reference recording.
///
/// The audio is cut into consecutive `hop`-sample chunks (the last one
/// zero-padded) and each chunk goes through [`CensExtractor::extract`], which
/// is exactly what the live path does with each incoming hop. Feeding the
/// reference back as live input therefore reproduces these columns.
///
/// # Returns
/// Matrix of shape `(12, ceil(len / hop))`
///
/// # Errors
/// `EmptyAudio`/`NonFiniteAudio` for unusable audio, `InvalidSize` for a zero hop.
pub fn reference_features(
    extractor: &mut CensExtractor,
    samples: &[f32],
    hop: usize,
) -> Result<Array2<f32>> {
    if samples.is_empty() {
        return Err(Error::EmptyAudio);
    }
    if !samples.iter().all(|v| v.is_finite()) {
        return Err(Error::NonFiniteAudio);
    }
    if hop == 0 {
        return Err(Error::InvalidSize {
            name: "hop",
            value: 0,
            reason: "must be > 0",
        });
    }
    let n_frames = samples.len().div_ceil(hop);
    let mut features = Array2::<f32>::zeros((CENS_BINS, n_frames));
    for (m, chunk) in samples.chunks(hop).enumerate() {
        let cens = extractor.extract(chunk);
        for (c, v) in cens.iter().enumerate() {
            features[(c, m)] = *v;
        }
    }
    log::debug!("reference_features: {} frames from {} samples", n_frames, samples.len());
    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::midi_to_hz;
    use approx::assert_relative_eq;

    fn l2(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_filterbank_shape_and_folding() {
        let pitches = pitch_filterbank(16000, 4096, 0.0);
        assert_eq!(pitches.dim(), (128, 2049));
        let chroma = chroma_filterbank(16000, 4096, 0.0);
        assert_eq!(chroma.dim(), (12, 2049));
        let total_pitch: f32 = pitches.sum();
        let total_chroma: f32 = chroma.sum();
        assert_relative_eq!(total_pitch, total_chroma, max_relative = 1e-4);
    }

    #[test]
    fn test_filterbank_peaks_at_pitch_center() {
        let fb = pitch_filterbank(16000, 4096, 0.0);
        let freqs = fft_frequencies(16000, 4096);
        let a4 = midi_to_hz(69.0);
        let nearest = freqs
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - a4).abs().total_cmp(&(b.1 - a4).abs()))
            .map(|(k, _)| k)
            .unwrap();
        assert!(fb[(69, nearest)] > 0.9);
        assert_eq!(fb[(60, nearest)], 0.0);
    }

    #[test]
    fn test_quantization_levels() {
        let mut chroma = [0.0f32; 12];
        chroma[0] = 5.0;
        chroma[1] = 3.0;
        chroma[2] = 1.5;
        chroma[3] = 0.5;
        let cens = cens_from_chroma(chroma);
        let norm = 29.0f32.sqrt();
        assert_relative_eq!(cens[0], 4.0 / norm, epsilon = 1e-6);
        assert_relative_eq!(cens[1], 3.0 / norm, epsilon = 1e-6);
        assert_relative_eq!(cens[2], 2.0 / norm, epsilon = 1e-6);
        assert_eq!(cens[3], 0.0);
        assert_relative_eq!(l2(&cens), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_silence_is_uniform() {
        let mut extractor = CensExtractor::new(16000, 2048).unwrap();
        let cens = extractor.extract(&vec![0.0; 2048]);
        for v in cens {
            assert_relative_eq!(v, 1.0 / 12.0f32.sqrt(), epsilon = 1e-6);
        }
        let nan = extractor.extract(&[f32::NAN; 64]);
        assert_eq!(nan, cens);
    }

    #[test]
    fn test_extract_is_deterministic_and_padded() {
        let mut extractor = CensExtractor::new(16000, 4096).unwrap();
        let y: Vec<f32> = crate::io::tone(523.25, 16000, 0.1).into_iter().take(1024).collect();
        let a = extractor.extract(&y);
        let b = extractor.extract(&y);
        assert_eq!(a, b);

        let mut padded = y.clone();
        padded.resize(4096, 0.0);
        assert_eq!(extractor.extract(&padded), a);
        assert_relative_eq!(l2(&a), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_major_triad() {
        let sr = 16000;
        let notes = [60.0, 64.0, 67.0].map(midi_to_hz);
        let y: Vec<f32> = (0..4096)
            .map(|i| {
                notes
                    .iter()
                    .map(|f| (2.0 * std::f32::consts::PI * f * i as f32 / sr as f32).sin())
                    .sum::<f32>()
            })
            .collect();
        let mut extractor = CensExtractor::new(sr, 4096).unwrap();
        let cens = extractor.extract(&y);
        let mut order: Vec<usize> = (0..12).collect();
        order.sort_by(|&a, &b| cens[b].total_cmp(&cens[a]));
        let mut top = order[..3].to_vec();
        top.sort();
        assert_eq!(top, vec![0, 4, 7]);
    }

    #[test]
    fn test_reference_features_shape() {
        let mut extractor = CensExtractor::new(16000, 4096).unwrap();
        let y = crate::io::tone(440.0, 16000, 0.625);
        let features = reference_features(&mut extractor, &y, 1024).unwrap();
        assert_eq!(features.dim(), (12, 10));
        for column in features.columns() {
            assert_relative_eq!(column.dot(&column).sqrt(), 1.0, epsilon = 1e-5);
            assert!(column.iter().all(|&v| v >= 0.0));
        }
        assert!(reference_features(&mut extractor, &y, 0).is_err());
        assert!(matches!(
            reference_features(&mut extractor, &[], 1024),
            Err(Error::EmptyAudio)
        ));
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(CensExtractor::new(0, 4096).is_err());
        assert!(CensExtractor::new(16000, 1).is_err());
    }
}
