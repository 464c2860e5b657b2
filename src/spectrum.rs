use crate::fft::FftPlan;
use crate::window;
use ndarray::Array2;
use num_complex::Complex32;

/// Parameters of a centered, constant-padded STFT.
#[derive(Debug, Clone)]
pub struct StftConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    /// Analysis window; zero-padded to `n_fft` when shorter.
    pub window: Vec<f32>,
    pub center: bool,
}

impl StftConfig {
    /// Periodic Hann window of `win_length`, centered frames.
    pub fn hann(n_fft: usize, win_length: usize, hop_length: usize) -> Self {
        Self {
            n_fft,
            hop_length,
            window: window::hann(win_length.min(n_fft)),
            center: true,
        }
    }

    /// Number of frames the STFT of `n_samples` will produce.
    pub fn n_frames(&self, n_samples: usize) -> usize {
        let padded = if self.center {
            n_samples + 2 * (self.n_fft / 2)
        } else {
            n_samples
        };
        if padded < self.n_fft || self.hop_length == 0 {
            0
        } else {
            (padded - self.n_fft) / self.hop_length + 1
        }
    }

    fn check(&self) -> crate::Result<()> {
        if self.n_fft < 2 {
            return Err(crate::Error::InvalidSize {
                name: "n_fft",
                value: self.n_fft,
                reason: "must be >= 2",
            });
        }
        if self.hop_length == 0 {
            return Err(crate::Error::InvalidSize {
                name: "hop_length",
                value: 0,
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

impl Default for StftConfig {
    fn default() -> Self {
        Self::hann(4096, 4096, 1024)
    }
}

fn pad_signal(y: &[f32], n_fft: usize, center: bool) -> Vec<f32> {
    if !center {
        return y.to_vec();
    }
    let pad = n_fft / 2;
    let mut out = vec![0.0f32; y.len() + 2 * pad];
    out[pad..pad + y.len()].copy_from_slice(y);
    out
}

#[inline]
fn compute_frame(
    frame: usize,
    padded: &[f32],
    window: &[f32],
    fft: &mut FftPlan,
    hop_length: usize,
    n_freq: usize,
) -> Vec<Complex32> {
    let start = frame * hop_length;
    let mut buffer: Vec<Complex32> = window
        .iter()
        .enumerate()
        .map(|(i, w)| Complex32::new(padded.get(start + i).copied().unwrap_or(0.0) * w, 0.0))
        .collect();
    fft.forward(&mut buffer);
    buffer.truncate(n_freq);
    buffer
}

/// Compute the Short-Time Fourier Transform (STFT) of one channel.
///
/// # Returns
/// Complex STFT matrix of shape `(n_fft/2 + 1, n_frames)`.
///
/// # Errors
/// Returns an error if the audio is empty or non-finite, or if
/// `n_fft`/`hop_length` are degenerate.
pub fn stft(y: &[f32], config: &StftConfig) -> crate::Result<Array2<Complex32>> {
    crate::io::valid_audio(ndarray::ArrayView2::from_shape((1, y.len()), y).map_err(|_| {
        crate::Error::ShapeMismatch {
            expected: "1-D signal".into(),
            got: format!("{} samples", y.len()),
        }
    })?)?;
    config.check()?;

    let n_fft = config.n_fft;
    let window = window::pad_center(&config.window, n_fft);
    let padded = pad_signal(y, n_fft, config.center);
    let n_frames = config.n_frames(y.len());
    let n_freq = n_fft / 2 + 1;

    let frame_results: Vec<Vec<Complex32>> = {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            (0..n_frames)
                .into_par_iter()
                .map_init(
                    || FftPlan::new(n_fft),
                    |fft, frame| {
                        compute_frame(frame, &padded, &window, fft, config.hop_length, n_freq)
                    },
                )
                .collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            let mut fft = FftPlan::new(n_fft);
            (0..n_frames)
                .map(|frame| {
                    compute_frame(frame, &padded, &window, &mut fft, config.hop_length, n_freq)
                })
                .collect()
        }
    };

    let mut stft_matrix = Array2::<Complex32>::zeros((n_freq, n_frames));
    for (frame, result) in frame_results.iter().enumerate() {
        for (f, &val) in result.iter().enumerate() {
            stft_matrix[(f, frame)] = val;
        }
    }

    Ok(stft_matrix)
}
