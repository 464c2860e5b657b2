use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Forward complex FFT plan with a reusable scratch buffer.
///
/// Used by the accompaniment STFT, one plan per worker.
///
/// # Example
/// ```
/// use cadenza::fft::FftPlan;
/// use num_complex::Complex32;
///
/// let mut plan = FftPlan::new(512);
/// let mut buffer = vec![Complex32::new(0.0, 0.0); 512];
/// buffer[0] = Complex32::new(1.0, 0.0);
/// plan.forward(&mut buffer);
/// assert!(buffer.iter().all(|v| (v.re - 1.0).abs() < 1e-6 && v.im.abs() < 1e-6));
/// ```
pub struct FftPlan {
    forward: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
    len: usize,
}

impl FftPlan {
    /// Create a new FFT plan for a given size.
    pub fn new(len: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(len);
        let scratch_len = forward.get_inplace_scratch_len();
        Self {
            forward,
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Forward FFT in-place.
    pub fn forward(&mut self, buffer: &mut [Complex32]) {
        self.forward.process_with_scratch(buffer, &mut self.scratch);
    }
}

/// Real-input FFT plan (`realfft`) for the feature extractor and the
/// vocoder's per-column synthesis.
///
/// Holds the input, spectrum and scratch buffers so a transform per tick is
/// allocation free.
pub struct RealFftPlan {
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl RealFftPlan {
    pub fn new(len: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let r2c = planner.plan_fft_forward(len);
        let c2r = planner.plan_fft_inverse(len);
        let scratch_len = r2c.get_scratch_len().max(c2r.get_scratch_len());
        Self {
            input: r2c.make_input_vec(),
            spectrum: r2c.make_output_vec(),
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            r2c,
            c2r,
        }
    }

    /// Number of non-redundant bins (`len/2 + 1`).
    pub fn n_bins(&self) -> usize {
        self.spectrum.len()
    }

    /// Transform `signal` (zero-padded or truncated to the plan length).
    ///
    /// Returns the half spectrum, valid until the next call.
    pub fn forward(&mut self, signal: &[f32]) -> crate::Result<&[Complex32]> {
        let n = self.input.len().min(signal.len());
        self.input[..n].copy_from_slice(&signal[..n]);
        for v in self.input[n..].iter_mut() {
            *v = 0.0;
        }
        self.r2c
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)?;
        Ok(&self.spectrum)
    }

    /// Inverse real FFT of a half spectrum, scaled by `1/len`.
    pub fn inverse(&mut self, half: &[Complex32], out: &mut [f32]) -> crate::Result<()> {
        let len = self.input.len();
        if half.len() != self.spectrum.len() || out.len() < len {
            return Err(crate::Error::ShapeMismatch {
                expected: format!("{} bins into {} samples", self.spectrum.len(), len),
                got: format!("{} bins into {} samples", half.len(), out.len()),
            });
        }
        self.spectrum.copy_from_slice(half);
        // DC and Nyquist bins must be real for the c2r transform
        if let Some(first) = self.spectrum.first_mut() {
            first.im = 0.0;
        }
        if len % 2 == 0
            && let Some(last) = self.spectrum.last_mut()
        {
            last.im = 0.0;
        }
        self.c2r
            .process_with_scratch(&mut self.spectrum, &mut self.input, &mut self.scratch)?;
        let scale = 1.0 / len as f32;
        for (o, v) in out.iter_mut().zip(self.input.iter()) {
            *o = v * scale;
        }
        Ok(())
    }
}
