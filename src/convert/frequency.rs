/// Get FFT bin frequencies.
///
/// # Example
/// ```
/// use cadenza::convert::fft_frequencies;
///
/// let freqs = fft_frequencies(16000, 2048);
/// assert_eq!(freqs.len(), 1025);
/// assert_eq!(freqs[0], 0.0);
/// ```
pub fn fft_frequencies(sr: u32, n_fft: usize) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    (0..n_bins)
        .map(|i| i as f32 * sr as f32 / n_fft as f32)
        .collect()
}

/// Expected phase advance per sample of every rfft bin, `2πk / n_fft`.
pub fn bin_angular_frequencies(n_fft: usize) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    (0..n_bins)
        .map(|k| 2.0 * std::f32::consts::PI * k as f32 / n_fft as f32)
        .collect()
}
