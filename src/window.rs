use std::f32::consts::{E, PI};

/// Compute a periodic Hann (raised cosine) window.
///
/// This is the analysis/synthesis window of the accompaniment STFT.
///
/// # Arguments
/// * `n` - Window length
///
/// # Returns
/// Hann window of length `n`
pub fn hann(n: usize) -> Vec<f32> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![1.0];
    }
    let m = n as f32;
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / m).cos())
        .collect()
}

/// Compute a symmetric Hann window (both end points are zero).
///
/// The feature extractor windows its frames with this variant and builds the
/// pitch filterbank triangles from it.
pub fn hann_symmetric(n: usize) -> Vec<f32> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![1.0];
    }
    let m = (n - 1) as f32;
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / m).cos())
        .collect()
}

/// Zero-pad a window symmetrically to `n_fft` samples.
pub fn pad_center(window: &[f32], n_fft: usize) -> Vec<f32> {
    if window.len() >= n_fft {
        return window[..n_fft].to_vec();
    }
    let mut padded = vec![0.0f32; n_fft];
    let start = (n_fft - window.len()) / 2;
    padded[start..start + window.len()].copy_from_slice(window);
    padded
}

/// Logarithmic fade-in gain curve, rising from 0 to 1 over `n` samples.
///
/// `ln(linspace(1, e, n))`, the ramp the accompaniment player applies at
/// stream boundaries.
pub fn fade_in(n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let step = (E - 1.0) / (n - 1) as f32;
            (0..n).map(|i| (1.0 + step * i as f32).ln()).collect()
        }
    }
}

/// Logarithmic fade-out gain curve, falling from 1 to 0 over `n` samples.
pub fn fade_out(n: usize) -> Vec<f32> {
    let mut curve = fade_in(n);
    curve.reverse();
    curve
}

/// Compute the sum of squared window values for overlap-add processing.
///
/// Used to check the NOLA (nonzero overlap-add) constraint that lossless
/// overlap-add resynthesis needs.
///
/// # Returns
/// An array of length `(n_frames - 1) * hop_length + window.len()`.
pub fn window_sumsquare(window: &[f32], n_frames: usize, hop_length: usize) -> Vec<f32> {
    if window.is_empty() || n_frames == 0 || hop_length == 0 {
        return Vec::new();
    }

    let out_len = (n_frames - 1) * hop_length + window.len();
    let mut wss = vec![0.0f32; out_len];
    for frame_idx in 0..n_frames {
        let offset = frame_idx * hop_length;
        for (i, &w) in window.iter().enumerate() {
            wss[offset + i] += w * w;
        }
    }
    wss
}

/// True when `window` overlap-added at `hop_length` never sums to zero in
/// the steady-state region.
pub fn satisfies_nola(window: &[f32], hop_length: usize) -> bool {
    if window.is_empty() || hop_length == 0 || hop_length > window.len() {
        return false;
    }
    let n_frames = window.len().div_ceil(hop_length) * 2 + 1;
    let wss = window_sumsquare(window, n_frames, hop_length);
    let start = window.len();
    let end = wss.len().saturating_sub(window.len());
    (start..end).all(|i| wss[i] > 1e-8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hann_periodic_and_symmetric() {
        let p = hann(8);
        assert_relative_eq!(p[0], 0.0);
        assert_relative_eq!(p[4], 1.0, epsilon = 1e-6);

        let s = hann_symmetric(9);
        assert_relative_eq!(s[0], 0.0);
        assert_relative_eq!(s[8], 0.0, epsilon = 1e-6);
        assert_relative_eq!(s[4], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_fade_curves() {
        let up = fade_in(128);
        assert_relative_eq!(up[0], 0.0);
        assert_relative_eq!(up[127], 1.0, epsilon = 1e-5);
        assert!(up.windows(2).all(|w| w[1] >= w[0]));

        let down = fade_out(128);
        assert_relative_eq!(down[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(down[127], 0.0);
    }

    #[test]
    fn test_window_sumsquare_quarter_hop_is_flat() {
        let window = hann(512);
        let wss = window_sumsquare(&window, 12, 128);
        assert_eq!(wss.len(), 11 * 128 + 512);
        for &v in &wss[512..wss.len() - 512] {
            assert_relative_eq!(v, 1.5, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_nola() {
        assert!(satisfies_nola(&hann(512), 128));
        assert!(satisfies_nola(&hann(512), 256));
        assert!(!satisfies_nola(&hann(512), 1024));
    }

    #[test]
    fn test_pad_center() {
        let w = pad_center(&[1.0, 1.0], 6);
        assert_eq!(w, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }
}
