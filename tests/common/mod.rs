#![allow(dead_code)]

use cadenza::SyncConfig;
use ndarray::Array2;

pub const SR: u32 = 16000;
pub const HOP: usize = 512;

pub fn config() -> SyncConfig {
    SyncConfig {
        sample_rate: SR,
        hop_length: HOP,
        fft_size: 2048,
        window_length: 2048,
        search_width: 4,
        ..SyncConfig::default()
    }
}

/// A melody of `notes` hop-long notes cycling through MIDI 69..=80, with
/// every note held for `hops_per_note` hops.
pub fn melody(notes: usize, hops_per_note: usize) -> Vec<f32> {
    let pitches: Vec<f32> = (0..notes).map(|n| 69.0 + (n % 12) as f32).collect();
    tune(&pitches, hops_per_note)
}

/// Sine notes at the given MIDI pitches, each held for `hops_per_note` hops.
pub fn tune(pitches: &[f32], hops_per_note: usize) -> Vec<f32> {
    let len = HOP * hops_per_note;
    let mut samples = Vec::with_capacity(pitches.len() * len);
    for &midi in pitches {
        let f = cadenza::convert::midi_to_hz(midi);
        let w = 2.0 * std::f32::consts::PI * f / SR as f32;
        samples.extend((0..len).map(|i| 0.5 * (w * i as f32).sin()));
    }
    samples
}

/// Seconds per tick of [`config`].
pub fn tick() -> f64 {
    HOP as f64 / SR as f64
}

pub fn as_row(samples: &[f32]) -> Array2<f32> {
    Array2::from_shape_vec((1, samples.len()), samples.to_vec()).unwrap()
}

/// Split mono audio into `(1, HOP)` tick frames (the last one may be short).
pub fn hops(samples: &[f32]) -> Vec<Array2<f32>> {
    samples.chunks(HOP).map(as_row).collect()
}
