use super::{A4_HZ, MIDI_A4};

/// Convert a (possibly fractional) MIDI note number to frequency (Hz).
///
/// # Example
/// ```
/// use cadenza::convert::midi_to_hz;
///
/// assert_eq!(midi_to_hz(69.0), 440.0);
/// assert!((midi_to_hz(60.0) - 261.6256).abs() < 1e-3);
/// ```
pub fn midi_to_hz(note: f32) -> f32 {
    A4_HZ * 2.0f32.powf((note - MIDI_A4) / 12.0)
}

/// Center frequencies of the MIDI pitches `start..end`, shifted by `tuning`
/// semitones.
pub fn pitch_frequencies(start: f32, end: usize, tuning: f32) -> Vec<f32> {
    let count = (end as f32 - start).ceil().max(0.0) as usize;
    (0..count)
        .map(|i| midi_to_hz(start + i as f32 + tuning))
        .collect()
}

/// Pitch class (0 = C, 11 = B) of a MIDI note.
pub fn pitch_class(note: usize) -> usize {
    note % 12
}
