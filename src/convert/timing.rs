/// Convert a fractional frame position to time (seconds).
pub fn frame_position_to_time(position: f64, sr: u32, hop_length: usize) -> f64 {
    position * hop_length as f64 / sr as f64
}

/// Convert samples to time (seconds).
pub fn samples_to_time(samples: f64, sr: u32) -> f64 {
    samples / sr as f64
}
