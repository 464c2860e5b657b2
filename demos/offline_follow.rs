//! Offline Following Example
//!
//! Simulates a live session without an audio device:
//! - Synthesizing a reference melody and a bass accompaniment in its tempo
//! - "Performing" the melody 25% slower
//! - Feeding the performance hop by hop through the synchronizer
//! - Rendering the accompaniment with the phase vocoder at the controlled rate
//!
//! Usage: `cargo run --example offline_follow [output.wav]`

use cadenza::{StepOutcome, SyncConfig, convert, io, synchronizer};
use log::info;
use ndarray::Array2;

const SR: u32 = 16000;

/// Render `notes` (MIDI numbers), each lasting `note_seconds`.
fn render(notes: &[f32], note_seconds: f32, gain: f32) -> Vec<f32> {
    let note_len = (note_seconds * SR as f32) as usize;
    let mut out = Vec::with_capacity(notes.len() * note_len);
    for &note in notes {
        let w = 2.0 * std::f32::consts::PI * convert::midi_to_hz(note) / SR as f32;
        for i in 0..note_len {
            let envelope = (1.0 - i as f32 / note_len as f32).powf(0.3);
            out.push(gain * envelope * (w * i as f32).sin());
        }
    }
    out
}

fn main() -> cadenza::Result<()> {
    env_logger::init();
    let output = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "offline_follow.wav".to_string());

    let config = SyncConfig {
        sample_rate: SR,
        hop_length: 512,
        fft_size: 2048,
        window_length: 2048,
        search_width: 8,
        ..SyncConfig::default()
    };
    let hop = config.hop_length;

    let melody = [72.0, 74.0, 76.0, 77.0, 79.0, 77.0, 76.0, 74.0, 72.0, 67.0, 69.0, 71.0];
    let bass: Vec<f32> = melody.iter().map(|n| n - 24.0).collect();
    let reference = render(&melody, 0.4, 0.5);
    let accompaniment = render(&bass, 0.4, 0.4);
    let performance = render(&melody, 0.5, 0.5);
    info!(
        "Reference {:.2}s, performance {:.2}s",
        reference.len() as f32 / SR as f32,
        performance.len() as f32 / SR as f32
    );

    let reference = Array2::from_shape_vec((1, reference.len()), reference)?;
    let accompaniment = Array2::from_shape_vec((1, accompaniment.len()), accompaniment)?;
    let (mut sync, mut vocoder) = synchronizer::session(config, &reference, &accompaniment)?;

    let mut rendered: Vec<f32> = Vec::new();
    for (tick, hop_samples) in performance.chunks(hop).enumerate() {
        let frames = Array2::from_shape_vec((1, hop_samples.len()), hop_samples.to_vec())?;
        match sync.step(frames.view(), vocoder.get_time()) {
            StepOutcome::Tracking(report) => {
                if tick % 10 == 0 {
                    info!(
                        "tick {:4}: ref {:.2}s acc {:.2}s rate {:.2}",
                        tick,
                        report.estimated_reference_time,
                        vocoder.get_time(),
                        report.rate
                    );
                }
            }
            StepOutcome::SessionEnded => break,
        }
        match vocoder.get_next_frames(hop) {
            Some(block) => rendered.extend(block.row(0).iter()),
            None => break,
        }
    }
    while let Some(block) = vocoder.get_next_frames(hop) {
        rendered.extend(block.row(0).iter());
    }

    let stats = sync.stats();
    info!(
        "{} ticks, {} shape errors, {} dropped frames, {:.2}s rendered",
        stats.ticks,
        stats.frame_shape_errors,
        stats.dropped_frames,
        rendered.len() as f32 / SR as f32
    );

    let rendered = Array2::from_shape_vec((1, rendered.len()), rendered)?;
    io::save_wav(&output, &rendered, SR)?;
    info!("Wrote {}", output);
    Ok(())
}
