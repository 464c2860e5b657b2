//! Conversion utilities for pitch, frequency and time.

pub(crate) const A4_HZ: f32 = 440.0;
pub(crate) const MIDI_A4: f32 = 69.0;

mod frequency;
mod pitch;
mod timing;

pub use frequency::*;
pub use pitch::*;
pub use timing::*;
