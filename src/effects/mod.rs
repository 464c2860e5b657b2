//! Audio effects.

pub mod phase_vocoder;

pub use phase_vocoder::{PhaseVocoder, RateHandle, StftCache, VocoderOptions};
