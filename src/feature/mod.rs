//! Feature extraction.
//!
//! The follower aligns on CENS (Chroma Energy Normalized Statistics)
//! vectors: 12-bin pitch-class profiles, coarsely quantized so that timbre
//! and dynamics matter less than harmonic content.

pub mod cens;

pub use cens::{CENS_BINS, CensExtractor, reference_features};
