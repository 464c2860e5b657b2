//! Online alignment of a live feature stream against a reference sequence.

mod cost;
mod otw;

pub use cost::CostMatrix;
pub use otw::{OnlineTimeWarping, OtwParams, Step};
