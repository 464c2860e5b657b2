//! Playback-rate control.
//!
//! Each tick the synchronizer measures a timing error (seconds, positive when
//! the accompaniment is ahead of the soloist) and asks a [`RateController`]
//! for the next playback rate. The controller optionally smooths the error
//! with a scalar [`KalmanFilter`] and then runs either a [`Pid`] or a
//! [`FuzzyController`]. The output is always clamped to
//! `[1/max_run_count, max_run_count]`.

pub mod fuzzy;
pub mod kalman;
pub mod pid;

pub use fuzzy::FuzzyController;
pub use kalman::KalmanFilter;
pub use pid::Pid;

use crate::config::{ControllerConfig, SyncConfig};

/// The control law selected in the session config.
#[derive(Debug, Clone, PartialEq)]
pub enum Controller {
    Pid(Pid),
    Fuzzy(FuzzyController),
}

impl Controller {
    fn update(&mut self, error: f32) -> f32 {
        match self {
            Controller::Pid(pid) => pid.update(error),
            Controller::Fuzzy(fuzzy) => fuzzy.update(error),
        }
    }
}

/// Timing error in, clamped playback rate out.
#[derive(Debug, Clone)]
pub struct RateController {
    controller: Controller,
    kalman: Option<KalmanFilter>,
    bounds: (f32, f32),
}

impl RateController {
    pub fn new(config: &SyncConfig) -> Self {
        let bounds = config.rate_bounds();
        let controller = match config.controller {
            ControllerConfig::Pid { kp, ki, kd } => {
                Controller::Pid(Pid::new(kp, ki, kd, config.tick_seconds(), bounds))
            }
            ControllerConfig::Fuzzy => Controller::Fuzzy(FuzzyController::new(bounds)),
        };
        Self {
            controller,
            kalman: config.kalman.as_ref().map(KalmanFilter::new),
            bounds,
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn bounds(&self) -> (f32, f32) {
        self.bounds
    }

    /// Produce the next rate for a measured timing error.
    ///
    /// A non-finite error is treated as zero.
    pub fn update(&mut self, error: f32) -> f32 {
        let error = if error.is_finite() { error } else { 0.0 };
        let filtered = match self.kalman.as_mut() {
            Some(kalman) => kalman.update(error),
            None => error,
        };
        let rate = self.controller.update(filtered);
        if rate.is_finite() {
            rate.clamp(self.bounds.0, self.bounds.1)
        } else {
            1.0
        }
    }

    pub fn reset(&mut self) {
        if let Controller::Pid(pid) = &mut self.controller {
            pid.reset();
        }
        if let Some(kalman) = self.kalman.as_mut() {
            kalman.reset();
        }
    }
}
