use crate::config::KalmanConfig;

/// Scalar Kalman filter for a random-walk signal.
///
/// Smooths the frame-quantized timing error before it reaches the
/// controller.
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanFilter {
    process_variance: f32,
    measurement_variance: f32,
    initial_estimate: f32,
    estimate: f32,
    covariance: f32,
}

impl KalmanFilter {
    pub fn new(config: &KalmanConfig) -> Self {
        Self {
            process_variance: config.process_variance.max(0.0),
            measurement_variance: config.measurement_variance.max(f32::MIN_POSITIVE),
            initial_estimate: config.initial_estimate,
            estimate: config.initial_estimate,
            covariance: 1.0,
        }
    }

    /// Predict, then correct with measurement `z`; returns the new estimate.
    pub fn update(&mut self, z: f32) -> f32 {
        let predicted = self.covariance + self.process_variance;
        let gain = predicted / (predicted + self.measurement_variance);
        self.estimate += gain * (z - self.estimate);
        self.covariance = (1.0 - gain) * predicted;
        self.estimate
    }

    pub fn estimate(&self) -> f32 {
        self.estimate
    }

    pub fn covariance(&self) -> f32 {
        self.covariance
    }

    pub fn reset(&mut self) {
        self.estimate = self.initial_estimate;
        self.covariance = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_converges_to_constant() {
        let mut kf = KalmanFilter::new(&KalmanConfig::default());
        let mut last = 0.0;
        for _ in 0..200 {
            last = kf.update(0.8);
        }
        assert_relative_eq!(last, 0.8, epsilon = 1e-3);
        assert!(kf.covariance() < 1.0);
    }

    #[test]
    fn test_smooths_alternating_noise() {
        let mut kf = KalmanFilter::new(&KalmanConfig {
            process_variance: 1e-4,
            measurement_variance: 0.5,
            initial_estimate: 0.0,
        });
        for i in 0..100 {
            kf.update(if i % 2 == 0 { 0.5 } else { -0.5 });
        }
        assert!(kf.estimate().abs() < 0.2);
    }

    #[test]
    fn test_first_update_gain() {
        let mut kf = KalmanFilter::new(&KalmanConfig {
            process_variance: 0.0,
            measurement_variance: 1.0,
            initial_estimate: 0.0,
        });
        // P = 1, R = 1 -> K = 0.5
        assert_relative_eq!(kf.update(1.0), 0.5);
        kf.reset();
        assert_eq!(kf.estimate(), 0.0);
        assert_eq!(kf.covariance(), 1.0);
    }
}
