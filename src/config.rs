//! Session configuration.
//!
//! A session is fully described by a [`SyncConfig`] plus the reference and
//! accompaniment audio. Configs are plain serde structs, stored as YAML.
//!
//! Every field has a default. Two of them shape a session more than the rest:
//! `end_of_reference_patience` is `None`, so reaching the end of the reference
//! does not end the session on its own, and the PID gains are tuned for small
//! drift rather than large tempo changes (`kp: 2, ki: 2` follows a soloist at
//! half tempo within a few seconds).
//!
//! ```yaml
//! sample_rate: 16000
//! hop_length: 1024
//! search_width: 10
//! controller:
//!   kind: pid
//!   kp: 0.2
//!   ki: 0.001
//!   kd: 0.05
//! kalman:
//!   process_variance: 0.001
//!   measurement_variance: 0.05
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Rate of all feature and vocoder computation
    pub sample_rate: u32,
    /// Live input channels (mono-mixed before feature extraction)
    pub channels: usize,
    /// Tick period in samples; also the CENS stride and vocoder hop
    pub hop_length: usize,
    /// CENS and vocoder FFT length
    pub fft_size: usize,
    /// Vocoder analysis window (<= fft_size)
    pub window_length: usize,
    /// OTW search width `c`
    pub search_width: usize,
    /// OTW slope bound; also clamps the controller output
    pub max_run_count: usize,
    /// OTW diagonal-step weight; values below 2 bias toward diagonal steps
    pub diag_weight: f32,
    pub controller: ControllerConfig,
    /// Optional Kalman pre-filter on the timing error
    pub kalman: Option<KalmanConfig>,
    /// Live sequence capacity as a multiple of the reference length
    pub max_live_ratio: usize,
    /// End the session once the reference has been exhausted for more than
    /// this many ticks. `None` (the default) keeps following until the live
    /// buffer is full.
    pub end_of_reference_patience: Option<usize>,
    /// STFT columns synthesized per vocoder block
    pub synthesis_block: usize,
    /// Fade length (samples) at the start and end of the accompaniment stream
    pub fade_length: usize,
    /// Peak-normalize the accompaniment before analysis
    pub normalize_accompaniment: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            hop_length: 1024,
            fft_size: 4096,
            window_length: 4096,
            search_width: 10,
            max_run_count: 3,
            diag_weight: 2.0,
            controller: ControllerConfig::default(),
            kalman: None,
            max_live_ratio: 4,
            end_of_reference_patience: None,
            synthesis_block: 6,
            fade_length: 128,
            normalize_accompaniment: true,
        }
    }
}

/// Which rate controller drives the vocoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerConfig {
    Pid { kp: f32, ki: f32, kd: f32 },
    Fuzzy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig::Pid {
            kp: 0.2,
            ki: 0.001,
            kd: 0.05,
        }
    }
}

/// Scalar Kalman filter parameters for the timing-error pre-filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    pub process_variance: f32,
    pub measurement_variance: f32,
    pub initial_estimate: f32,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_variance: 1e-3,
            measurement_variance: 5e-2,
            initial_estimate: 0.0,
        }
    }
}

impl SyncConfig {
    /// Parse a YAML document and validate it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: SyncConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Duration of one tick in seconds.
    pub fn tick_seconds(&self) -> f32 {
        self.hop_length as f32 / self.sample_rate as f32
    }

    /// Controller clamp range `[1/max_run_count, max_run_count]`.
    pub fn rate_bounds(&self) -> (f32, f32) {
        let m = self.max_run_count.max(1) as f32;
        (1.0 / m, m)
    }

    /// Reject nonsensical parameter combinations.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::invalid("sample_rate", self.sample_rate, "must be > 0"));
        }
        if self.channels == 0 {
            return Err(Error::invalid("channels", self.channels, "must be >= 1"));
        }
        if self.hop_length == 0 {
            return Err(Error::invalid("hop_length", self.hop_length, "must be > 0"));
        }
        if self.fft_size < 2 {
            return Err(Error::invalid("fft_size", self.fft_size, "must be >= 2"));
        }
        if self.hop_length > self.fft_size {
            return Err(Error::invalid(
                "hop_length",
                self.hop_length,
                &format!("must not exceed fft_size ({})", self.fft_size),
            ));
        }
        if self.window_length == 0 || self.window_length > self.fft_size {
            return Err(Error::invalid(
                "window_length",
                self.window_length,
                &format!("must be in 1..={}", self.fft_size),
            ));
        }
        if self.hop_length > self.window_length {
            return Err(Error::invalid(
                "hop_length",
                self.hop_length,
                &format!("must not exceed window_length ({})", self.window_length),
            ));
        }
        if self.search_width == 0 {
            return Err(Error::invalid("search_width", self.search_width, "must be >= 1"));
        }
        if self.max_run_count < 2 {
            return Err(Error::invalid("max_run_count", self.max_run_count, "must be >= 2"));
        }
        if !(self.diag_weight.is_finite() && self.diag_weight > 0.0) {
            return Err(Error::invalid("diag_weight", self.diag_weight, "must be positive"));
        }
        if self.max_live_ratio == 0 {
            return Err(Error::invalid("max_live_ratio", self.max_live_ratio, "must be >= 1"));
        }
        if self.synthesis_block == 0 {
            return Err(Error::invalid("synthesis_block", self.synthesis_block, "must be >= 1"));
        }
        if let ControllerConfig::Pid { kp, ki, kd } = self.controller
            && ![kp, ki, kd].iter().all(|g| g.is_finite())
        {
            return Err(Error::invalid("controller", format!("{kp}/{ki}/{kd}"), "gains must be finite"));
        }
        if let Some(kalman) = &self.kalman
            && !(kalman.process_variance >= 0.0 && kalman.measurement_variance > 0.0)
        {
            return Err(Error::invalid(
                "kalman",
                format!("{}/{}", kalman.process_variance, kalman.measurement_variance),
                "variances must be non-negative and measurement variance positive",
            ));
        }
        Ok(())
    }
}

/// Load and validate a YAML configuration file.
pub fn load_config(path: &Path) -> Result<SyncConfig> {
    log::info!("load_config: Loading from {:?}", path);
    let contents = std::fs::read_to_string(path)?;
    let config = SyncConfig::from_yaml_str(&contents).inspect_err(|e| {
        log::warn!("load_config: Rejected {:?}: {}", path, e);
    })?;
    log::info!(
        "load_config: sr={} hop={} c={} max_run_count={} controller={:?}",
        config.sample_rate,
        config.hop_length,
        config.search_width,
        config.max_run_count,
        config.controller
    );
    Ok(config)
}

/// Write a configuration as YAML, creating parent directories as needed.
pub fn save_config(config: &SyncConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(path, yaml)?;
    log::info!("save_config: Saved to {:?}", path);
    Ok(())
}
