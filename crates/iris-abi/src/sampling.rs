use serde::{Deserialize, Serialize};

/// Sampler knobs handed to `NativeEngine::new_sampler`.
/// Engines should treat these as *desired* values and ignore what they can't honor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>, // > 0.0 enables temperature scaling
    pub top_k: Option<u32>,       // >= 1 keeps the K most likely candidates
    pub top_p: Option<f32>,       // (0, 1] nucleus sampling
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            top_k: Some(40),
            top_p: Some(0.9),
        }
    }
}

impl SamplingParams {
    pub fn new(top_k: i32, top_p: f32, temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            top_k: u32::try_from(top_k).ok(),
            top_p: Some(top_p),
        }
    }

    /// Returns a clamped copy.
    ///
    /// - temperature <= 0 → disabled (greedy)
    /// - top_k < 1 → disabled
    /// - top_p ∉ (0, 1] → disabled
    pub fn normalized(&self) -> Self {
        let mut p = *self;

        if matches!(p.temperature, Some(t) if !(t > 0.0) || !t.is_finite()) {
            p.temperature = None;
        }
        if matches!(p.top_k, Some(k) if k < 1) {
            p.top_k = None;
        }
        if matches!(p.top_p, Some(v) if !(v > 0.0 && v <= 1.0)) {
            p.top_p = None;
        }
        p
    }

    /// True when nothing stochastic survives normalization.
    pub fn is_greedy(&self) -> bool {
        self.normalized().temperature.is_none()
    }
}
