//! Dimensionless trigger scalars extracted from the field state.
//!
//! Raw values are normalized to [0, 1] by their lattice bounds, then passed
//! through a tanh step so a value hovering at its threshold produces a
//! smooth source strength rather than on/off chatter.

use serde::{Deserialize, Serialize};

use crate::constants::{LATTICE_GRADIENT_MAX, SMOOTHING_EPSILON};
use crate::error::ConfigError;
use crate::field::{FieldState, l2};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerParams {
    pub gradient_threshold: f64,
    pub curl_threshold: f64,
    pub current_threshold: f64,
    pub correlation_threshold: f64,
    /// Width ε of the smooth step.
    pub smoothing: f64,
    /// Additive guard for ratio denominators.
    pub epsilon: f64,
}

impl Default for TriggerParams {
    fn default() -> Self {
        Self {
            gradient_threshold: 0.75,
            curl_threshold: 0.7,
            current_threshold: 0.7,
            correlation_threshold: 0.9,
            smoothing: SMOOTHING_EPSILON,
            epsilon: 1e-9,
        }
    }
}

impl TriggerParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.smoothing > 0.0) || !self.smoothing.is_finite() {
            return Err(ConfigError::InvalidParameter {
                name: "smoothing",
                reason: format!("must be finite and > 0, got {}", self.smoothing),
            });
        }
        if !(self.epsilon > 0.0) || !self.epsilon.is_finite() {
            return Err(ConfigError::InvalidParameter {
                name: "epsilon",
                reason: format!("must be finite and > 0, got {}", self.epsilon),
            });
        }
        for (name, value) in [
            ("gradient_threshold", self.gradient_threshold),
            ("curl_threshold", self.curl_threshold),
            ("current_threshold", self.current_threshold),
            ("correlation_threshold", self.correlation_threshold),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidParameter {
                    name,
                    reason: "must be finite".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Unsmoothed field scalars, each in [0, 1].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTriggers {
    /// Gradient energy of S over 4·‖S‖².
    pub grad_s: f64,
    /// Gradient energy of Λ over 4·‖Λ‖².
    pub grad_l: f64,
    /// Antisymmetric neighbour wedge `|Σ S_i Λ_{i+1} − Λ_i S_{i+1}|`.
    pub curl: f64,
    /// Magnitude of the current `S ∂Λ − Λ ∂S`.
    pub current: f64,
    /// `cross² / (auto_S · auto_Λ + ε)`.
    pub correlation: f64,
    /// Sign of the cross term: plan and gap map point the same way.
    pub aligned: bool,
}

/// Smoothed source strengths plus the raw values they came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldTriggers {
    pub raw: RawTriggers,
    pub grad_s: f64,
    pub grad_l: f64,
    pub curl: f64,
    pub current: f64,
    /// Zero when the fields are anti-aligned.
    pub correlation: f64,
}

/// `σ_ε(x − threshold) = ½(1 + tanh((x − threshold)/ε))`. NaN maps to 0.
pub fn smooth_step(x: f64, threshold: f64, width: f64) -> f64 {
    let v = 0.5 * (1.0 + ((x - threshold) / width).tanh());
    if v.is_nan() { 0.0 } else { v }
}

pub fn raw_triggers(field: &FieldState, epsilon: f64) -> RawTriggers {
    let s = field.s();
    let l = field.lambda();
    let n = s.len();

    let auto_s: f64 = s.iter().map(|v| v * v).sum();
    let auto_l: f64 = l.iter().map(|v| v * v).sum();
    let cross: f64 = s.iter().zip(l).map(|(a, b)| a * b).sum();
    let norm_product = l2(s) * l2(l);

    let mut grad_s = 0.0;
    let mut grad_l = 0.0;
    let mut wedge = 0.0;
    let mut current_sq = 0.0;
    for i in 0..n {
        let next = (i + 1) % n;
        let prev = (i + n - 1) % n;
        grad_s += (s[next] - s[i]).powi(2);
        grad_l += (l[next] - l[i]).powi(2);
        wedge += s[i] * l[next] - l[i] * s[next];
        let j = 0.5 * (s[i] * (l[next] - l[prev]) - l[i] * (s[next] - s[prev]));
        current_sq += j * j;
    }

    RawTriggers {
        grad_s: clip01(grad_s / (LATTICE_GRADIENT_MAX * auto_s + epsilon)),
        grad_l: clip01(grad_l / (LATTICE_GRADIENT_MAX * auto_l + epsilon)),
        curl: clip01(wedge.abs() / (2.0 * norm_product + epsilon)),
        current: clip01(current_sq.sqrt() / (2.0 * norm_product + epsilon)),
        correlation: clip01(cross * cross / (auto_s * auto_l + epsilon)),
        aligned: cross > 0.0,
    }
}

/// Extract and smooth the field triggers.
pub fn triggers(field: &FieldState, params: &TriggerParams) -> FieldTriggers {
    let raw = raw_triggers(field, params.epsilon);
    let w = params.smoothing;
    FieldTriggers {
        raw,
        grad_s: smooth_step(raw.grad_s, params.gradient_threshold, w),
        grad_l: smooth_step(raw.grad_l, params.gradient_threshold, w),
        curl: smooth_step(raw.curl, params.curl_threshold, w),
        current: smooth_step(raw.current, params.current_threshold, w),
        correlation: if raw.aligned {
            smooth_step(raw.correlation, params.correlation_threshold, w)
        } else {
            0.0
        },
    }
}

fn clip01(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldParams, FieldSnapshot};
    use approx::assert_relative_eq;

    fn field_with(s: Vec<f64>, l: Vec<f64>) -> FieldState {
        let n = s.len();
        let params = FieldParams {
            dim: n,
            ..FieldParams::default()
        };
        FieldState::restore(
            params,
            FieldSnapshot {
                s,
                l,
                src_s: vec![0.0; n],
                src_l: vec![0.0; n],
                t: 0.0,
                steps: 0,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_smooth_step_midpoint() {
        assert_relative_eq!(smooth_step(0.5, 0.5, 0.05), 0.5);
        assert!(smooth_step(1.0, 0.5, 0.05) > 0.999);
        assert!(smooth_step(0.0, 0.5, 0.05) < 1e-3);
        assert_eq!(smooth_step(f64::NAN, 0.5, 0.05), 0.0);
    }

    #[test]
    fn test_smooth_step_monotone() {
        let mut last = 0.0;
        for i in 0..100 {
            let v = smooth_step(i as f64 / 100.0, 0.4, 0.05);
            assert!(v >= last);
            last = v;
        }
    }

    #[test]
    fn test_zero_field_has_no_triggers() {
        let field = FieldState::new(FieldParams::default()).unwrap();
        let t = triggers(&field, &TriggerParams::default());
        assert!(t.grad_s < 1e-6);
        assert!(t.grad_l < 1e-6);
        assert!(t.curl < 1e-6);
        assert!(t.current < 1e-6);
        assert_eq!(t.correlation, 0.0);
    }

    #[test]
    fn test_alternating_field_has_max_gradient() {
        let s: Vec<f64> = (0..8).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let field = field_with(s, vec![0.0; 8]);
        let raw = raw_triggers(&field, 1e-12);
        assert_relative_eq!(raw.grad_s, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_constant_field_has_no_gradient() {
        let field = field_with(vec![0.5; 8], vec![0.2; 8]);
        let raw = raw_triggers(&field, 1e-12);
        assert!(raw.grad_s < 1e-9);
        assert!(raw.curl < 1e-9);
        assert!(raw.current < 1e-9);
        assert_relative_eq!(raw.correlation, 1.0, epsilon = 1e-9);
        assert!(raw.aligned);
    }

    #[test]
    fn test_anti_aligned_correlation_is_gated() {
        let field = field_with(vec![0.5; 8], vec![-0.2; 8]);
        let t = triggers(&field, &TriggerParams::default());
        assert_relative_eq!(t.raw.correlation, 1.0, epsilon = 1e-6);
        assert!(!t.raw.aligned);
        assert_eq!(t.correlation, 0.0);
    }

    #[test]
    fn test_shifted_fields_have_curl() {
        let n = 16;
        let s: Vec<f64> = (0..n)
            .map(|i| (std::f64::consts::TAU * i as f64 / n as f64).sin())
            .collect();
        let l: Vec<f64> = (0..n)
            .map(|i| (std::f64::consts::TAU * i as f64 / n as f64).cos())
            .collect();
        let raw = raw_triggers(&field_with(s, l), 1e-12);
        assert!(raw.curl > 0.1, "quadrature fields should wind: {}", raw.curl);
        // |j_i| = sin(2π/n) at every site
        assert!(raw.current > 0.05, "current: {}", raw.current);
        assert!(raw.correlation < 1e-9);
    }

    #[test]
    fn test_all_raw_bounded() {
        let field = FieldState::seeded(FieldParams::default(), 11).unwrap();
        let raw = raw_triggers(&field, 1e-9);
        for v in [raw.grad_s, raw.grad_l, raw.curl, raw.current, raw.correlation] {
            assert!((0.0..=1.0).contains(&v));
        }
    }
}
