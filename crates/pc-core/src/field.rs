//! Two coupled real fields on a periodic 1-D lattice.
//!
//! `S` is the plan embedding and `Λ` the gap-density map. Both relax under
//! diffusion, a positive-definite mass matrix, linear damping and a cubic
//! saturation term, driven by a bounded external source:
//!
//! ```text
//! dS/dt = D∇²S − m_S² S − κΛ − ηS − βS³ + src_S + A·sin(ωt + φ_i)
//! dΛ/dt = D∇²Λ − m_Λ² Λ − κS − ηΛ − βΛ³ + src_Λ
//! κ = γ·√(m_S² m_Λ²),  |γ| < 1
//! ```
//!
//! Integration is classical RK4. A step is a pure function of the state
//! and `dt`; the only randomness is the explicit seed of [`FieldState::seeded`].

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Real-axis extent of the RK4 absolute stability region.
const RK4_STABILITY_LIMIT: f64 = 2.785;

/// Integrator and coupling parameters. Validated once at construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldParams {
    pub dim: usize,
    pub dt: f64,
    pub gamma: f64,
    pub mass_s_sq: f64,
    pub mass_l_sq: f64,
    pub diffusion: f64,
    pub damping: f64,
    pub cubic: f64,
    pub drive_amplitude: f64,
    pub drive_frequency: f64,
    /// Bound on every per-site source and on the oscillating drive.
    pub drive_bound: f64,
    /// Scale applied by the agent when mapping gaps / plan steps to sources.
    pub drive_gain: f64,
    pub divergence_bound: f64,
    pub seed_amplitude: f64,
    pub steps_per_cycle: usize,
}

impl Default for FieldParams {
    fn default() -> Self {
        Self {
            dim: 32,
            dt: 0.05,
            gamma: 0.2,
            mass_s_sq: 1.0,
            mass_l_sq: 0.5,
            diffusion: 0.2,
            damping: 0.1,
            cubic: 0.05,
            drive_amplitude: 0.0,
            drive_frequency: 0.5,
            drive_bound: 1.0,
            drive_gain: 0.5,
            divergence_bound: 1.0e3,
            seed_amplitude: 0.1,
            steps_per_cycle: 4,
        }
    }
}

impl FieldParams {
    /// Off-diagonal mass-matrix entry κ.
    pub fn coupling(&self) -> f64 {
        self.gamma * (self.mass_s_sq * self.mass_l_sq).max(0.0).sqrt()
    }

    /// Eigenvalues `(λ−, λ+)` of `[[m_S², κ], [κ, m_Λ²]]`.
    pub fn mass_eigenvalues(&self) -> (f64, f64) {
        let mean = 0.5 * (self.mass_s_sq + self.mass_l_sq);
        let half_diff = 0.5 * (self.mass_s_sq - self.mass_l_sq);
        let k = self.coupling();
        let r = (half_diff * half_diff + k * k).sqrt();
        (mean - r, mean + r)
    }

    /// Stability and sanity checks. Written with negated comparisons so NaN
    /// parameters are rejected too.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.gamma.abs() < 1.0) {
            return Err(ConfigError::CouplingOutOfRange { gamma: self.gamma });
        }
        if !(self.mass_s_sq > 0.0) || !self.mass_s_sq.is_finite() {
            return Err(ConfigError::TachyonicMass {
                field: "S",
                value: self.mass_s_sq,
            });
        }
        if !(self.mass_l_sq > 0.0) || !self.mass_l_sq.is_finite() {
            return Err(ConfigError::TachyonicMass {
                field: "Lambda",
                value: self.mass_l_sq,
            });
        }
        let (lambda_minus, lambda_plus) = self.mass_eigenvalues();
        if !(lambda_minus > 0.0) || !(lambda_plus > 0.0) {
            return Err(ConfigError::NonPositiveEigenvalue {
                lambda_minus,
                lambda_plus,
            });
        }

        if self.dim < 3 {
            return invalid("dim", format!("lattice needs at least 3 sites, got {}", self.dim));
        }
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return invalid("dt", format!("must be finite and > 0, got {}", self.dt));
        }
        for (name, value) in [
            ("diffusion", self.diffusion),
            ("damping", self.damping),
            ("cubic", self.cubic),
            ("drive_amplitude", self.drive_amplitude),
            ("drive_bound", self.drive_bound),
            ("drive_gain", self.drive_gain),
            ("seed_amplitude", self.seed_amplitude),
        ] {
            if !(value >= 0.0) || !value.is_finite() {
                return invalid(name, format!("must be finite and >= 0, got {value}"));
            }
        }
        if !self.drive_frequency.is_finite() {
            return invalid("drive_frequency", "must be finite".to_string());
        }
        if self.drive_amplitude > self.drive_bound {
            return invalid(
                "drive_amplitude",
                format!("exceeds drive_bound {}", self.drive_bound),
            );
        }
        if !(self.divergence_bound > 0.0) {
            return invalid("divergence_bound", "must be > 0".to_string());
        }

        // Stiffest linear mode: alternating lattice pattern.
        let limit = self.max_stable_dt();
        if self.dt > limit {
            return invalid(
                "dt",
                format!("explicit step {} too large (limit {limit:.4})", self.dt),
            );
        }
        Ok(())
    }

    /// Largest `dt` keeping the stiffest linear mode (the alternating
    /// lattice pattern) inside the RK4 stability region.
    pub fn max_stable_dt(&self) -> f64 {
        let (_, lambda_plus) = self.mass_eigenvalues();
        let stiffness = 4.0 * self.diffusion + lambda_plus + self.damping;
        RK4_STABILITY_LIMIT / stiffness
    }
}

fn invalid(name: &'static str, reason: String) -> Result<(), ConfigError> {
    Err(ConfigError::InvalidParameter { name, reason })
}

/// Result of one integrator step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub t: f64,
    pub norm_s: f64,
    pub norm_l: f64,
    /// Either norm exceeded `divergence_bound`. The step was still applied
    /// unless it also overflowed.
    pub diverged: bool,
    /// The step produced non-finite values and was discarded.
    #[serde(default)]
    pub overflowed: bool,
}

/// What `evolve` does when a step reports divergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DivergencePolicy {
    Halt,
    Continue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvolveReport {
    pub requested: usize,
    pub completed: usize,
    pub cancelled: bool,
    pub halted: bool,
    /// Index (0-based) of the first diverged step.
    pub first_divergence: Option<usize>,
    pub last: Option<StepReport>,
}

/// Serializable field contents, restored through [`FieldState::restore`]
/// so parameters are always re-validated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub s: Vec<f64>,
    pub l: Vec<f64>,
    pub src_s: Vec<f64>,
    pub src_l: Vec<f64>,
    pub t: f64,
    pub steps: u64,
}

#[derive(Clone, Debug)]
pub struct FieldState {
    params: FieldParams,
    s: Vec<f64>,
    l: Vec<f64>,
    src_s: Vec<f64>,
    src_l: Vec<f64>,
    t: f64,
    steps: u64,
}

impl FieldState {
    /// Zero fields. Fails if the parameters are unstable.
    pub fn new(params: FieldParams) -> Result<Self, ConfigError> {
        params.validate()?;
        let n = params.dim;
        Ok(Self {
            params,
            s: vec![0.0; n],
            l: vec![0.0; n],
            src_s: vec![0.0; n],
            src_l: vec![0.0; n],
            t: 0.0,
            steps: 0,
        })
    }

    /// Low-mode perturbation drawn from an explicitly seeded PRNG.
    pub fn seeded(params: FieldParams, seed: u64) -> Result<Self, ConfigError> {
        let mut state = Self::new(params)?;
        let mut rng = SmallRng::seed_from_u64(seed);
        let n = state.params.dim;
        let amp = state.params.seed_amplitude;
        for field in [&mut state.s, &mut state.l] {
            for mode in 1..=2 {
                let a = amp * rng.random_range(0.0..1.0);
                let phase = rng.random_range(0.0..TAU);
                for (i, v) in field.iter_mut().enumerate() {
                    *v += a * (TAU * mode as f64 * i as f64 / n as f64 + phase).sin();
                }
            }
        }
        Ok(state)
    }

    pub fn restore(params: FieldParams, snapshot: FieldSnapshot) -> Result<Self, ConfigError> {
        params.validate()?;
        let n = params.dim;
        for (name, len) in [
            ("snapshot.s", snapshot.s.len()),
            ("snapshot.l", snapshot.l.len()),
            ("snapshot.src_s", snapshot.src_s.len()),
            ("snapshot.src_l", snapshot.src_l.len()),
        ] {
            if len != n {
                return Err(ConfigError::InvalidParameter {
                    name,
                    reason: format!("length {len} does not match dim {n}"),
                });
            }
        }
        let state = Self {
            params,
            s: snapshot.s,
            l: snapshot.l,
            src_s: snapshot.src_s,
            src_l: snapshot.src_l,
            t: snapshot.t,
            steps: snapshot.steps,
        };
        state.revalidate()?;
        Ok(state)
    }

    pub fn snapshot(&self) -> FieldSnapshot {
        FieldSnapshot {
            s: self.s.clone(),
            l: self.l.clone(),
            src_s: self.src_s.clone(),
            src_l: self.src_l.clone(),
            t: self.t,
            steps: self.steps,
        }
    }

    /// Re-run the construction checks and verify the state is finite.
    pub fn revalidate(&self) -> Result<(), ConfigError> {
        self.params.validate()?;
        if self.s.iter().chain(self.l.iter()).any(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidParameter {
                name: "state",
                reason: "field contains non-finite values".to_string(),
            });
        }
        Ok(())
    }

    pub fn params(&self) -> &FieldParams {
        &self.params
    }

    pub fn s(&self) -> &[f64] {
        &self.s
    }

    pub fn lambda(&self) -> &[f64] {
        &self.l
    }

    pub fn time(&self) -> f64 {
        self.t
    }

    pub fn step_count(&self) -> u64 {
        self.steps
    }

    pub fn mass_eigenvalues(&self) -> (f64, f64) {
        self.params.mass_eigenvalues()
    }

    /// L2 norms `(‖S‖, ‖Λ‖)`.
    pub fn norms(&self) -> (f64, f64) {
        (l2(&self.s), l2(&self.l))
    }

    /// Set the per-site external sources, clamped to `±drive_bound`.
    /// Missing entries are zero; NaN is treated as zero.
    pub fn set_drive(&mut self, src_s: &[f64], src_l: &[f64]) {
        let bound = self.params.drive_bound;
        let clamp = |v: Option<&f64>| match v {
            Some(v) if v.is_finite() => (*v).clamp(-bound, bound),
            Some(v) if v.is_infinite() => bound.copysign(*v),
            _ => 0.0,
        };
        for i in 0..self.params.dim {
            self.src_s[i] = clamp(src_s.get(i));
            self.src_l[i] = clamp(src_l.get(i));
        }
    }

    /// Advance by one RK4 step. Non-positive or non-finite `dt` leaves the
    /// state untouched, and so does a step whose result is not finite.
    pub fn step(&mut self, dt: f64) -> StepReport {
        if !(dt > 0.0) || !dt.is_finite() {
            tracing::warn!(dt, "ignoring field step with invalid dt");
            return self.report();
        }

        let t = self.t;
        let (k1s, k1l) = self.derivatives(&self.s, &self.l, t);
        let (s2, l2_) = (axpy(&self.s, &k1s, dt / 2.0), axpy(&self.l, &k1l, dt / 2.0));
        let (k2s, k2l) = self.derivatives(&s2, &l2_, t + dt / 2.0);
        let (s3, l3) = (axpy(&self.s, &k2s, dt / 2.0), axpy(&self.l, &k2l, dt / 2.0));
        let (k3s, k3l) = self.derivatives(&s3, &l3, t + dt / 2.0);
        let (s4, l4) = (axpy(&self.s, &k3s, dt), axpy(&self.l, &k3l, dt));
        let (k4s, k4l) = self.derivatives(&s4, &l4, t + dt);

        let mut next_s = self.s.clone();
        let mut next_l = self.l.clone();
        for i in 0..next_s.len() {
            next_s[i] += dt / 6.0 * (k1s[i] + 2.0 * k2s[i] + 2.0 * k3s[i] + k4s[i]);
            next_l[i] += dt / 6.0 * (k1l[i] + 2.0 * k2l[i] + 2.0 * k3l[i] + k4l[i]);
        }
        if !l2(&next_s).is_finite() || !l2(&next_l).is_finite() {
            tracing::warn!(t = self.t, dt, "field step overflowed, keeping previous state");
            return StepReport {
                diverged: true,
                overflowed: true,
                ..self.report()
            };
        }
        self.s = next_s;
        self.l = next_l;
        self.t += dt;
        self.steps += 1;

        let report = self.report();
        if report.diverged {
            tracing::warn!(
                t = report.t,
                norm_s = report.norm_s,
                norm_l = report.norm_l,
                "field norm exceeded divergence bound"
            );
        }
        report
    }

    /// Run up to `steps` steps, checking `cancel` before each one. An
    /// overflowed step always halts, whatever `on_divergence` says.
    pub fn evolve(
        &mut self,
        steps: usize,
        dt: f64,
        cancel: &AtomicBool,
        on_divergence: DivergencePolicy,
    ) -> EvolveReport {
        let mut report = EvolveReport {
            requested: steps,
            completed: 0,
            cancelled: false,
            halted: false,
            first_divergence: None,
            last: None,
        };
        for i in 0..steps {
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                break;
            }
            let step = self.step(dt);
            report.completed += 1;
            report.last = Some(step);
            if step.diverged {
                report.first_divergence.get_or_insert(i);
                if step.overflowed || on_divergence == DivergencePolicy::Halt {
                    report.halted = true;
                    break;
                }
            }
        }
        report
    }

    fn report(&self) -> StepReport {
        let (norm_s, norm_l) = self.norms();
        let bound = self.params.divergence_bound;
        StepReport {
            t: self.t,
            norm_s,
            norm_l,
            diverged: !(norm_s <= bound) || !(norm_l <= bound),
            overflowed: false,
        }
    }

    fn derivatives(&self, s: &[f64], l: &[f64], t: f64) -> (Vec<f64>, Vec<f64>) {
        let p = &self.params;
        let n = s.len();
        let k = p.coupling();
        let mut ds = vec![0.0; n];
        let mut dl = vec![0.0; n];
        for i in 0..n {
            let prev = (i + n - 1) % n;
            let next = (i + 1) % n;
            let lap_s = s[prev] - 2.0 * s[i] + s[next];
            let lap_l = l[prev] - 2.0 * l[i] + l[next];
            let phase = TAU * i as f64 / n as f64;
            let drive = p.drive_amplitude * (p.drive_frequency * t + phase).sin();

            ds[i] = p.diffusion * lap_s - p.mass_s_sq * s[i] - k * l[i] - p.damping * s[i]
                - p.cubic * s[i].powi(3)
                + self.src_s[i]
                + drive;
            dl[i] = p.diffusion * lap_l - p.mass_l_sq * l[i] - k * s[i] - p.damping * l[i]
                - p.cubic * l[i].powi(3)
                + self.src_l[i];
        }
        (ds, dl)
    }
}

fn axpy(base: &[f64], delta: &[f64], scale: f64) -> Vec<f64> {
    base.iter().zip(delta).map(|(b, d)| b + scale * d).collect()
}

pub(crate) fn l2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}
