//! Policy engine: at most one action per cycle, chosen by priority then
//! signal magnitude among trigger classes that are above threshold and
//! off cooldown.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::signal::{SignalVector, TriggerClass};

/// Per-class firing thresholds, keyed the way they appear in config files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    #[serde(rename = "tau_F")]
    pub contradiction: f64,
    #[serde(rename = "tau_G")]
    pub gap: f64,
    #[serde(rename = "tau_R")]
    pub novelty: f64,
    #[serde(rename = "tau_T")]
    pub torsion: f64,
    #[serde(rename = "tau_P")]
    pub coherence: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            contradiction: 0.3,
            gap: 0.5,
            novelty: 0.6,
            torsion: 0.7,
            coherence: 0.8,
        }
    }
}

impl Thresholds {
    pub fn get(&self, class: TriggerClass) -> f64 {
        match class {
            TriggerClass::Contradiction => self.contradiction,
            TriggerClass::Gap => self.gap,
            TriggerClass::Novelty => self.novelty,
            TriggerClass::Torsion => self.torsion,
            TriggerClass::Coherence => self.coherence,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for class in TriggerClass::ALL {
            let value = self.get(class);
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidParameter {
                    name: class.threshold_key(),
                    reason: format!("threshold must be finite and >= 0, got {value}"),
                });
            }
        }
        Ok(())
    }
}

/// Tie-break order between classes. Higher wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Priorities {
    pub contradiction: u8,
    pub gap: u8,
    pub novelty: u8,
    pub torsion: u8,
    pub coherence: u8,
}

impl Default for Priorities {
    fn default() -> Self {
        Self {
            contradiction: 5,
            gap: 4,
            novelty: 3,
            torsion: 2,
            coherence: 1,
        }
    }
}

impl Priorities {
    pub fn get(&self, class: TriggerClass) -> u8 {
        match class {
            TriggerClass::Contradiction => self.contradiction,
            TriggerClass::Gap => self.gap,
            TriggerClass::Novelty => self.novelty,
            TriggerClass::Torsion => self.torsion,
            TriggerClass::Coherence => self.coherence,
        }
    }
}

/// Last firing cycle per class. Absent means never fired.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownTable {
    last_fired: BTreeMap<TriggerClass, u64>,
}

impl CooldownTable {
    pub fn last_fired(&self, class: TriggerClass) -> Option<u64> {
        self.last_fired.get(&class).copied()
    }

    pub fn is_ready(&self, class: TriggerClass, cycle: u64, window: u64) -> bool {
        self.last_fired(class)
            .is_none_or(|last| cycle.saturating_sub(last) >= window)
    }

    fn fire(&mut self, class: TriggerClass, cycle: u64) {
        self.last_fired.insert(class, cycle);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyPhase {
    Idle,
    Deciding,
    Dispatched,
}

/// Closed set of control actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Counterexample,
    ResolveGap,
    Retrieve,
    Decompose,
    Synthesize,
    Continue,
    Clarify,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Counterexample,
        Action::ResolveGap,
        Action::Retrieve,
        Action::Decompose,
        Action::Synthesize,
        Action::Continue,
        Action::Clarify,
    ];

    /// Action emitted when a trigger class fires.
    pub fn for_class(class: TriggerClass) -> Self {
        match class {
            TriggerClass::Contradiction => Action::Counterexample,
            TriggerClass::Gap => Action::ResolveGap,
            TriggerClass::Novelty => Action::Retrieve,
            TriggerClass::Torsion => Action::Decompose,
            TriggerClass::Coherence => Action::Synthesize,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Counterexample => "counterexample",
            Action::ResolveGap => "resolve_gap",
            Action::Retrieve => "retrieve",
            Action::Decompose => "decompose",
            Action::Synthesize => "synthesize",
            Action::Continue => "continue",
            Action::Clarify => "clarify",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub class: TriggerClass,
    pub priority: u8,
    pub signal: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub cycle: u64,
    pub action: Action,
    /// Winning class; `None` for the continue / clarify fallbacks.
    pub fired: Option<TriggerClass>,
    pub candidates: Vec<Candidate>,
    /// Above threshold but still cooling down.
    pub suppressed: Vec<TriggerClass>,
}

#[derive(Clone, Debug)]
pub struct PolicyEngine {
    thresholds: Thresholds,
    priorities: Priorities,
    cooldown_window: u64,
    cooldowns: CooldownTable,
    phase: PolicyPhase,
}

impl PolicyEngine {
    pub fn new(thresholds: Thresholds, priorities: Priorities, cooldown_window: u64) -> Self {
        Self {
            thresholds,
            priorities,
            cooldown_window,
            cooldowns: CooldownTable::default(),
            phase: PolicyPhase::Idle,
        }
    }

    pub fn with_cooldowns(mut self, cooldowns: CooldownTable) -> Self {
        self.cooldowns = cooldowns;
        self
    }

    pub fn phase(&self) -> PolicyPhase {
        self.phase
    }

    pub fn cooldowns(&self) -> &CooldownTable {
        &self.cooldowns
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn cooldown_window(&self) -> u64 {
        self.cooldown_window
    }

    /// Pick this cycle's single action. Total over its input: signals are
    /// sanitized before comparison. Leaves the engine in `Dispatched`
    /// until [`PolicyEngine::complete`] is called.
    pub fn decide(&mut self, cycle: u64, signals: &SignalVector, has_pending: bool) -> Decision {
        self.phase = PolicyPhase::Deciding;
        let signals = signals.sanitized();

        let mut candidates = Vec::new();
        let mut suppressed = Vec::new();
        for (class, value) in signals.iter() {
            if value <= self.thresholds.get(class) {
                continue;
            }
            if self.cooldowns.is_ready(class, cycle, self.cooldown_window) {
                candidates.push(Candidate {
                    class,
                    priority: self.priorities.get(class),
                    signal: value,
                });
            } else {
                suppressed.push(class);
            }
        }

        let winner = candidates
            .iter()
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.signal.total_cmp(&b.signal))
            })
            .map(|c| c.class);

        let action = match winner {
            Some(class) => {
                self.cooldowns.fire(class, cycle);
                Action::for_class(class)
            }
            None if has_pending => Action::Continue,
            None => Action::Clarify,
        };

        tracing::debug!(
            cycle,
            %action,
            fired = winner.map(TriggerClass::as_str),
            candidates = candidates.len(),
            suppressed = suppressed.len(),
            "policy decision"
        );

        self.phase = PolicyPhase::Dispatched;
        Decision {
            cycle,
            action,
            fired: winner,
            candidates,
            suppressed,
        }
    }

    /// Return to `Idle` once the dispatched action has been executed.
    pub fn complete(&mut self) {
        self.phase = PolicyPhase::Idle;
    }
}
