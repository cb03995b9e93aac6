//! Agent configuration, loaded once at construction.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CHAIN_DEPTH_LIMIT, DEFAULT_COOLDOWN_WINDOW, DEFAULT_HISTORY_CAPACITY,
    DEFAULT_MAX_GAP_ATTEMPTS, DEFAULT_RETRIEVAL_TOP_K, EVENT_CAP,
};
use crate::error::ConfigError;
use crate::field::FieldParams;
use crate::policy::{Priorities, Thresholds};
use crate::trigger::TriggerParams;

/// Flat threshold keys (`tau_G`, `tau_F`, ...) sit at the top level next
/// to `cooldown_window` and `event_cap`; integrator parameters live in a
/// `[field]` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    #[serde(flatten)]
    pub thresholds: Thresholds,
    pub cooldown_window: u64,
    pub event_cap: usize,
    pub priorities: Priorities,
    pub history_capacity: usize,
    pub chain_depth_limit: usize,
    pub retrieval_top_k: usize,
    /// Resolution attempts before a gap is escalated to a clarification.
    pub max_gap_attempts: u32,
    /// Seed for a low-mode initial field perturbation. Zero fields if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_seed: Option<u64>,
    pub field: FieldParams,
    pub triggers: TriggerParams,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            cooldown_window: DEFAULT_COOLDOWN_WINDOW,
            event_cap: EVENT_CAP,
            priorities: Priorities::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            chain_depth_limit: DEFAULT_CHAIN_DEPTH_LIMIT,
            retrieval_top_k: DEFAULT_RETRIEVAL_TOP_K,
            max_gap_attempts: DEFAULT_MAX_GAP_ATTEMPTS,
            field_seed: None,
            field: FieldParams::default(),
            triggers: TriggerParams::default(),
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_cap != EVENT_CAP {
            return Err(ConfigError::UnsupportedEventCap(self.event_cap));
        }
        self.thresholds.validate()?;
        self.field.validate()?;
        self.triggers.validate()?;
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "history_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.chain_depth_limit == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "chain_depth_limit",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
