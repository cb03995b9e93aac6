//! Signal-triggered control core.
//!
//! Keeps a paraconsistent fact store and a knowledge-gap set, evolves two
//! coupled fields on a periodic lattice, aggregates both into a five-channel
//! signal vector, and turns threshold crossings into one prioritized action
//! per cycle under cooldowns. Actions are published on a synchronous event
//! bus and every cycle is traced as a reasoning chain.
//!
//! Zero I/O. Math, retrieval and logging are injected collaborators.

pub mod agent;
pub mod bus;
pub mod chain;
pub mod collab;
pub mod config;
pub mod constants;
pub mod error;
pub mod fact;
pub mod field;
pub mod gap;
pub mod handlers;
pub mod plan;
pub mod policy;
pub mod signal;
pub mod time;
pub mod tokenizer;
pub mod trigger;

pub use agent::{Agent, AgentSnapshot, Response};
pub use bus::{Event, EventBus, EventKind, HandlerFailure, PublishReport, SubscriptionId};
pub use chain::{ChainId, ChainKind, ChainTracker, ReasoningChain, StepPhase};
pub use collab::{
    Collaborators, CycleRecord, EventSink, MathEngine, MemorySink, NullSink, Retriever,
    SearchHit, StateSummary, Unavailable,
};
pub use config::CoreConfig;
pub use error::{ChainError, CollabError, ConfigError, HandlerError};
pub use fact::{Contradiction, Fact, FactId, FactKey, FactStore, Polarity};
pub use field::{DivergencePolicy, EvolveReport, FieldParams, FieldSnapshot, FieldState, StepReport};
pub use gap::{Collaborator, Gap, GapKey, GapSet, GapType};
pub use handlers::{Bookkeeping, Kpis};
pub use plan::{MathOp, PlanAction, PlanQueue, PlanStep, StepStatus};
pub use policy::{Action, CooldownTable, Decision, PolicyEngine, PolicyPhase, Priorities, Thresholds};
pub use signal::{SignalBreakdown, SignalVector, TriggerClass, aggregate};
pub use time::{Clock, ManualClock, SystemClock, unix_to_iso8601};
pub use tokenizer::{ParsedInput, parse_input, tokenize};
pub use trigger::{FieldTriggers, TriggerParams, triggers};
