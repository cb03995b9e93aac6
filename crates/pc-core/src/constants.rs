/// Numerical epsilon for near-zero denominators
pub const EPSILON: f64 = 1e-10;

/// Default smoothing width of the tanh threshold step
pub const SMOOTHING_EPSILON: f64 = 0.05;

/// Upper bound of the normalized lattice gradient ratio (alternating field)
pub const LATTICE_GRADIENT_MAX: f64 = 4.0;

/// Priority bump applied when an identical gap is re-added
pub const GAP_PRIORITY_BUMP: f64 = 0.1;

/// Ceiling for gap priority
pub const GAP_PRIORITY_MAX: f64 = 1.0;

/// Default cooldown window in cycles
pub const DEFAULT_COOLDOWN_WINDOW: u64 = 3;

/// Only supported number of actions per cycle
pub const EVENT_CAP: usize = 1;

/// Default capacity for bounded bus history and chain archive
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// Default maximum nesting depth of open reasoning chains
pub const DEFAULT_CHAIN_DEPTH_LIMIT: usize = 4;

/// Default number of retrieval hits requested per search
pub const DEFAULT_RETRIEVAL_TOP_K: usize = 3;

/// Default attempts before an open gap is escalated to the user
pub const DEFAULT_MAX_GAP_ATTEMPTS: u32 = 3;

/// Fact source tag for retrieval evidence
pub const SOURCE_RETRIEVAL: &str = "retrieval";

/// Fact source tag for math collaborator results
pub const SOURCE_MATH: &str = "math";

/// Fact source tag for user input
pub const SOURCE_INPUT: &str = "input";
