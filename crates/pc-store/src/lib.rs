pub mod config;
pub mod error;
pub mod schema;
pub mod session;
pub mod store;

pub use config::{CONFIG_FILE, config_to_toml, load_config, load_config_or_default, parse_config};
pub use error::{Result, StoreError};
pub use session::{DEFAULT_SESSION, SessionStore, default_base_dir, sanitize_name};
pub use store::Store;
