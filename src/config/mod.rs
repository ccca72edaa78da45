//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GuardConfig (validated, immutable)
//!     → secrets.rs resolves keys from the environment
//!     → SecurityCore builds every service from it
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → SecurityCore::apply_config swaps live rate-limit settings
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only admission settings are hot-reloadable; keys and paths need a restart

pub mod loader;
pub mod schema;
pub mod secrets;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AuditSettings, Environment, GuardConfig, ObservabilityConfig, RateLimitSettings,
    TotpSettings, VaultSettings,
};
