//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Resolve secrets → Build SecurityCore → start() tasks
//!
//! Background (tasks.rs):
//!     limiter cleanup, stats window, audit rotation, integrity sweep, retention
//!
//! Shutdown (shutdown.rs):
//!     Signal received → trigger broadcast → tasks finish current job → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then logging, then core, then tasks
//! - A job in progress completes before its task exits

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod tasks;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
pub use startup::{SecurityCore, StartupError};
pub use tasks::BackgroundTasks;
