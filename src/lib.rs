pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod testing;
pub mod topology;

// Re-export common types
pub use cache::ConnectionCache;
pub use config::CascadeConfig;
pub use error::{CascadeError, Result};
pub use scheduler::Scheduler;
pub use topology::{Role, Tree};
