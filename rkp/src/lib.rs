pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod exec;
pub mod health;
pub mod lifecycle;
pub mod monitor;
pub mod mount;
pub mod probe;
pub mod registry;
pub mod scanner;

pub use config::{SupervisorConfig, load_config};
pub use error::{Result, SupervisorError};
pub use events::{EventKind, SupervisorEvent};
pub use lifecycle::Supervisor;
pub use registry::Registry;
