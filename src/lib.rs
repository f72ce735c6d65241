pub mod checks;
pub mod cloning;
pub mod config;
pub mod conversion;
pub mod engine;
pub mod error;
pub mod hypervisor;
pub mod ipreassign;
pub mod livesync;
pub mod logger;
pub mod prepare;
pub mod process;
pub mod request;
pub mod service;
pub mod shell;
pub mod status;

pub use error::MigrateError;

pub type Result<T> = std::result::Result<T, MigrateError>;

// Convenience re-exports for the pieces callers wire together
pub use cloning::CloneLaunch;
pub use hypervisor::{GovcClient, HypervisorClient, TaskState};
pub use request::{HostCredential, OsFamily};
pub use service::MigrationService;
pub use status::{StatusStore, WorkflowState, WorkflowStatus};
