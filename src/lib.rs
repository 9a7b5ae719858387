pub mod config;
pub mod container;
pub mod db;
pub mod descriptor;
pub mod error;
pub mod extract;
pub mod literal;
pub mod orchestrator;
pub mod resolver;
pub mod server;
pub mod watermark;

pub use error::{PreconditionViolation, RefreshError, Result};
pub use orchestrator::{
    FailureKind, RefreshOrchestrator, RefreshOutcome, RunContext, RunOptions, RunSummary, SkipReason,
};
