//! Adapter over the external bead CLI: subprocess plumbing, typed
//! operations, and cross-project dependency readiness.

pub mod cli;
pub mod deps;
pub mod service;

pub use cli::{BeadCliError, BeadTool, CliOutput, CliRunner};
pub use deps::DependencyIndex;
pub use service::{BeadService, CliBeadService, CreateBead};
