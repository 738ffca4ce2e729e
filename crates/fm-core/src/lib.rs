//! Core domain types, configuration, persistence, and coordination
//! primitives shared by every foreman crate.

pub mod clock;
pub mod config;
pub mod lease;
pub mod store;
pub mod types;

pub use clock::Clock;
pub use config::Config;
pub use store::Store;
