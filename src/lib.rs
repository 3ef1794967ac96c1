//! Configuration and bootstrap for a lora-facade node.
//!
//! The coordination logic lives in [`lora_coordination`]; this crate layers a
//! TOML/environment configuration over it and wires a runnable node around
//! the in-memory cache store and device registry.

pub mod config;
pub mod node;

pub use config::ConfigError;
pub use config::FacadeConfig;
pub use config::RegistrySeed;
pub use node::FacadeManager;
pub use node::FacadeNode;
