//! Device-state coordination for multi-gateway LoRaWAN deployments.
//!
//! Several gateway processes hear the same radio frames and have to agree on
//! one view of each device: its frame counters, which gateway owns the current
//! exchange, whether a join nonce was already used, and which devices use a
//! session address. All agreement goes through the shared cache
//! ([`lora_cache::CacheStore`]) and its owner-scoped locks; nothing here relies
//! on in-process synchronization, so any number of independent processes can
//! run this code side by side.
//!
//! # Components
//!
//! - [`DeviceLockSession`]: scoped per-device lock; state is only reachable
//!   through the guard it returns
//! - [`FrameCounterArbitrator`]: next downlink counter, ABP reset, admin clear
//! - [`Deduplicator`]: first gateway to report an uplink owns it
//! - [`JoinCoordinator`]: join eligibility and one-time nonces
//! - [`DevAddrCache`] / [`DevAddrReconciler`] / [`DevAddrSyncScheduler`]:
//!   address to device mapping, kept in step with the registry
//! - [`PreferredGatewayResolver`]: strongest receiver for class C downlinks
//! - [`FunctionBundler`]: ordered, compensable pipeline of the above
//! - [`DeviceManager`]: facade wiring everything together
//!
//! Decision logic is kept free of I/O in [`verified`].

pub mod adr;
pub mod bundler;
pub mod config;
pub mod dedup;
pub mod devaddr_cache;
pub mod device_lock;
pub mod error;
pub mod fcnt;
pub mod join;
pub mod keys;
pub mod lock;
pub mod manager;
pub mod preferred_gateway;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod verified;

pub use adr::AdrDecision;
pub use adr::AdrManager;
pub use adr::AdrRequest;
pub use adr::DisabledAdrManager;
pub use bundler::BundlerItems;
pub use bundler::BundlerRequest;
pub use bundler::BundlerStep;
pub use bundler::ExecutionStep;
pub use bundler::FunctionBundler;
pub use bundler::PipelineAborted;
pub use bundler::PipelineContext;
pub use bundler::PipelineOutcome;
pub use bundler::StepFlow;
pub use config::CoordinationConfig;
pub use dedup::DedupOutcome;
pub use dedup::DeduplicationResult;
pub use dedup::Deduplicator;
pub use devaddr_cache::DevAddrCache;
pub use devaddr_cache::DevAddrLookup;
pub use devaddr_cache::DevAddrReconciler;
pub use devaddr_cache::JoinedDevice;
pub use devaddr_cache::LookupSource;
pub use devaddr_cache::SyncKind;
pub use devaddr_cache::SyncReport;
pub use device_lock::DeviceLockGuard;
pub use device_lock::DeviceLockSession;
pub use error::CoordinationError;
pub use fcnt::FCntDownResult;
pub use fcnt::FrameCounterArbitrator;
pub use fcnt::ResetOutcome;
pub use join::JoinCoordinator;
pub use join::JoinDecision;
pub use join::JoinRejection;
pub use manager::DeviceManager;
pub use preferred_gateway::PreferredGatewayResolver;
pub use preferred_gateway::PreferredGatewayResult;
pub use registry::DeviceRegistry;
pub use registry::InMemoryRegistry;
pub use registry::RegisteredDevice;
pub use registry::RegistryError;
pub use scheduler::DevAddrSyncScheduler;
pub use types::DevAddr;
pub use types::DevEui;
pub use types::DevNonce;
pub use types::DeviceFrameCounterState;
