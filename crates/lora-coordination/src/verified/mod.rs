//! Pure decision functions for device-state coordination.
//!
//! This module is the functional core. Every function here is deterministic:
//! no I/O, no clocks, no randomness. The imperative shell (the arbitrator,
//! join coordinator, address cache and pipeline steps) takes locks, reads the
//! cache, calls into these functions and writes back what they decide.
//!
//! # Module Organization
//!
//! - [`fcnt`]: Downlink counter arbitration and ABP reset guard
//! - [`dedup`]: Uplink duplicate detection across gateways
//! - [`join`]: Join eligibility (credential and gateway affinity)
//! - [`devaddr`]: Address bucket construction and merging
//! - [`gateway`]: Preferred gateway election
//!
//! All arithmetic is checked or saturating; nothing here panics.

pub mod dedup;
pub mod devaddr;
pub mod fcnt;
pub mod gateway;
pub mod join;
