//! Adaptive data rate delegation.
//!
//! The numeric ADR strategy lives outside this crate behind [`AdrManager`].
//! The pipeline only asks for a decision and, when the decision has to be sent
//! to the device, assigns it a downlink frame counter.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::CoordinationError;
use crate::types::DevEui;

/// Radio metrics of one uplink, as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdrRequest {
    /// Data rate index of the uplink.
    pub data_rate: u8,
    /// Signal to noise ratio (dB).
    pub snr: f64,
    /// Uplink frame counter.
    pub fcnt_up: u32,
    /// Downlink frame counter known to the gateway.
    pub fcnt_down: u32,
    /// Run the strategy (otherwise only record the metrics).
    pub perform_calculation: bool,
    /// Forget the device's ADR history first.
    pub clear_cache: bool,
}

/// What the ADR strategy wants the device to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdrDecision {
    /// The decision must be confirmed to the device in a downlink.
    pub can_confirm_to_device: bool,
    /// Target data rate index.
    pub data_rate: Option<u8>,
    /// Target transmit power index.
    pub tx_power: Option<u8>,
    /// Target number of repetitions.
    pub nb_repetition: Option<u8>,
    /// Downlink counter assigned to the confirmation.
    pub fcnt_down: Option<u32>,
}

/// External ADR strategy.
#[async_trait]
pub trait AdrManager: Send + Sync {
    /// Compute a decision for the uplink described by `request`.
    async fn calculate(
        &self,
        dev_eui: DevEui,
        gateway_id: &str,
        request: &AdrRequest,
    ) -> Result<AdrDecision, CoordinationError>;

    /// Undo whatever `calculate` recorded for this device. Called when a later
    /// pipeline step aborts the request.
    async fn on_abort(&self, _dev_eui: DevEui, _gateway_id: &str) -> Result<(), CoordinationError> {
        Ok(())
    }
}

/// ADR turned off: never asks for a downlink.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledAdrManager;

#[async_trait]
impl AdrManager for DisabledAdrManager {
    async fn calculate(
        &self,
        _dev_eui: DevEui,
        _gateway_id: &str,
        _request: &AdrRequest,
    ) -> Result<AdrDecision, CoordinationError> {
        Ok(AdrDecision::default())
    }
}
