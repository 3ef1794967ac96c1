//! Execution pipeline ("function bundler").
//!
//! One request from a gateway can ask for several coordination results at
//! once: deduplication, an ADR decision, the next downlink counter and the
//! preferred gateway. Each is produced by an [`ExecutionStep`]; the bundler
//! runs the requested steps strictly in priority order, feeding each the
//! outcome accumulated so far. When a step aborts, the steps that already ran
//! are compensated in the order they ran.
//!
//! ```text
//! Pending -> Running(0) -> Running(1) -> ... -> Completed
//!                 \              \
//!                  +--------------+--> Aborted
//! ```

mod steps;

use std::fmt;
use std::ops::BitOr;
use std::ops::BitOrAssign;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

pub use steps::BundlerStep;

use crate::adr::AdrDecision;
use crate::adr::AdrRequest;
use crate::dedup::DeduplicationResult;
use crate::error::CoordinationError;
use crate::preferred_gateway::PreferredGatewayResult;
use crate::types::DevEui;

/// Set of results a request asks for.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundlerItems(u8);

impl BundlerItems {
    /// Nothing requested.
    pub const NONE: Self = Self(0);
    /// Next downlink frame counter.
    pub const FCNT_DOWN: Self = Self(1);
    /// Cross-gateway deduplication.
    pub const DEDUPLICATION: Self = Self(2);
    /// ADR decision.
    pub const ADR: Self = Self(4);
    /// Preferred gateway election.
    pub const PREFERRED_GATEWAY: Self = Self(8);

    const NAMES: [(Self, &'static str); 4] = [
        (Self::FCNT_DOWN, "FCNT_DOWN"),
        (Self::DEDUPLICATION, "DEDUPLICATION"),
        (Self::ADR, "ADR"),
        (Self::PREFERRED_GATEWAY, "PREFERRED_GATEWAY"),
    ];

    /// Raw bit mask.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Items from a raw mask, dropping unknown bits.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0x0F)
    }

    /// Whether every item of `other` is requested.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether nothing is requested.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BundlerItems {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BundlerItems {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BundlerItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(item, _)| self.contains(*item))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "BundlerItems({})", names.join(" | "))
    }
}

/// One gateway's request for coordination results about an uplink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundlerRequest {
    /// Gateway that received the uplink.
    pub gateway_id: String,
    /// Uplink frame counter.
    pub client_fcnt_up: u32,
    /// Downlink frame counter known to the gateway.
    pub client_fcnt_down: u32,
    /// Received signal strength (dBm).
    pub rssi: f64,
    /// ADR metrics, required when `items` contains [`BundlerItems::ADR`].
    #[serde(default)]
    pub adr: Option<AdrRequest>,
    /// Requested results.
    pub items: BundlerItems,
}

/// Results accumulated by the steps of one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// Downlink counter to use; `Some(0)` means "no downlink".
    pub next_fcnt_down: Option<u32>,
    /// Deduplication decision.
    pub deduplication: Option<DeduplicationResult>,
    /// ADR decision.
    pub adr: Option<AdrDecision>,
    /// Preferred gateway.
    pub preferred_gateway: Option<PreferredGatewayResult>,
}

/// Per-request input shared by every step.
#[derive(Debug, Clone, Copy)]
pub struct PipelineContext<'a> {
    /// Device the uplink came from.
    pub dev_eui: DevEui,
    /// The request.
    pub request: &'a BundlerRequest,
}

/// What a step tells the bundler to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFlow {
    /// Run the next step.
    Continue,
    /// Stop and compensate the steps that ran.
    Abort {
        /// Reported to the caller.
        reason: String,
    },
}

impl StepFlow {
    /// Shorthand for [`StepFlow::Abort`].
    pub fn abort(reason: impl Into<String>) -> Self {
        StepFlow::Abort { reason: reason.into() }
    }
}

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Not started.
    Pending,
    /// Running the step at this index of the selected steps.
    Running(usize),
    /// Every selected step continued.
    Completed,
    /// A step aborted, or the request was cancelled.
    Aborted,
}

/// One unit of pipeline work. Steps are registered once and shared across
/// requests, so they must not keep per-request state.
#[async_trait]
pub trait ExecutionStep: Send + Sync {
    /// Name used in logs and abort reports.
    fn name(&self) -> &'static str;

    /// Lower runs earlier.
    fn priority(&self) -> i32;

    /// Whether this step serves any of the requested items.
    fn needs_to_execute(&self, items: BundlerItems) -> bool;

    /// Do the work, writing results into `outcome`. An error aborts the
    /// pipeline like [`StepFlow::Abort`].
    async fn execute(
        &self,
        ctx: &PipelineContext<'_>,
        outcome: &mut PipelineOutcome,
    ) -> Result<StepFlow, CoordinationError>;

    /// Undo this step's own effect after a later step aborted.
    async fn on_abort(&self, _ctx: &PipelineContext<'_>, _outcome: &mut PipelineOutcome) -> Result<(), CoordinationError> {
        Ok(())
    }
}

/// A request that did not complete.
#[derive(Debug, Snafu)]
#[snafu(display("pipeline aborted at step {step}: {reason}"))]
pub struct PipelineAborted {
    /// Step that aborted, or `"cancelled"`.
    pub step: &'static str,
    /// Why.
    pub reason: String,
    /// Results produced before the abort.
    pub outcome: PipelineOutcome,
    /// The step's error, when it failed rather than chose to abort.
    pub error: Option<CoordinationError>,
}

/// Runs a fixed set of steps, sorted by priority once at construction.
pub struct FunctionBundler<T: ExecutionStep> {
    steps: Vec<T>,
}

impl<T: ExecutionStep> FunctionBundler<T> {
    /// Register `steps`. Equal priorities keep registration order.
    pub fn new(mut steps: Vec<T>) -> Self {
        steps.sort_by_key(|step| step.priority());
        Self { steps }
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Run the steps `request.items` asks for.
    ///
    /// `cancel` is checked between steps only, so a step holding a lock always
    /// finishes and releases it.
    pub async fn execute(
        &self,
        dev_eui: DevEui,
        request: &BundlerRequest,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineAborted> {
        let ctx = PipelineContext { dev_eui, request };
        let selected: Vec<&T> = self.steps.iter().filter(|s| s.needs_to_execute(request.items)).collect();
        let mut outcome = PipelineOutcome::default();
        let mut state = PipelineState::Pending;
        debug!(%dev_eui, items = ?request.items, steps = selected.len(), ?state, "pipeline started");

        for (index, step) in selected.iter().enumerate() {
            if cancel.is_cancelled() {
                let reason = "request cancelled".to_string();
                return Err(self.abort(&ctx, &selected[..index], "cancelled", reason, None, outcome).await);
            }

            state = PipelineState::Running(index);
            debug!(%dev_eui, step = step.name(), ?state, "pipeline step");

            let (reason, error) = match step.execute(&ctx, &mut outcome).await {
                Ok(StepFlow::Continue) => continue,
                Ok(StepFlow::Abort { reason }) => (reason, None),
                Err(e) => (e.to_string(), Some(e)),
            };
            return Err(self.abort(&ctx, &selected[..index], step.name(), reason, error, outcome).await);
        }

        state = PipelineState::Completed;
        debug!(%dev_eui, ?state, "pipeline finished");
        Ok(outcome)
    }

    async fn abort(
        &self,
        ctx: &PipelineContext<'_>,
        ran: &[&T],
        step: &'static str,
        reason: String,
        error: Option<CoordinationError>,
        mut outcome: PipelineOutcome,
    ) -> PipelineAborted {
        debug!(dev_eui = %ctx.dev_eui, step, reason = %reason, state = ?PipelineState::Aborted, "pipeline aborted");

        for done in ran {
            if let Err(e) = done.on_abort(ctx, &mut outcome).await {
                warn!(dev_eui = %ctx.dev_eui, step = done.name(), error = %e, "step compensation failed");
            }
        }

        PipelineAborted {
            step,
            reason,
            outcome,
            error,
        }
    }
}
