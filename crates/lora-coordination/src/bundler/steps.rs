//! Production pipeline steps.

use std::sync::Arc;

use async_trait::async_trait;
use lora_cache::CacheStore;
use tracing::debug;
use tracing::warn;

use super::BundlerItems;
use super::ExecutionStep;
use super::PipelineContext;
use super::PipelineOutcome;
use super::StepFlow;
use crate::adr::AdrManager;
use crate::dedup::DedupOutcome;
use crate::dedup::Deduplicator;
use crate::error::CoordinationError;
use crate::fcnt::FCntDownResult;
use crate::fcnt::FrameCounterArbitrator;
use crate::preferred_gateway::PreferredGatewayResolver;
use crate::preferred_gateway::PreferredGatewayResult;

const CONTENDED: &str = "device lock contended";

/// The registered steps of the coordination pipeline.
///
/// Priorities: deduplication 1, ADR 2, downlink counter 3, preferred gateway 4.
pub enum BundlerStep<S: CacheStore + ?Sized, A: AdrManager + ?Sized = dyn AdrManager> {
    /// Claims the uplink for the requesting gateway; duplicates abort.
    Deduplication(Arc<Deduplicator<S>>),
    /// Asks the ADR strategy for a decision and numbers its downlink.
    Adr {
        /// The strategy.
        manager: Arc<A>,
        /// Counter source for the confirmation downlink.
        arbitrator: Arc<FrameCounterArbitrator<S>>,
    },
    /// Issues the next downlink counter unless ADR already did.
    NextFCntDown(Arc<FrameCounterArbitrator<S>>),
    /// Elects the gateway for class C downlinks.
    PreferredGateway(Arc<PreferredGatewayResolver<S>>),
}

impl<S, A> BundlerStep<S, A>
where
    S: CacheStore + ?Sized + 'static,
    A: AdrManager + ?Sized,
{
    /// The full step set, one of each.
    pub fn standard(
        deduplicator: Arc<Deduplicator<S>>,
        adr: Arc<A>,
        arbitrator: Arc<FrameCounterArbitrator<S>>,
        preferred_gateway: Arc<PreferredGatewayResolver<S>>,
    ) -> Vec<Self> {
        vec![
            BundlerStep::Deduplication(deduplicator),
            BundlerStep::Adr {
                manager: adr,
                arbitrator: arbitrator.clone(),
            },
            BundlerStep::NextFCntDown(arbitrator),
            BundlerStep::PreferredGateway(preferred_gateway),
        ]
    }

    async fn deduplicate(
        deduplicator: &Deduplicator<S>,
        ctx: &PipelineContext<'_>,
        outcome: &mut PipelineOutcome,
    ) -> Result<StepFlow, CoordinationError> {
        let request = ctx.request;
        let decided = deduplicator
            .check(ctx.dev_eui, &request.gateway_id, request.client_fcnt_up, request.client_fcnt_down)
            .await?;
        let DedupOutcome::Decided(result) = decided else {
            return Ok(StepFlow::abort(CONTENDED));
        };

        let flow = if result.is_duplicate {
            StepFlow::abort(format!("duplicate uplink, owner is {}", result.gateway_id))
        } else {
            StepFlow::Continue
        };
        outcome.deduplication = Some(result);
        Ok(flow)
    }

    async fn adr(
        manager: &A,
        arbitrator: &FrameCounterArbitrator<S>,
        ctx: &PipelineContext<'_>,
        outcome: &mut PipelineOutcome,
    ) -> Result<StepFlow, CoordinationError> {
        let gateway_id = ctx.request.gateway_id.as_str();
        let Some(adr_request) = ctx.request.adr.as_ref() else {
            return Ok(StepFlow::abort("ADR requested without ADR metrics"));
        };

        let mut decision = manager.calculate(ctx.dev_eui, gateway_id, adr_request).await?;
        if decision.can_confirm_to_device {
            let issued = arbitrator
                .next_fcnt_down(ctx.dev_eui, gateway_id, adr_request.fcnt_up, adr_request.fcnt_down)
                .await?;
            match issued {
                FCntDownResult::Issued(fcnt_down) => {
                    decision.fcnt_down = Some(fcnt_down);
                    outcome.next_fcnt_down = Some(fcnt_down);
                }
                FCntDownResult::NotOwner => {
                    debug!(dev_eui = %ctx.dev_eui, gateway_id, "ADR confirmation owned by another gateway");
                    decision.can_confirm_to_device = false;
                    outcome.next_fcnt_down = Some(0);
                }
                FCntDownResult::Contended => {
                    outcome.adr = Some(decision);
                    return Ok(StepFlow::abort(CONTENDED));
                }
            }
        }
        outcome.adr = Some(decision);
        Ok(StepFlow::Continue)
    }

    async fn next_fcnt_down(
        arbitrator: &FrameCounterArbitrator<S>,
        ctx: &PipelineContext<'_>,
        outcome: &mut PipelineOutcome,
    ) -> Result<StepFlow, CoordinationError> {
        if outcome.next_fcnt_down.is_some() {
            return Ok(StepFlow::Continue);
        }

        let request = ctx.request;
        let issued = arbitrator
            .next_fcnt_down(ctx.dev_eui, &request.gateway_id, request.client_fcnt_up, request.client_fcnt_down)
            .await?;
        match issued.wire_value() {
            Some(fcnt_down) => {
                outcome.next_fcnt_down = Some(fcnt_down);
                Ok(StepFlow::Continue)
            }
            None => Ok(StepFlow::abort(CONTENDED)),
        }
    }

    async fn preferred_gateway(
        resolver: &PreferredGatewayResolver<S>,
        ctx: &PipelineContext<'_>,
        outcome: &mut PipelineOutcome,
    ) -> Result<StepFlow, CoordinationError> {
        let request = ctx.request;
        let resolved = resolver
            .resolve(ctx.dev_eui, &request.gateway_id, request.client_fcnt_up, request.rssi)
            .await;
        let result = match resolved {
            Ok(result) => result,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(dev_eui = %ctx.dev_eui, error = %e, "preferred gateway resolution failed");
                PreferredGatewayResult {
                    request_fcnt_up: request.client_fcnt_up,
                    error_message: Some(e.to_string()),
                    ..PreferredGatewayResult::default()
                }
            }
        };
        outcome.preferred_gateway = Some(result);
        Ok(StepFlow::Continue)
    }
}

#[async_trait]
impl<S, A> ExecutionStep for BundlerStep<S, A>
where
    S: CacheStore + ?Sized + 'static,
    A: AdrManager + ?Sized,
{
    fn name(&self) -> &'static str {
        match self {
            BundlerStep::Deduplication(_) => "deduplication",
            BundlerStep::Adr { .. } => "adr",
            BundlerStep::NextFCntDown(_) => "next_fcnt_down",
            BundlerStep::PreferredGateway(_) => "preferred_gateway",
        }
    }

    fn priority(&self) -> i32 {
        match self {
            BundlerStep::Deduplication(_) => 1,
            BundlerStep::Adr { .. } => 2,
            BundlerStep::NextFCntDown(_) => 3,
            BundlerStep::PreferredGateway(_) => 4,
        }
    }

    fn needs_to_execute(&self, items: BundlerItems) -> bool {
        let item = match self {
            BundlerStep::Deduplication(_) => BundlerItems::DEDUPLICATION,
            BundlerStep::Adr { .. } => BundlerItems::ADR,
            BundlerStep::NextFCntDown(_) => BundlerItems::FCNT_DOWN,
            BundlerStep::PreferredGateway(_) => BundlerItems::PREFERRED_GATEWAY,
        };
        items.contains(item)
    }

    async fn execute(
        &self,
        ctx: &PipelineContext<'_>,
        outcome: &mut PipelineOutcome,
    ) -> Result<StepFlow, CoordinationError> {
        match self {
            BundlerStep::Deduplication(deduplicator) => Self::deduplicate(deduplicator, ctx, outcome).await,
            BundlerStep::Adr { manager, arbitrator } => Self::adr(manager, arbitrator, ctx, outcome).await,
            BundlerStep::NextFCntDown(arbitrator) => Self::next_fcnt_down(arbitrator, ctx, outcome).await,
            BundlerStep::PreferredGateway(resolver) => Self::preferred_gateway(resolver, ctx, outcome).await,
        }
    }

    async fn on_abort(&self, ctx: &PipelineContext<'_>, _outcome: &mut PipelineOutcome) -> Result<(), CoordinationError> {
        match self {
            BundlerStep::Adr { manager, .. } => manager.on_abort(ctx.dev_eui, &ctx.request.gateway_id).await,
            _ => Ok(()),
        }
    }
}
