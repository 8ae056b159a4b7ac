//! Probing tools: the per-round strategy behind the worker pipeline
//!
//! A tool decides, from the accumulated results of a run, which probes the
//! next round should send. An empty answer terminates the run. Ping,
//! Yarrp and pre-computed probes are single-round; Diamond-Miner widens
//! the flow fan-out of prefixes that discovered new interfaces.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;

use crate::probes::{FlowMapper, ProbeSpec, SOURCE_PORT_BASE};
use crate::registry::{results::Discovery, Registry};
use crate::types::{AgentId, MeasurementId, RegistryError, Round, Tool, ToolParameters};

/// Upper bound on flows per /24, whatever the round schedule says.
const MAX_FLOWS_PER_PREFIX: u32 = 4096;

/// Everything a tool may consult when computing the next round
pub struct NextRoundContext<'a> {
    pub registry: &'a Registry,
    pub measurement_uuid: MeasurementId,
    pub agent_uuid: AgentId,
    /// The round that just completed.
    pub completed_round: Round,
    pub parameters: &'a ToolParameters,
    /// Flows already probed per subnet in round 1.
    pub ips_per_subnet: u32,
}

/// Strategy seam consulted by the worker after every round
#[async_trait]
pub trait ProbingTool: Send + Sync {
    fn kind(&self) -> Tool;

    /// Probes for the next round, or `None` when the run is complete.
    async fn next_round(
        &self,
        ctx: &NextRoundContext<'_>,
    ) -> Result<Option<Vec<ProbeSpec>>, RegistryError>;
}

/// The closed set of tools.
pub fn probing_tool(kind: Tool) -> &'static dyn ProbingTool {
    match kind {
        Tool::DiamondMiner => &DiamondMiner,
        Tool::Yarrp => &SingleRound(Tool::Yarrp),
        Tool::Ping => &SingleRound(Tool::Ping),
        Tool::Probes => &SingleRound(Tool::Probes),
    }
}

/// Tools that send everything in round 1
struct SingleRound(Tool);

#[async_trait]
impl ProbingTool for SingleRound {
    fn kind(&self) -> Tool {
        self.0
    }

    async fn next_round(
        &self,
        _ctx: &NextRoundContext<'_>,
    ) -> Result<Option<Vec<ProbeSpec>>, RegistryError> {
        Ok(None)
    }
}

/// Multipath discovery: compare per-(prefix, ttl) interface counts of the
/// two most recent rounds and widen the flow range where replies are
/// still appearing.
struct DiamondMiner;

impl DiamondMiner {
    /// Flows probed by the end of `round`, following a geometric schedule
    /// seeded by the round-1 fan-out.
    fn flow_budget(round: Round, ips_per_subnet: u32) -> u32 {
        let base = ips_per_subnet.max(1);
        base.saturating_mul(1u32 << (round - 1).min(16))
            .min(MAX_FLOWS_PER_PREFIX)
    }
}

#[async_trait]
impl ProbingTool for DiamondMiner {
    fn kind(&self) -> Tool {
        Tool::DiamondMiner
    }

    async fn next_round(
        &self,
        ctx: &NextRoundContext<'_>,
    ) -> Result<Option<Vec<ProbeSpec>>, RegistryError> {
        let round = ctx.completed_round;
        let current = ctx
            .registry
            .discoveries_by_prefix(ctx.measurement_uuid, ctx.agent_uuid, round)
            .await?;
        if current.is_empty() {
            return Ok(None);
        }
        let previous: HashMap<(u128, u8), u64> = if round > 1 {
            ctx.registry
                .discoveries_by_prefix(ctx.measurement_uuid, ctx.agent_uuid, round - 1)
                .await?
                .into_iter()
                .map(|d| ((d.destination_prefix, d.ttl), d.replies))
                .collect()
        } else {
            HashMap::new()
        };

        let growing: Vec<&Discovery> = current
            .iter()
            .filter(|d| {
                let before = previous
                    .get(&(d.destination_prefix, d.ttl))
                    .copied()
                    .unwrap_or(0);
                d.replies > before
            })
            .collect();
        if growing.is_empty() {
            return Ok(None);
        }

        let probed = Self::flow_budget(round, ctx.ips_per_subnet);
        let budget = Self::flow_budget(round + 1, ctx.ips_per_subnet);
        if budget <= probed {
            // Flow schedule saturated; nothing left to widen.
            return Ok(None);
        }

        let mapper = FlowMapper::new(ctx.parameters.flow_mapper, 8);
        let mut probes = Vec::new();
        for discovery in growing {
            let prefix = u128_to_ip(discovery.destination_prefix);
            for flow in probed..budget {
                let (host_offset, port_offset) = mapper.map(flow);
                probes.push(ProbeSpec {
                    destination: offset_address(prefix, host_offset),
                    source_port: SOURCE_PORT_BASE.wrapping_add(port_offset),
                    destination_port: ctx.parameters.destination_port,
                    ttl: discovery.ttl,
                    protocol: ctx.parameters.protocol,
                });
            }
        }
        Ok(if probes.is_empty() { None } else { Some(probes) })
    }
}

/// Decode the 128-bit storage representation back into an address.
pub fn u128_to_ip(value: u128) -> IpAddr {
    let v6 = Ipv6Addr::from(value);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

fn offset_address(base: IpAddr, offset: u32) -> IpAddr {
    match base {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_add(offset))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_add(u128::from(offset)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_budget_is_geometric_and_capped() {
        assert_eq!(DiamondMiner::flow_budget(1, 6), 6);
        assert_eq!(DiamondMiner::flow_budget(2, 6), 12);
        assert_eq!(DiamondMiner::flow_budget(3, 6), 24);
        assert_eq!(DiamondMiner::flow_budget(12, 6), MAX_FLOWS_PER_PREFIX);
    }

    #[test]
    fn single_round_tools_cover_the_rest() {
        assert_eq!(probing_tool(Tool::Ping).kind(), Tool::Ping);
        assert_eq!(probing_tool(Tool::Yarrp).kind(), Tool::Yarrp);
        assert_eq!(probing_tool(Tool::Probes).kind(), Tool::Probes);
        assert_eq!(probing_tool(Tool::DiamondMiner).kind(), Tool::DiamondMiner);
    }

    #[test]
    fn storage_encoding_round_trips_v4() {
        let addr: IpAddr = "10.20.30.0".parse().unwrap();
        assert_eq!(u128_to_ip(crate::types::ip_to_u128(addr)), addr);
    }

    #[test]
    fn offset_stays_within_protocol_family() {
        let base: IpAddr = "10.0.0.0".parse().unwrap();
        assert_eq!(offset_address(base, 7).to_string(), "10.0.0.7");
    }
}
