//! Probe generation: flow mappers and the lazy probe stream
//!
//! A probe is `(dst, sport, dport, ttl, proto)`. For round 1 the agent
//! expands a target specification into a probe stream; the stream is an
//! `Iterator`, so stdin feeding stays pull-based and bounded by the
//! prober's consumption.

use std::net::IpAddr;

use ipnet::IpNet;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::targets::TargetRow;
use crate::types::{FlowMapperConfig, Protocol};

/// Host offsets are permuted within at most 2^16 addresses per subnet;
/// beyond that flows spill into the source port anyway.
const MAX_MAPPER_CAPACITY: u32 = 1 << 16;

/// Base source port of generated probes; flow spill adds to it.
pub const SOURCE_PORT_BASE: u16 = 24000;

/// Deterministic function from a flow index to a destination-host offset
/// and a source-port offset within one subnet.
#[derive(Debug, Clone)]
pub struct FlowMapper {
    capacity: u32,
    kind: MapperKind,
}

#[derive(Debug, Clone)]
enum MapperKind {
    Sequential,
    ReverseByte { host_bits: u8 },
    Random { permutation: Vec<u32> },
}

impl FlowMapper {
    /// Build a mapper for subnets with `host_bits` addressable bits.
    pub fn new(config: FlowMapperConfig, host_bits: u8) -> Self {
        let capacity = if u32::from(host_bits) >= 16 {
            MAX_MAPPER_CAPACITY
        } else {
            1u32 << host_bits
        };
        let kind = match config {
            FlowMapperConfig::Sequential => MapperKind::Sequential,
            FlowMapperConfig::ReverseByte => MapperKind::ReverseByte {
                host_bits: host_bits.min(16),
            },
            FlowMapperConfig::Random { seed } => {
                let mut permutation: Vec<u32> = (0..capacity).collect();
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                permutation.shuffle(&mut rng);
                MapperKind::Random { permutation }
            }
        };
        Self { capacity, kind }
    }

    /// Map a flow index to `(host_offset, source_port_offset)`.
    ///
    /// Flows beyond the subnet capacity keep the last host and spill into
    /// the source port, so every flow index stays a distinct flow.
    pub fn map(&self, flow: u32) -> (u32, u16) {
        if flow >= self.capacity {
            let spill = flow - self.capacity + 1;
            return (self.host_for(self.capacity - 1), spill as u16);
        }
        (self.host_for(flow), 0)
    }

    fn host_for(&self, flow: u32) -> u32 {
        match &self.kind {
            MapperKind::Sequential => flow,
            MapperKind::ReverseByte { host_bits } => {
                flow.reverse_bits() >> (32 - u32::from(*host_bits))
            }
            MapperKind::Random { permutation } => permutation[flow as usize],
        }
    }
}

/// One outbound probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub destination: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
    pub ttl: u8,
    pub protocol: Protocol,
}

impl ProbeSpec {
    /// The CSV encoding consumed by the prober:
    /// `dst_ip,src_port,dst_port,ttl,protocol`.
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.destination, self.source_port, self.destination_port, self.ttl, self.protocol
        )
    }
}

/// Expansion parameters for one probe stream
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Split length for IPv4 prefixes (24 for prefix lists, 32 for target
    /// lists).
    pub prefix_len_v4: u8,
    /// Split length for IPv6 prefixes.
    pub prefix_len_v6: u8,
    /// Inclusive flow range probed within each subnet.
    pub min_flow: u32,
    pub max_flow: u32,
    pub destination_port: u16,
    pub source_port_base: u16,
    /// `None` keeps a fixed destination (targets lists probe the network
    /// address itself with a single flow).
    pub mapper: Option<FlowMapperConfig>,
}

/// Lazy probe stream over a set of target rows.
///
/// Iteration order is row → subnet → ttl → flow; subnets of a wide prefix
/// are produced lazily so an exhaustive `0.0.0.0/0` snapshot never
/// materializes its subnet list.
pub struct ProbeGenerator {
    rows: Vec<TargetRow>,
    params: GenerationParams,
    mapper_v4: Option<FlowMapper>,
    mapper_v6: Option<FlowMapper>,
    row_idx: usize,
    subnets: Option<ipnet::IpSubnets>,
    current: Option<CurrentSubnet>,
}

struct CurrentSubnet {
    subnet: IpNet,
    row: TargetRow,
    ttl: u8,
    flow: u32,
}

impl ProbeGenerator {
    pub fn new(rows: Vec<TargetRow>, params: GenerationParams) -> Self {
        let mapper_v4 = params
            .mapper
            .map(|m| FlowMapper::new(m, 32 - params.prefix_len_v4));
        let mapper_v6 = params
            .mapper
            .map(|m| FlowMapper::new(m, (128 - params.prefix_len_v6).min(16)));
        Self {
            rows,
            params,
            mapper_v4,
            mapper_v6,
            row_idx: 0,
            subnets: None,
            current: None,
        }
    }

    fn next_subnet(&mut self) -> Option<()> {
        loop {
            if let Some(subnets) = &mut self.subnets {
                if let Some(subnet) = subnets.next() {
                    let row = self.rows[self.row_idx - 1].clone();
                    self.current = Some(CurrentSubnet {
                        subnet,
                        ttl: row.min_ttl,
                        flow: self.params.min_flow,
                        row,
                    });
                    return Some(());
                }
                self.subnets = None;
            }
            let row = self.rows.get(self.row_idx)?;
            let split_len = match row.prefix {
                IpNet::V4(_) => self.params.prefix_len_v4,
                IpNet::V6(_) => self.params.prefix_len_v6,
            };
            // Prefixes narrower than the split length stay whole.
            let split_len = split_len.max(row.prefix.prefix_len());
            self.subnets = row.prefix.subnets(split_len).ok();
            self.row_idx += 1;
        }
    }

    fn probe_for(&self, state: &CurrentSubnet) -> ProbeSpec {
        let mapper = match state.subnet {
            IpNet::V4(_) => self.mapper_v4.as_ref(),
            IpNet::V6(_) => self.mapper_v6.as_ref(),
        };
        let (host_offset, port_offset) = match mapper {
            Some(mapper) => mapper.map(state.flow),
            // No mapper: the flow index spills straight into the port,
            // keeping the destination fixed.
            None => (0, state.flow as u16),
        };
        let destination = match state.subnet {
            IpNet::V4(net) => {
                let base = u32::from(net.network());
                IpAddr::V4((base.wrapping_add(host_offset)).into())
            }
            IpNet::V6(net) => {
                let base = u128::from(net.network());
                IpAddr::V6((base.wrapping_add(u128::from(host_offset))).into())
            }
        };
        ProbeSpec {
            destination,
            source_port: self.params.source_port_base.wrapping_add(port_offset),
            destination_port: self.params.destination_port,
            ttl: state.ttl,
            protocol: state.row.protocol,
        }
    }
}

impl Iterator for ProbeGenerator {
    type Item = ProbeSpec;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                self.next_subnet()?;
            }
            let state = self.current.as_mut().expect("subnet state present");
            if state.ttl > state.row.max_ttl {
                self.current = None;
                continue;
            }
            let probe = self.probe_for(self.current.as_ref().expect("subnet state present"));
            let state = self.current.as_mut().expect("subnet state present");
            if state.flow < self.params.max_flow {
                state.flow += 1;
            } else {
                state.flow = self.params.min_flow;
                state.ttl += 1;
            }
            return Some(probe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    fn row(prefix: &str, min_ttl: u8, max_ttl: u8) -> TargetRow {
        TargetRow {
            prefix: prefix.parse().unwrap(),
            protocol: Protocol::Icmp,
            min_ttl,
            max_ttl,
        }
    }

    fn params(v4_len: u8, min_flow: u32, max_flow: u32, mapper: Option<FlowMapperConfig>) -> GenerationParams {
        GenerationParams {
            prefix_len_v4: v4_len,
            prefix_len_v6: 64,
            min_flow,
            max_flow,
            destination_port: 33434,
            source_port_base: 24000,
            mapper,
        }
    }

    #[test]
    fn sequential_mapper_spills_into_ports() {
        let mapper = FlowMapper::new(FlowMapperConfig::Sequential, 8);
        assert_eq!(mapper.map(0), (0, 0));
        assert_eq!(mapper.map(255), (255, 0));
        assert_eq!(mapper.map(256), (255, 1));
        assert_eq!(mapper.map(300), (255, 45));
    }

    #[test]
    fn reverse_byte_mapper_reverses_host_bits() {
        let mapper = FlowMapper::new(FlowMapperConfig::ReverseByte, 8);
        assert_eq!(mapper.map(1), (128, 0));
        assert_eq!(mapper.map(2), (64, 0));
        assert_eq!(mapper.map(128), (1, 0));
    }

    #[test]
    fn random_mapper_is_a_seeded_permutation() {
        let a = FlowMapper::new(FlowMapperConfig::Random { seed: 42 }, 8);
        let b = FlowMapper::new(FlowMapperConfig::Random { seed: 42 }, 8);
        let mut hosts: Vec<u32> = (0..256).map(|f| a.map(f).0).collect();
        assert_eq!(hosts, (0..256).map(|f| b.map(f).0).collect::<Vec<_>>());
        hosts.sort_unstable();
        assert_eq!(hosts, (0..256).collect::<Vec<_>>());
    }

    #[test]
    fn targets_list_expansion_is_one_probe_per_ttl() {
        let generator = ProbeGenerator::new(
            vec![row("8.8.8.8/32", 2, 4)],
            params(32, 0, 0, None),
        );
        let probes: Vec<_> = generator.collect();
        assert_eq!(probes.len(), 3);
        assert!(probes.iter().all(|p| p.destination.to_string() == "8.8.8.8"));
        assert_eq!(
            probes.iter().map(|p| p.ttl).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn prefix_expansion_splits_and_fans_out_flows() {
        let generator = ProbeGenerator::new(
            vec![row("10.0.0.0/23", 1, 1)],
            params(24, 0, 5, Some(FlowMapperConfig::Sequential)),
        );
        let probes: Vec<_> = generator.collect();
        // Two /24 subnets, six flows each, one ttl.
        assert_eq!(probes.len(), 12);
        assert_eq!(probes[0].destination.to_string(), "10.0.0.0");
        assert_eq!(probes[6].destination.to_string(), "10.0.1.0");
    }

    #[test]
    fn csv_encoding_matches_prober_contract() {
        let probe = ProbeSpec {
            destination: "8.8.8.8".parse().unwrap(),
            source_port: 24000,
            destination_port: 33434,
            ttl: 32,
            protocol: Protocol::Icmp,
        };
        assert_eq!(probe.to_csv(), "8.8.8.8,24000,33434,32,icmp");
    }

    #[test]
    fn multiple_rows_honor_their_own_ttl_ranges() {
        let generator = ProbeGenerator::new(
            vec![row("1.1.1.0/24", 1, 2), row("2.2.2.0/24", 5, 5)],
            params(24, 0, 0, Some(FlowMapperConfig::Sequential)),
        );
        let ttls: Vec<u8> = generator.map(|p| p.ttl).collect();
        assert_eq!(ttls, vec![1, 2, 5]);
    }
}
