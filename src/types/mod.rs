//! Core types for the Iris measurement control plane

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Unique identifier for measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeasurementId(pub Uuid);

impl MeasurementId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MeasurementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MeasurementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One execution of the prober for a given (measurement, agent)
pub type Round = u32;

/// Probing strategy driven by the external prober binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tool {
    DiamondMiner,
    Yarrp,
    Ping,
    Probes,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::DiamondMiner => write!(f, "diamond-miner"),
            Tool::Yarrp => write!(f, "yarrp"),
            Tool::Ping => write!(f, "ping"),
            Tool::Probes => write!(f, "probes"),
        }
    }
}

impl FromStr for Tool {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "diamond-miner" => Ok(Tool::DiamondMiner),
            "yarrp" => Ok(Tool::Yarrp),
            "ping" => Ok(Tool::Ping),
            "probes" => Ok(Tool::Probes),
            other => Err(ValidationError::UnknownTool(other.to_string())),
        }
    }
}

/// Transport protocol carried by probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Icmp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "icmp" => Ok(Protocol::Icmp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ValidationError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Flow mapper selection carried in tool parameters.
///
/// A flow mapper is a deterministic function from `(subnet, flow_index)` to
/// a destination address and a source-port offset, used to vary probes
/// within a subnet. The set of mappers is closed; configuration carries the
/// variant tag plus its typed parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FlowMapperConfig {
    #[default]
    Sequential,
    ReverseByte,
    Random {
        seed: u64,
    },
}

/// Per-agent tool parameters, fixed for the lifetime of a measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    pub protocol: Protocol,
    pub min_ttl: u8,
    pub max_ttl: u8,
    pub destination_port: u16,
    pub flow_mapper: FlowMapperConfig,
    pub max_round: Round,
    /// Extra packets per probe, passed through to the prober when set.
    pub n_packets: Option<u32>,
}

impl Default for ToolParameters {
    fn default() -> Self {
        Self {
            protocol: Protocol::Udp,
            min_ttl: 1,
            max_ttl: 32,
            destination_port: 33434,
            flow_mapper: FlowMapperConfig::Sequential,
            max_round: 10,
            n_packets: None,
        }
    }
}

/// Capabilities advertised by a live agent on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentParameters {
    pub hostname: String,
    pub version: String,
    pub ip_address: IpAddr,
    pub max_probing_rate: u32,
    pub ips_per_subnet: u32,
    pub min_ttl: u8,
    pub max_ttl: u8,
}

/// Lifecycle state advertised by a live agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Working,
    #[default]
    Unknown,
}

/// Ephemeral registration of a live agent, kept on the bus under a TTL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_uuid: AgentId,
    pub parameters: AgentParameters,
    pub state: AgentState,
    /// Monotonic counter bumped on every heartbeat.
    pub heartbeat: u64,
}

/// State of one agent's participation in one measurement.
///
/// Transitions follow `Created → Ongoing → {Finished, Canceled,
/// AgentFailure}`; the first terminal state wins and downgrades are
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementAgentState {
    Created,
    Ongoing,
    Finished,
    Canceled,
    AgentFailure,
}

impl MeasurementAgentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MeasurementAgentState::Finished
                | MeasurementAgentState::Canceled
                | MeasurementAgentState::AgentFailure
        )
    }

    /// Whether a transition to `next` is allowed under the monotonic order
    /// `Created < Ongoing < terminal`.
    pub fn can_transition(self, next: MeasurementAgentState) -> bool {
        match (self, next) {
            (a, b) if a == b => false,
            (MeasurementAgentState::Created, _) => true,
            (MeasurementAgentState::Ongoing, b) => b.is_terminal(),
            // Terminal states never change: first terminal wins.
            _ => false,
        }
    }
}

impl fmt::Display for MeasurementAgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementAgentState::Created => write!(f, "created"),
            MeasurementAgentState::Ongoing => write!(f, "ongoing"),
            MeasurementAgentState::Finished => write!(f, "finished"),
            MeasurementAgentState::Canceled => write!(f, "canceled"),
            MeasurementAgentState::AgentFailure => write!(f, "agent_failure"),
        }
    }
}

impl FromStr for MeasurementAgentState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(MeasurementAgentState::Created),
            "ongoing" => Ok(MeasurementAgentState::Ongoing),
            "finished" => Ok(MeasurementAgentState::Finished),
            "canceled" => Ok(MeasurementAgentState::Canceled),
            "agent_failure" => Ok(MeasurementAgentState::AgentFailure),
            other => Err(ValidationError::UnknownState(other.to_string())),
        }
    }
}

/// Measurement state kept on the bus.
///
/// Absence of the key is treated identically to `Canceled`, which keeps
/// the agent-side stopper a single GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementState {
    Ongoing,
    Canceled,
}

/// Per-round statistics reported by the prober's trailing summary lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProbingStatistics {
    pub probes_sent: u64,
    pub replies_received: u64,
    pub filtered_low_ttl: u64,
    pub filtered_high_ttl: u64,
    pub filtered_prefix_excluded: u64,
    pub duration_ms: u64,
    pub peak_memory_bytes: u64,
    /// Set when the result file parsed to zero rows while the prober
    /// reported probes sent.
    #[serde(default)]
    pub empty_results: bool,
}

/// A user-submitted measurement campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub measurement_uuid: MeasurementId,
    pub username: String,
    pub tool: Tool,
    pub tags: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Participation of one agent in one measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementAgent {
    pub measurement_uuid: MeasurementId,
    pub agent_uuid: AgentId,
    /// Object-store key of the uploaded target file; immutable after
    /// creation. `None` for full snapshots and probes-driven runs.
    pub target_file: Option<String>,
    pub probing_rate: Option<u32>,
    pub tool_parameters: ToolParameters,
    /// Snapshot of the agent's advertised parameters at registration.
    pub agent_parameters: AgentParameters,
    /// Dense over `1..=current_round`.
    pub probing_statistics: BTreeMap<Round, ProbingStatistics>,
    pub state: MeasurementAgentState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Per-agent section of a measurement request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementAgentRequest {
    pub agent_uuid: AgentId,
    pub target_file_key: Option<String>,
    pub probing_rate: Option<u32>,
    pub tool_parameters: ToolParameters,
}

/// A measurement request accepted by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRequest {
    pub measurement_uuid: MeasurementId,
    pub username: String,
    pub tool: Tool,
    pub tags: Vec<String>,
    pub agents: Vec<MeasurementAgentRequest>,
}

impl MeasurementRequest {
    /// The per-agent section for `agent_uuid`, if the agent participates.
    pub fn agent(&self, agent_uuid: AgentId) -> Option<&MeasurementAgentRequest> {
        self.agents.iter().find(|a| a.agent_uuid == agent_uuid)
    }
}

/// A single unit of round work dispatched from the worker to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundTask {
    pub measurement_uuid: MeasurementId,
    pub agent_uuid: AgentId,
    pub round: Round,
    pub tool: Tool,
    pub probing_rate: Option<u32>,
    pub tool_parameters: ToolParameters,
    /// Target specification for round 1. `None` together with a `None`
    /// probes file means an exhaustive snapshot.
    pub target_file_key: Option<String>,
    /// Staged probes file for rounds > 1. Mutually exclusive with
    /// `target_file_key`.
    pub probes_file_key: Option<String>,
    pub username: String,
}

/// How a round ended on the agent side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    /// The prober exited cleanly and the results were uploaded.
    Completed { result_key: String },
    /// The round was canceled mid-flight; nothing was uploaded.
    Canceled,
    /// The prober exited non-zero; no result file is available.
    AgentFailure,
}

/// Round-complete notification published by agents for the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundComplete {
    pub measurement_uuid: MeasurementId,
    pub agent_uuid: AgentId,
    pub round: Round,
    pub outcome: RoundOutcome,
}

/// One parsed reply row from a prober result file.
///
/// Addresses are stored as 128-bit integers; IPv4 addresses use the
/// v4-mapped encoding. The field order matches the columnar table layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, clickhouse::Row)]
pub struct ResultRow {
    pub source_ip: u128,
    pub destination_prefix: u128,
    pub destination_ip: u128,
    pub reply_ip: u128,
    pub protocol: String,
    pub source_port: u16,
    pub destination_port: u16,
    pub ttl: u8,
    pub ttl_check: u8,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub rtt: f64,
    pub reply_ttl: u8,
    pub reply_size: u16,
    pub round: Round,
    pub snapshot: u16,
}

/// Encode an address into the 128-bit storage representation.
pub fn ip_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_do_not_downgrade() {
        use MeasurementAgentState::*;
        for terminal in [Finished, Canceled, AgentFailure] {
            assert!(!terminal.can_transition(Ongoing));
            assert!(!terminal.can_transition(Created));
            for other in [Finished, Canceled, AgentFailure] {
                assert!(!terminal.can_transition(other));
            }
        }
    }

    #[test]
    fn ongoing_only_advances_to_terminal() {
        use MeasurementAgentState::*;
        assert!(Ongoing.can_transition(Finished));
        assert!(Ongoing.can_transition(Canceled));
        assert!(Ongoing.can_transition(AgentFailure));
        assert!(!Ongoing.can_transition(Created));
    }

    #[test]
    fn protocol_round_trips_through_str() {
        assert_eq!("icmp".parse::<Protocol>().unwrap(), Protocol::Icmp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("icmt".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Udp.to_string(), "udp");
    }

    #[test]
    fn v4_addresses_use_mapped_encoding() {
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(ip_to_u128(addr) & 0xffff_ffff, 0x0102_0304);
    }

    #[test]
    fn round_task_serializes_with_snake_case_outcome() {
        let complete = RoundComplete {
            measurement_uuid: MeasurementId::new(),
            agent_uuid: AgentId::new(),
            round: 1,
            outcome: RoundOutcome::AgentFailure,
        };
        let json = serde_json::to_string(&complete).unwrap();
        assert!(json.contains("agent_failure"));
    }
}
