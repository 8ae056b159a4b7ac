//! Error taxonomy for the measurement control plane

use thiserror::Error;

use super::{AgentId, MeasurementId, Round};

/// Top-level error type
#[derive(Error, Debug)]
pub enum IrisError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Prober error: {0}")]
    Prober(#[from] ProberError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed user input; rejected without any state change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty target file")]
    EmptyFile,

    #[error("invalid target row {line}: {reason}")]
    InvalidRow { line: usize, reason: String },

    #[error("more than one trailing blank line")]
    TrailingBlankLines,

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("unknown state: {0}")]
    UnknownState(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unknown target file type: {0}")]
    UnknownTargetType(String),

    #[error("round > 1 task without a probes file")]
    MissingProbesFile,

    #[error("invalid results table name: {0}")]
    InvalidTableName(String),
}

/// Bus (key/value + pub/sub) failures
#[derive(Error, Debug)]
pub enum BusError {
    #[error("connection failed: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("malformed payload on channel {channel}: {reason}")]
    MalformedPayload { channel: String, reason: String },

    #[error("agent {agent_uuid} is not registered")]
    AgentNotRegistered { agent_uuid: AgentId },
}

/// Object-store failures, after adapter-local retries are exhausted
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("{operation} on {bucket} failed: {reason}")]
    Request {
        operation: &'static str,
        bucket: String,
        reason: String,
    },

    #[error("local file error for {path}: {source}")]
    LocalFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Columnar-store failures
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Database(#[from] clickhouse::error::Error),

    #[error("measurement agent {measurement_uuid}/{agent_uuid} not found")]
    NotFound {
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
    },

    #[error("malformed stored blob for {measurement_uuid}/{agent_uuid}: {reason}")]
    MalformedBlob {
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
        reason: String,
    },

    #[error("invalid results table name: {0}")]
    InvalidTableName(String),
}

/// Prober subprocess failures
#[derive(Error, Debug)]
pub enum ProberError {
    #[error("failed to spawn prober {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("prober exited with status {code}")]
    NonZeroExit { code: i32 },

    #[error("both stdin probes and an input file were supplied")]
    ConflictingInputs,

    #[error("prober I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker round-pipeline failures
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("round {round} for {measurement_uuid}/{agent_uuid} is already in flight")]
    RoundInFlight {
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
        round: Round,
    },

    #[error("duplicate round {round} for {measurement_uuid}/{agent_uuid}")]
    DuplicateRound {
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
        round: Round,
    },

    #[error("malformed result file {key}: {reason}")]
    MalformedResults { key: String, reason: String },

    #[error("compression failed: {0}")]
    Compression(std::io::Error),
}

/// Result alias used across the crate
pub type IrisResult<T> = Result<T, IrisError>;
