//! Settings for the agent, worker and controller processes
//!
//! Plain serde structs with defaults suitable for a local deployment;
//! every value can be overridden from the environment (`IRIS_*`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::AgentId;

/// Retry policy applied to transient bus and object-store failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Initial backoff interval.
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Backoff cap.
    #[serde(with = "humantime_serde")]
    pub cap: Duration,
    /// Attempts before the failure is surfaced.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Settings shared by every process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonSettings {
    /// Redis connection URL.
    pub redis_url: String,
    /// ClickHouse HTTP endpoint.
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    pub clickhouse_username: Option<String>,
    pub clickhouse_password: Option<String>,
    /// S3-compatible endpoint (MinIO in the standard deployment).
    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    /// Prefix of per-measurement buckets.
    pub bucket_prefix: String,
    /// Prefix of per-user targets buckets.
    pub targets_bucket_prefix: String,
    pub retry: RetryPolicy,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            clickhouse_url: "http://127.0.0.1:8123".to_string(),
            clickhouse_database: "iris".to_string(),
            clickhouse_username: None,
            clickhouse_password: None,
            s3_endpoint: "http://127.0.0.1:9000".to_string(),
            s3_region: "us-east-1".to_string(),
            s3_access_key: "minioadmin".to_string(),
            s3_secret_key: "minioadmin".to_string(),
            bucket_prefix: "iris-".to_string(),
            targets_bucket_prefix: "iris-targets-".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl CommonSettings {
    /// Apply `IRIS_*` environment overrides on top of the defaults.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        override_string(&mut settings.redis_url, "IRIS_REDIS_URL");
        override_string(&mut settings.clickhouse_url, "IRIS_CLICKHOUSE_URL");
        override_string(&mut settings.clickhouse_database, "IRIS_CLICKHOUSE_DATABASE");
        settings.clickhouse_username = env_opt("IRIS_CLICKHOUSE_USERNAME");
        settings.clickhouse_password = env_opt("IRIS_CLICKHOUSE_PASSWORD");
        override_string(&mut settings.s3_endpoint, "IRIS_S3_ENDPOINT");
        override_string(&mut settings.s3_region, "IRIS_S3_REGION");
        override_string(&mut settings.s3_access_key, "IRIS_S3_ACCESS_KEY");
        override_string(&mut settings.s3_secret_key, "IRIS_S3_SECRET_KEY");
        override_string(&mut settings.bucket_prefix, "IRIS_BUCKET_PREFIX");
        override_string(
            &mut settings.targets_bucket_prefix,
            "IRIS_TARGETS_BUCKET_PREFIX",
        );
        settings
    }

    /// Bucket holding a measurement's probe and result files.
    pub fn measurement_bucket(&self, measurement_uuid: crate::types::MeasurementId) -> String {
        format!("{}{}", self.bucket_prefix, measurement_uuid)
    }

    /// Bucket holding a user's uploaded target files.
    pub fn targets_bucket(&self, username: &str) -> String {
        format!("{}{}", self.targets_bucket_prefix, username)
    }
}

/// Settings for the agent process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub agent_uuid: AgentId,
    /// Address advertised on the bus.
    pub ip_address: std::net::IpAddr,
    /// Directory receiving prober result files, one subdirectory per
    /// measurement.
    pub results_dir: PathBuf,
    /// Directory receiving downloaded target and probes files.
    pub targets_dir: PathBuf,
    /// Path of the prober binary.
    pub prober_path: PathBuf,
    /// BGP prefixes file handed to the prober's prefix filter on
    /// exhaustive snapshots.
    pub prefix_filter_file: Option<PathBuf>,
    /// Flows probed within each /24.
    pub ips_per_subnet: u32,
    /// Base source port for generated probes.
    pub source_port_base: u16,
    pub min_ttl: u8,
    pub max_ttl: u8,
    pub max_probing_rate: u32,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Stopper polling interval for measurement cancellation.
    #[serde(with = "humantime_serde")]
    pub stopper_refresh: Duration,
    /// Grace window between SIGTERM and SIGKILL.
    #[serde(with = "humantime_serde")]
    pub termination_grace: Duration,
    /// Keep local files after a round (and after cancellation).
    pub debug_mode: bool,
    /// Pass `--no-sleep` to the prober.
    pub no_sleep: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_uuid: AgentId::new(),
            ip_address: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            results_dir: PathBuf::from("/tmp/iris/results"),
            targets_dir: PathBuf::from("/tmp/iris/targets"),
            prober_path: PathBuf::from("/usr/bin/caracal"),
            prefix_filter_file: None,
            ips_per_subnet: 6,
            source_port_base: 24000,
            min_ttl: 1,
            max_ttl: 32,
            max_probing_rate: 1000,
            heartbeat_interval: Duration::from_secs(5),
            stopper_refresh: Duration::from_secs(1),
            termination_grace: Duration::from_secs(10),
            debug_mode: false,
            no_sleep: false,
        }
    }
}

impl AgentSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(raw) = env_opt("IRIS_AGENT_UUID") {
            if let Ok(uuid) = raw.parse() {
                settings.agent_uuid = AgentId(uuid);
            }
        }
        override_parse(&mut settings.ip_address, "IRIS_AGENT_IP_ADDRESS");
        override_path(&mut settings.results_dir, "IRIS_AGENT_RESULTS_DIR");
        override_path(&mut settings.targets_dir, "IRIS_AGENT_TARGETS_DIR");
        override_path(&mut settings.prober_path, "IRIS_AGENT_PROBER_PATH");
        settings.prefix_filter_file = env_opt("IRIS_AGENT_PREFIX_FILTER").map(PathBuf::from);
        override_parse(&mut settings.ips_per_subnet, "IRIS_AGENT_IPS_PER_SUBNET");
        override_parse(&mut settings.max_probing_rate, "IRIS_AGENT_PROBING_RATE");
        override_parse(&mut settings.debug_mode, "IRIS_AGENT_DEBUG_MODE");
        override_parse(&mut settings.no_sleep, "IRIS_AGENT_NO_SLEEP");
        settings
    }
}

/// Settings for the worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Scratch directory for downloaded results and staged probe files.
    pub working_dir: PathBuf,
    /// Rows per batched insert into a results table.
    pub insert_batch_size: usize,
    /// Upper bound on concurrently processed round completions.
    pub max_concurrent_rounds: usize,
    /// Keep local files after a round.
    pub debug_mode: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/tmp/iris/worker"),
            insert_batch_size: 10_000,
            max_concurrent_rounds: 16,
            debug_mode: false,
        }
    }
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        override_path(&mut settings.working_dir, "IRIS_WORKER_DIR");
        override_parse(&mut settings.insert_batch_size, "IRIS_WORKER_BATCH_SIZE");
        override_parse(&mut settings.debug_mode, "IRIS_WORKER_DEBUG_MODE");
        settings
    }
}

/// `Ok` non-empty values only; unset and non-unicode behave the same.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn override_string(slot: &mut String, key: &str) {
    if let Some(value) = env_opt(key) {
        *slot = value;
    }
}

fn override_path(slot: &mut PathBuf, key: &str) {
    if let Some(value) = env_opt(key) {
        *slot = PathBuf::from(value);
    }
}

fn override_parse<T: std::str::FromStr>(slot: &mut T, key: &str) {
    if let Some(value) = env_opt(key) {
        if let Ok(parsed) = value.parse() {
            *slot = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MeasurementId;

    #[test]
    fn default_retry_policy_matches_contract() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.base, Duration::from_secs(1));
        assert_eq!(retry.cap, Duration::from_secs(30));
        assert_eq!(retry.max_attempts, 5);
    }

    #[test]
    fn bucket_names_embed_identifiers() {
        let settings = CommonSettings::default();
        let m = MeasurementId::new();
        assert_eq!(settings.measurement_bucket(m), format!("iris-{}", m));
        assert_eq!(settings.targets_bucket("admin"), "iris-targets-admin");
    }
}
