//! Authoritative store for measurements and their agent participations
//!
//! Three table families live in the columnar store: `measurement`,
//! `measurement_agent` (with JSON-encoded parameter and statistics blobs)
//! and the dynamic per-run `results__<m>__<a>` tables. Every mutation runs
//! with `mutations_sync = 1` so the write is durable before the call
//! returns.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CommonSettings;
use crate::types::{
    AgentId, AgentParameters, Measurement, MeasurementAgent, MeasurementAgentState,
    MeasurementId, MeasurementRequest, ProbingStatistics, RegistryError, Round, Tool,
    ToolParameters,
};

pub mod results;

pub use results::{forge_table_name, parse_table_name};

const MEASUREMENT_TABLE: &str = "measurement";
const MEASUREMENT_AGENT_TABLE: &str = "measurement_agent";

/// Registry over the columnar store
#[derive(Clone)]
pub struct Registry {
    client: clickhouse::Client,
}

#[derive(Debug, clickhouse::Row, Serialize, Deserialize)]
struct MeasurementRow {
    #[serde(with = "clickhouse::serde::uuid")]
    measurement_uuid: Uuid,
    username: String,
    tool: String,
    tags: Vec<String>,
    start_time: u32,
    end_time: Option<u32>,
}

#[derive(Debug, clickhouse::Row, Serialize, Deserialize)]
struct MeasurementAgentRow {
    #[serde(with = "clickhouse::serde::uuid")]
    measurement_uuid: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    agent_uuid: Uuid,
    target_file: Option<String>,
    probing_rate: Option<u32>,
    probing_statistics: String,
    agent_parameters: String,
    tool_parameters: String,
    state: String,
    start_time: u32,
    end_time: Option<u32>,
}

/// Merge one round's statistics into the stored map.
///
/// Keys are strings inside the blob, integers at the API. Distinct rounds
/// commute; merging the same round again is last-write-wins.
pub fn merge_round_statistics(
    current: BTreeMap<Round, ProbingStatistics>,
    round: Round,
    statistics: &ProbingStatistics,
) -> BTreeMap<String, ProbingStatistics> {
    let mut merged: BTreeMap<String, ProbingStatistics> = current
        .into_iter()
        .map(|(round, stats)| (round.to_string(), stats))
        .collect();
    merged.insert(round.to_string(), statistics.clone());
    merged
}

fn now_epoch() -> u32 {
    Utc::now().timestamp().max(0) as u32
}

fn from_epoch(secs: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(i64::from(secs), 0)
        .single()
        .unwrap_or_default()
}

impl Registry {
    pub fn connect(settings: &CommonSettings) -> Self {
        let mut client = clickhouse::Client::default()
            .with_url(&settings.clickhouse_url)
            .with_database(&settings.clickhouse_database);
        if let Some(username) = &settings.clickhouse_username {
            client = client.with_user(username);
        }
        if let Some(password) = &settings.clickhouse_password {
            client = client.with_password(password);
        }
        Self { client }
    }

    /// Create the static tables, optionally dropping them first.
    pub async fn create_tables(&self, drop: bool) -> Result<(), RegistryError> {
        if drop {
            for table in [MEASUREMENT_TABLE, MEASUREMENT_AGENT_TABLE] {
                self.client
                    .query(&format!("DROP TABLE IF EXISTS {table}"))
                    .execute()
                    .await?;
            }
        }
        self.client
            .query(&format!(
                "CREATE TABLE IF NOT EXISTS {MEASUREMENT_TABLE} (
                    measurement_uuid UUID,
                    username         String,
                    tool             String,
                    tags             Array(String),
                    start_time       DateTime,
                    end_time         Nullable(DateTime)
                )
                ENGINE = MergeTree
                ORDER BY (username, measurement_uuid)"
            ))
            .execute()
            .await?;
        self.client
            .query(&format!(
                "CREATE TABLE IF NOT EXISTS {MEASUREMENT_AGENT_TABLE} (
                    measurement_uuid   UUID,
                    agent_uuid         UUID,
                    target_file        Nullable(String),
                    probing_rate       Nullable(UInt32),
                    probing_statistics String,
                    agent_parameters   String,
                    tool_parameters    String,
                    state              String,
                    start_time         DateTime,
                    end_time           Nullable(DateTime)
                )
                ENGINE = MergeTree
                ORDER BY (measurement_uuid, agent_uuid)"
            ))
            .execute()
            .await?;
        Ok(())
    }

    /// Persist a freshly accepted measurement.
    pub async fn register_measurement(
        &self,
        request: &MeasurementRequest,
    ) -> Result<(), RegistryError> {
        let mut insert = self.client.insert(MEASUREMENT_TABLE)?;
        insert
            .write(&MeasurementRow {
                measurement_uuid: request.measurement_uuid.0,
                username: request.username.clone(),
                tool: request.tool.to_string(),
                tags: request.tags.clone(),
                start_time: now_epoch(),
                end_time: None,
            })
            .await?;
        insert.end().await?;
        Ok(())
    }

    pub async fn measurement_count(&self, username: &str) -> Result<u64, RegistryError> {
        let count = self
            .client
            .query(&format!(
                "SELECT count() FROM {MEASUREMENT_TABLE} WHERE username = ?"
            ))
            .bind(username)
            .fetch_one::<u64>()
            .await?;
        Ok(count)
    }

    pub async fn all_measurements(
        &self,
        username: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Measurement>, RegistryError> {
        let rows = self
            .client
            .query(&format!(
                "SELECT ?fields FROM {MEASUREMENT_TABLE}
                 WHERE username = ?
                 ORDER BY start_time DESC
                 LIMIT ? OFFSET ?"
            ))
            .bind(username)
            .bind(limit)
            .bind(offset)
            .fetch_all::<MeasurementRow>()
            .await?;
        rows.into_iter().map(to_measurement).collect()
    }

    pub async fn get_measurement(
        &self,
        username: &str,
        measurement_uuid: MeasurementId,
    ) -> Result<Option<Measurement>, RegistryError> {
        let row = self
            .client
            .query(&format!(
                "SELECT ?fields FROM {MEASUREMENT_TABLE}
                 WHERE username = ? AND measurement_uuid = ?"
            ))
            .bind(username)
            .bind(measurement_uuid.to_string())
            .fetch_optional::<MeasurementRow>()
            .await?;
        row.map(to_measurement).transpose()
    }

    /// Lookup without the owner filter, for the worker side.
    pub async fn find_measurement(
        &self,
        measurement_uuid: MeasurementId,
    ) -> Result<Option<Measurement>, RegistryError> {
        let row = self
            .client
            .query(&format!(
                "SELECT ?fields FROM {MEASUREMENT_TABLE} WHERE measurement_uuid = ?"
            ))
            .bind(measurement_uuid.to_string())
            .fetch_optional::<MeasurementRow>()
            .await?;
        row.map(to_measurement).transpose()
    }

    /// Stamp the measurement's end once, when all agents are terminal.
    pub async fn stamp_measurement_end(
        &self,
        measurement_uuid: MeasurementId,
    ) -> Result<(), RegistryError> {
        self.client
            .query(&format!(
                "ALTER TABLE {MEASUREMENT_TABLE}
                 UPDATE end_time = now()
                 WHERE measurement_uuid = ? AND end_time IS NULL
                 SETTINGS mutations_sync = 1"
            ))
            .bind(measurement_uuid.to_string())
            .execute()
            .await?;
        Ok(())
    }

    /// All agent participations of one measurement.
    pub async fn all_agents(
        &self,
        measurement_uuid: MeasurementId,
    ) -> Result<Vec<MeasurementAgent>, RegistryError> {
        let rows = self
            .client
            .query(&format!(
                "SELECT ?fields FROM {MEASUREMENT_AGENT_TABLE} WHERE measurement_uuid = ?"
            ))
            .bind(measurement_uuid.to_string())
            .fetch_all::<MeasurementAgentRow>()
            .await?;
        rows.into_iter().map(to_measurement_agent).collect()
    }

    pub async fn get_agent(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
    ) -> Result<Option<MeasurementAgent>, RegistryError> {
        let row = self
            .client
            .query(&format!(
                "SELECT ?fields FROM {MEASUREMENT_AGENT_TABLE}
                 WHERE measurement_uuid = ? AND agent_uuid = ?"
            ))
            .bind(measurement_uuid.to_string())
            .bind(agent_uuid.to_string())
            .fetch_optional::<MeasurementAgentRow>()
            .await?;
        row.map(to_measurement_agent).transpose()
    }

    /// Register one agent's participation: state `ongoing`, empty
    /// statistics, registration-time parameter snapshot.
    pub async fn register_agent(
        &self,
        request: &MeasurementRequest,
        agent_uuid: AgentId,
        agent_parameters: &AgentParameters,
    ) -> Result<(), RegistryError> {
        let section = request.agent(agent_uuid).ok_or(RegistryError::NotFound {
            measurement_uuid: request.measurement_uuid,
            agent_uuid,
        })?;
        let mut insert = self.client.insert(MEASUREMENT_AGENT_TABLE)?;
        insert
            .write(&MeasurementAgentRow {
                measurement_uuid: request.measurement_uuid.0,
                agent_uuid: agent_uuid.0,
                target_file: section.target_file_key.clone(),
                probing_rate: section.probing_rate,
                probing_statistics: "{}".to_string(),
                agent_parameters: serde_json::to_string(agent_parameters)
                    .expect("agent parameters serialize"),
                tool_parameters: serde_json::to_string(&section.tool_parameters)
                    .expect("tool parameters serialize"),
                state: MeasurementAgentState::Ongoing.to_string(),
                start_time: now_epoch(),
                end_time: None,
            })
            .await?;
        insert.end().await?;
        Ok(())
    }

    /// Merge one round's statistics into the stored map.
    ///
    /// Distinct rounds commute; the same round is last-write-wins. The
    /// mutation is synchronous, so the write is visible once this returns.
    pub async fn store_probing_statistics(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
        round: Round,
        statistics: &ProbingStatistics,
    ) -> Result<(), RegistryError> {
        let agent = self
            .get_agent(measurement_uuid, agent_uuid)
            .await?
            .ok_or(RegistryError::NotFound {
                measurement_uuid,
                agent_uuid,
            })?;

        let merged = merge_round_statistics(agent.probing_statistics, round, statistics);

        self.client
            .query(&format!(
                "ALTER TABLE {MEASUREMENT_AGENT_TABLE}
                 UPDATE probing_statistics = ?
                 WHERE measurement_uuid = ? AND agent_uuid = ?
                 SETTINGS mutations_sync = 1"
            ))
            .bind(serde_json::to_string(&merged).expect("statistics serialize"))
            .bind(measurement_uuid.to_string())
            .bind(agent_uuid.to_string())
            .execute()
            .await?;
        Ok(())
    }

    pub async fn stamp_finished(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
    ) -> Result<(), RegistryError> {
        self.stamp_terminal(measurement_uuid, agent_uuid, MeasurementAgentState::Finished)
            .await
    }

    pub async fn stamp_canceled(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
    ) -> Result<(), RegistryError> {
        self.stamp_terminal(measurement_uuid, agent_uuid, MeasurementAgentState::Canceled)
            .await
    }

    pub async fn stamp_failed(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
    ) -> Result<(), RegistryError> {
        self.stamp_terminal(
            measurement_uuid,
            agent_uuid,
            MeasurementAgentState::AgentFailure,
        )
        .await
    }

    /// Move an agent to a terminal state and stamp its end time.
    ///
    /// The predicate restricts the update to non-terminal rows: the first
    /// terminal state wins and later stamps are no-ops.
    async fn stamp_terminal(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
        state: MeasurementAgentState,
    ) -> Result<(), RegistryError> {
        debug_assert!(state.is_terminal());
        self.client
            .query(&format!(
                "ALTER TABLE {MEASUREMENT_AGENT_TABLE}
                 UPDATE state = ?, end_time = now()
                 WHERE measurement_uuid = ? AND agent_uuid = ?
                 AND state IN ('created', 'ongoing')
                 SETTINGS mutations_sync = 1"
            ))
            .bind(state.to_string())
            .bind(measurement_uuid.to_string())
            .bind(agent_uuid.to_string())
            .execute()
            .await?;
        Ok(())
    }
}

fn to_measurement(row: MeasurementRow) -> Result<Measurement, RegistryError> {
    let tool: Tool = row
        .tool
        .parse()
        .map_err(|_| RegistryError::MalformedBlob {
            measurement_uuid: MeasurementId(row.measurement_uuid),
            agent_uuid: AgentId(Uuid::nil()),
            reason: format!("unknown tool `{}`", row.tool),
        })?;
    Ok(Measurement {
        measurement_uuid: MeasurementId(row.measurement_uuid),
        username: row.username,
        tool,
        tags: row.tags,
        start_time: from_epoch(row.start_time),
        end_time: row.end_time.map(from_epoch),
    })
}

fn to_measurement_agent(row: MeasurementAgentRow) -> Result<MeasurementAgent, RegistryError> {
    let measurement_uuid = MeasurementId(row.measurement_uuid);
    let agent_uuid = AgentId(row.agent_uuid);
    let malformed = |reason: String| RegistryError::MalformedBlob {
        measurement_uuid,
        agent_uuid,
        reason,
    };

    let tool_parameters: ToolParameters =
        serde_json::from_str(&row.tool_parameters).map_err(|e| malformed(e.to_string()))?;
    let agent_parameters: AgentParameters =
        serde_json::from_str(&row.agent_parameters).map_err(|e| malformed(e.to_string()))?;
    let stored: BTreeMap<String, ProbingStatistics> =
        serde_json::from_str(&row.probing_statistics).map_err(|e| malformed(e.to_string()))?;
    let probing_statistics = stored
        .into_iter()
        .map(|(round, stats)| {
            round
                .parse::<Round>()
                .map(|round| (round, stats))
                .map_err(|_| malformed(format!("non-integer round key `{round}`")))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    let state: MeasurementAgentState = row
        .state
        .parse()
        .map_err(|_| malformed(format!("unknown state `{}`", row.state)))?;

    Ok(MeasurementAgent {
        measurement_uuid,
        agent_uuid,
        target_file: row.target_file,
        probing_rate: row.probing_rate,
        tool_parameters,
        agent_parameters,
        probing_statistics,
        state,
        start_time: from_epoch(row.start_time),
        end_time: row.end_time.map(from_epoch),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_row_blobs_round_trip() {
        let row = MeasurementAgentRow {
            measurement_uuid: Uuid::new_v4(),
            agent_uuid: Uuid::new_v4(),
            target_file: Some("targets.csv".to_string()),
            probing_rate: Some(1000),
            probing_statistics: r#"{"1":{"probes_sent":10,"replies_received":4,
                "filtered_low_ttl":0,"filtered_high_ttl":0,
                "filtered_prefix_excluded":0,"duration_ms":12,
                "peak_memory_bytes":1024}}"#
                .to_string(),
            agent_parameters: serde_json::to_string(&AgentParameters {
                hostname: "vp-1".to_string(),
                version: "0.4.0".to_string(),
                ip_address: "192.0.2.7".parse().unwrap(),
                max_probing_rate: 10_000,
                ips_per_subnet: 6,
                min_ttl: 1,
                max_ttl: 32,
            })
            .unwrap(),
            tool_parameters: serde_json::to_string(&ToolParameters::default()).unwrap(),
            state: "ongoing".to_string(),
            start_time: 1_600_000_000,
            end_time: None,
        };
        let agent = to_measurement_agent(row).unwrap();
        assert_eq!(agent.state, MeasurementAgentState::Ongoing);
        assert_eq!(agent.probing_statistics.len(), 1);
        assert_eq!(agent.probing_statistics[&1].probes_sent, 10);
        assert!(agent.end_time.is_none());
    }

    #[test]
    fn malformed_blobs_are_reported() {
        let row = MeasurementAgentRow {
            measurement_uuid: Uuid::new_v4(),
            agent_uuid: Uuid::new_v4(),
            target_file: None,
            probing_rate: None,
            probing_statistics: "{".to_string(),
            agent_parameters: "{}".to_string(),
            tool_parameters: "{}".to_string(),
            state: "ongoing".to_string(),
            start_time: 0,
            end_time: None,
        };
        assert!(matches!(
            to_measurement_agent(row),
            Err(RegistryError::MalformedBlob { .. })
        ));
    }
}
