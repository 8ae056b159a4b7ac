//! Per-(measurement, agent) results tables
//!
//! Each run owns one table named by a deterministic, invertible function
//! of the two identifiers. Tables are created lazily on first ingest and
//! dropped only when the measurement is deleted.

use std::sync::OnceLock;

use regex::Regex;

use serde::Deserialize;

use crate::types::{AgentId, MeasurementId, RegistryError, ResultRow, ValidationError};

use super::Registry;

/// Distinct reply addresses seen behind one (destination prefix, ttl)
#[derive(Debug, Clone, Copy, PartialEq, Eq, clickhouse::Row, Deserialize)]
pub struct Discovery {
    pub destination_prefix: u128,
    pub ttl: u8,
    pub replies: u64,
}

fn table_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^results__([0-9a-f_]{36})__([0-9a-f_]{36})$").expect("pattern compiles")
    })
}

/// Deterministic table name for one (measurement, agent) pair.
pub fn forge_table_name(measurement_uuid: MeasurementId, agent_uuid: AgentId) -> String {
    format!(
        "results__{}__{}",
        measurement_uuid.to_string().replace('-', "_"),
        agent_uuid.to_string().replace('-', "_")
    )
}

/// Total inverse of [`forge_table_name`].
pub fn parse_table_name(name: &str) -> Result<(MeasurementId, AgentId), ValidationError> {
    let captures = table_name_pattern()
        .captures(name)
        .ok_or_else(|| ValidationError::InvalidTableName(name.to_string()))?;
    let parse = |raw: &str| {
        raw.replace('_', "-")
            .parse()
            .map_err(|_| ValidationError::InvalidTableName(name.to_string()))
    };
    Ok((
        MeasurementId(parse(&captures[1])?),
        AgentId(parse(&captures[2])?),
    ))
}

impl Registry {
    /// Create the results table for one run if it does not exist yet.
    pub async fn create_results_table(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
    ) -> Result<(), RegistryError> {
        let table = forge_table_name(measurement_uuid, agent_uuid);
        self.client
            .query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    source_ip          UInt128,
                    destination_prefix UInt128,
                    destination_ip     UInt128,
                    reply_ip           UInt128,
                    protocol           String,
                    source_port        UInt16,
                    destination_port   UInt16,
                    ttl                UInt8,
                    ttl_check          UInt8,
                    icmp_type          UInt8,
                    icmp_code          UInt8,
                    rtt                Float64,
                    reply_ttl          UInt8,
                    reply_size         UInt16,
                    round              UInt32,
                    snapshot           UInt16
                )
                ENGINE = MergeTree
                ORDER BY (destination_prefix, destination_ip, ttl)"
            ))
            .execute()
            .await?;
        Ok(())
    }

    pub async fn results_table_exists(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
    ) -> Result<bool, RegistryError> {
        let table = forge_table_name(measurement_uuid, agent_uuid);
        let count = self
            .client
            .query(
                "SELECT count() FROM system.tables
                 WHERE database = currentDatabase() AND name = ?",
            )
            .bind(table)
            .fetch_one::<u64>()
            .await?;
        Ok(count > 0)
    }

    /// Batched insert of parsed result rows.
    pub async fn insert_results(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
        rows: &[ResultRow],
        batch_size: usize,
    ) -> Result<(), RegistryError> {
        let table = forge_table_name(measurement_uuid, agent_uuid);
        for chunk in rows.chunks(batch_size.max(1)) {
            let mut insert = self.client.insert(&table)?;
            for row in chunk {
                insert.write(row).await?;
            }
            insert.end().await?;
        }
        Ok(())
    }

    pub async fn results_count(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
    ) -> Result<u64, RegistryError> {
        let table = forge_table_name(measurement_uuid, agent_uuid);
        let count = self
            .client
            .query(&format!("SELECT count() FROM {table}"))
            .fetch_one::<u64>()
            .await?;
        Ok(count)
    }

    /// Distinct reply addresses per (destination prefix, ttl) observed in
    /// one round; the Diamond-Miner next-round computation compares two
    /// consecutive rounds of these.
    pub async fn discoveries_by_prefix(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
        round: crate::types::Round,
    ) -> Result<Vec<Discovery>, RegistryError> {
        let table = forge_table_name(measurement_uuid, agent_uuid);
        let rows = self
            .client
            .query(&format!(
                "SELECT destination_prefix, ttl, uniqExact(reply_ip) AS replies
                 FROM {table}
                 WHERE round = ?
                 GROUP BY destination_prefix, ttl
                 ORDER BY destination_prefix, ttl"
            ))
            .bind(round)
            .fetch_all::<Discovery>()
            .await?;
        Ok(rows)
    }

    pub async fn drop_results_table(
        &self,
        measurement_uuid: MeasurementId,
        agent_uuid: AgentId,
    ) -> Result<(), RegistryError> {
        let table = forge_table_name(measurement_uuid, agent_uuid);
        self.client
            .query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn forge_matches_known_vector() {
        let m = MeasurementId("1b830be7-2b42-401b-bbe6-6b1baf02c9be".parse().unwrap());
        let a = AgentId("b17fe299-17bf-4dbe-9ae3-f600b540ec1f".parse().unwrap());
        assert_eq!(
            forge_table_name(m, a),
            "results__1b830be7_2b42_401b_bbe6_6b1baf02c9be__b17fe299_17bf_4dbe_9ae3_f600b540ec1f"
        );
    }

    #[test]
    fn parse_inverts_forge() {
        for _ in 0..32 {
            let m = MeasurementId(Uuid::new_v4());
            let a = AgentId(Uuid::new_v4());
            assert_eq!(parse_table_name(&forge_table_name(m, a)).unwrap(), (m, a));
        }
    }

    #[test]
    fn parse_rejects_foreign_names() {
        for name in [
            "results",
            "results__abc__def",
            "measurement_agent",
            "results__1b830be7_2b42_401b_bbe6_6b1baf02c9be__short",
            "results__1b830be7-2b42-401b-bbe6-6b1baf02c9be__b17fe299-17bf-4dbe-9ae3-f600b540ec1f",
        ] {
            assert!(parse_table_name(name).is_err(), "{name} should be rejected");
        }
    }
}
