//! Worker round pipeline
//!
//! The worker owns the per-(measurement, agent) state machine. For every
//! round-complete notification it ingests the results, updates the
//! statistics, asks the tool for the next round and either stages the
//! next probes file and dispatches round + 1, or finalizes the run.
//!
//! Rounds of one (measurement, agent) are strictly sequential; different
//! agents progress independently, bounded by a concurrency cap.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::bus::Bus;
use crate::config::{CommonSettings, WorkerSettings};
use crate::probes::ProbeSpec;
use crate::registry::Registry;
use crate::storage::Storage;
use crate::tools::{probing_tool, NextRoundContext};
use crate::types::{
    AgentId, IrisResult, MeasurementAgent, MeasurementId, MeasurementState, PipelineError,
    Round, RoundComplete, RoundOutcome, RoundTask,
};

pub mod compress;
pub mod results;

use results::parse_result_file;

/// Worker process: subscribes to round completions and drives runs
pub struct Worker {
    settings: WorkerSettings,
    common: CommonSettings,
    bus: Bus,
    storage: Storage,
    registry: Registry,
    /// One round in flight per (measurement, agent).
    in_flight: DashMap<(MeasurementId, AgentId), Round>,
}

impl Worker {
    pub async fn new(settings: WorkerSettings, common: CommonSettings) -> IrisResult<Self> {
        let bus = Bus::connect(&common).await?;
        let storage = Storage::connect(&common).await;
        let registry = Registry::connect(&common);
        Ok(Self {
            settings,
            common,
            bus,
            storage,
            registry,
            in_flight: DashMap::new(),
        })
    }

    /// Serve round completions until the bus goes away.
    pub async fn run(self: Arc<Self>) -> IrisResult<()> {
        tokio::fs::create_dir_all(&self.settings.working_dir).await?;
        self.registry.create_tables(false).await?;

        let limiter = Arc::new(Semaphore::new(self.settings.max_concurrent_rounds.max(1)));
        let mut completions = self.bus.subscribe_round_completes().await?;
        loop {
            match completions.next().await {
                Ok(complete) => {
                    let worker = Arc::clone(&self);
                    let permit = Arc::clone(&limiter)
                        .acquire_owned()
                        .await
                        .expect("semaphore never closes");
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = worker.handle_round_complete(complete.clone()).await {
                            tracing::error!(
                                measurement_uuid = %complete.measurement_uuid,
                                agent_uuid = %complete.agent_uuid,
                                round = complete.round,
                                error = %err,
                                "round pipeline failed"
                            );
                        }
                    });
                }
                Err(crate::types::BusError::MalformedPayload { channel, reason }) => {
                    tracing::warn!(%channel, %reason, "ignoring malformed round completion");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Process one completion, holding the per-run in-flight slot.
    pub async fn handle_round_complete(&self, complete: RoundComplete) -> IrisResult<()> {
        let key = (complete.measurement_uuid, complete.agent_uuid);
        match self.in_flight.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                return Err(PipelineError::RoundInFlight {
                    measurement_uuid: complete.measurement_uuid,
                    agent_uuid: complete.agent_uuid,
                    round: *entry.get(),
                }
                .into());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(complete.round);
            }
        }
        let result = self.process(&complete).await;
        self.in_flight.remove(&key);
        result
    }

    async fn process(&self, complete: &RoundComplete) -> IrisResult<()> {
        let measurement_uuid = complete.measurement_uuid;
        let agent_uuid = complete.agent_uuid;
        match &complete.outcome {
            RoundOutcome::AgentFailure => {
                tracing::error!(%measurement_uuid, %agent_uuid, round = complete.round, "agent failure");
                self.registry.stamp_failed(measurement_uuid, agent_uuid).await?;
                self.finalize_if_done(measurement_uuid).await
            }
            RoundOutcome::Canceled => {
                self.registry
                    .stamp_canceled(measurement_uuid, agent_uuid)
                    .await?;
                self.finalize_if_done(measurement_uuid).await
            }
            RoundOutcome::Completed { result_key } => {
                self.process_results(complete, result_key).await
            }
        }
    }

    async fn process_results(
        &self,
        complete: &RoundComplete,
        result_key: &str,
    ) -> IrisResult<()> {
        let measurement_uuid = complete.measurement_uuid;
        let agent_uuid = complete.agent_uuid;
        let round = complete.round;

        let Some(agent) = self.registry.get_agent(measurement_uuid, agent_uuid).await? else {
            tracing::error!(%measurement_uuid, %agent_uuid, "completion for an unregistered run");
            return Ok(());
        };
        if agent.probing_statistics.contains_key(&round) {
            return Err(PipelineError::DuplicateRound {
                measurement_uuid,
                agent_uuid,
                round,
            }
            .into());
        }

        // Ingest: download, parse, create the table lazily, batched insert.
        let bucket = self.common.measurement_bucket(measurement_uuid);
        let local = self
            .settings
            .working_dir
            .join(format!("{measurement_uuid}_{agent_uuid}_{round}.csv"));
        self.storage.download(&bucket, result_key, &local).await?;
        let content = tokio::fs::read_to_string(&local).await?;
        let (rows, mut statistics) = parse_result_file(&content, result_key)?;

        self.registry
            .create_results_table(measurement_uuid, agent_uuid)
            .await?;
        self.registry
            .insert_results(
                measurement_uuid,
                agent_uuid,
                &rows,
                self.settings.insert_batch_size,
            )
            .await?;

        if rows.is_empty() && statistics.probes_sent > 0 {
            statistics.empty_results = true;
            tracing::warn!(
                %measurement_uuid,
                %agent_uuid,
                round,
                probes_sent = statistics.probes_sent,
                "probes were sent but the result file is empty"
            );
        }
        self.registry
            .store_probing_statistics(measurement_uuid, agent_uuid, round, &statistics)
            .await?;

        let outcome = self.decide_next(&agent, round, rows.is_empty()).await?;
        match outcome {
            NextStep::Canceled => {
                self.registry
                    .stamp_canceled(measurement_uuid, agent_uuid)
                    .await?;
                self.finalize_if_done(measurement_uuid).await?;
            }
            NextStep::Finished => {
                self.registry
                    .stamp_finished(measurement_uuid, agent_uuid)
                    .await?;
                self.finalize_if_done(measurement_uuid).await?;
            }
            NextStep::Dispatch(probes) => {
                self.dispatch_next_round(&agent, round + 1, probes).await?;
            }
        }

        if !self.settings.debug_mode {
            if let Err(err) = tokio::fs::remove_file(&local).await {
                tracing::warn!(path = %local.display(), error = %err, "could not remove result file");
            }
        }
        Ok(())
    }

    /// Terminal decision for a completed round.
    async fn decide_next(
        &self,
        agent: &MeasurementAgent,
        round: Round,
        no_results: bool,
    ) -> IrisResult<NextStep> {
        let canceled = matches!(
            self.bus.get_measurement_state(agent.measurement_uuid).await?,
            None | Some(MeasurementState::Canceled)
        );
        if canceled {
            return Ok(NextStep::Canceled);
        }
        // No replies at all: no further probes are possible.
        if no_results {
            return Ok(NextStep::Finished);
        }
        if round >= agent.tool_parameters.max_round {
            return Ok(NextStep::Finished);
        }

        let Some(measurement) = self.registry.find_measurement(agent.measurement_uuid).await?
        else {
            tracing::error!(measurement_uuid = %agent.measurement_uuid, "measurement row missing");
            return Ok(NextStep::Finished);
        };
        let tool = probing_tool(measurement.tool);
        let context = NextRoundContext {
            registry: &self.registry,
            measurement_uuid: agent.measurement_uuid,
            agent_uuid: agent.agent_uuid,
            completed_round: round,
            parameters: &agent.tool_parameters,
            ips_per_subnet: agent.agent_parameters.ips_per_subnet,
        };
        match tool.next_round(&context).await? {
            Some(probes) if !probes.is_empty() => Ok(NextStep::Dispatch(probes)),
            _ => Ok(NextStep::Finished),
        }
    }

    /// Stage the probes file (CSV, zstd) and publish the next task.
    async fn dispatch_next_round(
        &self,
        agent: &MeasurementAgent,
        next_round: Round,
        probes: Vec<ProbeSpec>,
    ) -> IrisResult<()> {
        let measurement_uuid = agent.measurement_uuid;
        let agent_uuid = agent.agent_uuid;

        let plain = self
            .settings
            .working_dir
            .join(format!("{measurement_uuid}_{agent_uuid}_next_{next_round}.csv"));
        let packed = plain.with_extension("csv.zst");
        write_probes_csv(&plain, probes).await?;
        compress::compress_file(&plain, &packed).await?;

        let probes_key = format!("{measurement_uuid}/{agent_uuid}_next_round_{next_round}.csv.zst");
        let bucket = self.common.measurement_bucket(measurement_uuid);
        self.storage.upload(&bucket, &probes_key, &packed, None).await?;

        let Some(measurement) = self.registry.find_measurement(measurement_uuid).await? else {
            tracing::error!(%measurement_uuid, "measurement row missing, not dispatching");
            return Ok(());
        };
        self.bus
            .publish_round_task(&RoundTask {
                measurement_uuid,
                agent_uuid,
                round: next_round,
                tool: measurement.tool,
                probing_rate: agent.probing_rate,
                tool_parameters: agent.tool_parameters.clone(),
                target_file_key: None,
                probes_file_key: Some(probes_key.clone()),
                username: measurement.username,
            })
            .await?;
        tracing::info!(%measurement_uuid, %agent_uuid, round = next_round, %probes_key, "dispatched next round");

        if !self.settings.debug_mode {
            for path in [&plain, &packed] {
                if let Err(err) = tokio::fs::remove_file(path).await {
                    tracing::warn!(path = %path.display(), error = %err, "could not remove staged file");
                }
            }
        }
        Ok(())
    }

    /// Once every agent of the measurement is terminal, stamp the
    /// measurement's end and drop its bus state.
    async fn finalize_if_done(&self, measurement_uuid: MeasurementId) -> IrisResult<()> {
        let agents = self.registry.all_agents(measurement_uuid).await?;
        if agents.is_empty() || !agents.iter().all(|a| a.state.is_terminal()) {
            return Ok(());
        }
        self.registry.stamp_measurement_end(measurement_uuid).await?;
        self.bus.delete_measurement_state(measurement_uuid).await?;
        tracing::info!(%measurement_uuid, "measurement finished");
        Ok(())
    }
}

enum NextStep {
    Canceled,
    Finished,
    Dispatch(Vec<ProbeSpec>),
}

/// Write a probes CSV the prober can consume as `--input-file`.
async fn write_probes_csv(path: &PathBuf, probes: Vec<ProbeSpec>) -> Result<(), PipelineError> {
    let path = path.clone();
    tokio::task::spawn_blocking(move || -> Result<(), csv::Error> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)?;
        for probe in &probes {
            writer.write_record([
                probe.destination.to_string(),
                probe.source_port.to_string(),
                probe.destination_port.to_string(),
                probe.ttl.to_string(),
                probe.protocol.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    })
    .await
    .map_err(|join| PipelineError::Compression(std::io::Error::other(join)))?
    .map_err(|err| PipelineError::Compression(std::io::Error::other(err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    #[tokio::test]
    async fn probes_csv_matches_the_input_contract() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.csv");
        write_probes_csv(
            &path,
            vec![
                ProbeSpec {
                    destination: "8.8.8.8".parse().unwrap(),
                    source_port: 24000,
                    destination_port: 33434,
                    ttl: 32,
                    protocol: Protocol::Icmp,
                },
                ProbeSpec {
                    destination: "1.1.1.1".parse().unwrap(),
                    source_port: 24001,
                    destination_port: 33434,
                    ttl: 8,
                    protocol: Protocol::Udp,
                },
            ],
        )
        .await
        .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "8.8.8.8,24000,33434,32,icmp\n1.1.1.1,24001,33434,8,udp\n"
        );
    }
}
