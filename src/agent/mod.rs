//! Agent measurement loop
//!
//! An agent advertises itself on the bus, consumes round tasks one at a
//! time, stages the round's inputs (generated probe stream or downloaded
//! probes file), supervises the prober, uploads the results and publishes
//! a round-complete notification for the worker.

use std::path::PathBuf;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::config::{AgentSettings, CommonSettings};
use crate::probes::{GenerationParams, ProbeGenerator};
use crate::storage::{Storage, DELETED};
use crate::targets::{
    validate_probes_file, validate_target_file, TargetFileKind, TargetRow,
};
use crate::types::{
    AgentParameters, AgentState, IrisResult, MeasurementState, RoundComplete, RoundOutcome,
    RoundTask,
};

pub mod prober;

use prober::{run_prober, ProberCommand, ProberOutcome};

/// Agent process: registration, heartbeat and the round loop
pub struct Agent {
    settings: AgentSettings,
    common: CommonSettings,
    bus: Bus,
    storage: Storage,
}

/// Staged inputs of one round, plus the files to clean up afterwards
struct StagedInput {
    stdin: Option<ProbeGenerator>,
    input_file: Option<PathBuf>,
    /// BGP prefixes file handed to the prober's prefix filter.
    prefix_filter: Option<PathBuf>,
    downloaded_target: Option<PathBuf>,
    /// Local path and remote key of a consumed probes file.
    downloaded_probes: Option<(PathBuf, String)>,
}

impl Agent {
    pub async fn new(settings: AgentSettings, common: CommonSettings) -> IrisResult<Self> {
        let bus = Bus::connect(&common).await?;
        let storage = Storage::connect(&common).await;
        Ok(Self {
            settings,
            common,
            bus,
            storage,
        })
    }

    /// The capabilities advertised on the bus.
    pub fn parameters(&self) -> AgentParameters {
        AgentParameters {
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ip_address: self.settings.ip_address,
            max_probing_rate: self.settings.max_probing_rate,
            ips_per_subnet: self.settings.ips_per_subnet,
            min_ttl: self.settings.min_ttl,
            max_ttl: self.settings.max_ttl,
        }
    }

    /// Register, heartbeat and serve round tasks until the bus goes away.
    pub async fn run(&self) -> IrisResult<()> {
        tokio::fs::create_dir_all(&self.settings.results_dir).await?;
        tokio::fs::create_dir_all(&self.settings.targets_dir).await?;

        let agent_uuid = self.settings.agent_uuid;
        self.bus
            .register_agent(agent_uuid, &self.parameters(), self.settings.heartbeat_interval)
            .await?;
        tracing::info!(%agent_uuid, "agent registered");

        let heartbeat = self.spawn_heartbeat();
        let mut tasks = self.bus.subscribe_round_tasks(agent_uuid).await?;
        loop {
            match tasks.next().await {
                Ok(task) => {
                    if let Err(err) = self.handle_round_task(&task).await {
                        tracing::error!(
                            measurement_uuid = %task.measurement_uuid,
                            round = task.round,
                            error = %err,
                            "round failed"
                        );
                    }
                }
                Err(crate::types::BusError::MalformedPayload { channel, reason }) => {
                    tracing::warn!(%channel, %reason, "ignoring malformed round task");
                }
                Err(err) => {
                    heartbeat.abort();
                    return Err(err.into());
                }
            }
        }
    }

    /// Remove the bus registration on clean shutdown.
    pub async fn deregister(&self) -> IrisResult<()> {
        self.bus.deregister_agent(self.settings.agent_uuid).await?;
        Ok(())
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let agent_uuid = self.settings.agent_uuid;
        let interval = self.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = bus.heartbeat(agent_uuid, interval).await {
                    tracing::warn!(error = %err, "heartbeat failed");
                }
            }
        })
    }

    /// Execute one round task, advertising `Working` for its duration.
    pub async fn handle_round_task(&self, task: &RoundTask) -> IrisResult<()> {
        if task.agent_uuid != self.settings.agent_uuid {
            tracing::error!(
                expected = %self.settings.agent_uuid,
                received = %task.agent_uuid,
                "round task for a different agent"
            );
            return Ok(());
        }
        self.bus
            .set_agent_state(
                task.agent_uuid,
                AgentState::Working,
                self.settings.heartbeat_interval,
            )
            .await?;
        let result = self.execute_round(task).await;
        self.bus
            .set_agent_state(
                task.agent_uuid,
                AgentState::Idle,
                self.settings.heartbeat_interval,
            )
            .await?;
        result
    }

    async fn execute_round(&self, task: &RoundTask) -> IrisResult<()> {
        let measurement_uuid = task.measurement_uuid;
        let agent_uuid = task.agent_uuid;
        tracing::info!(
            %measurement_uuid,
            %agent_uuid,
            round = task.round,
            tool = %task.tool,
            protocol = %task.tool_parameters.protocol,
            "starting round"
        );

        let measurement_dir = self.settings.results_dir.join(measurement_uuid.to_string());
        tokio::fs::create_dir_all(&measurement_dir).await?;
        let result_filename = format!("{agent_uuid}_results_{}.csv", task.round);
        let results_path = measurement_dir.join(&result_filename);

        let mut staged = match self.stage_inputs(task).await {
            Ok(staged) => staged,
            Err(err) => {
                tracing::error!(
                    %measurement_uuid,
                    round = task.round,
                    error = %err,
                    "input staging failed, round not started"
                );
                self.publish_complete(task, RoundOutcome::AgentFailure).await?;
                self.remove_dir_quietly(&measurement_dir).await;
                return Ok(());
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let stopper = self.spawn_stopper(measurement_uuid, cancel_tx);

        let command = ProberCommand {
            prober_path: self.settings.prober_path.clone(),
            output_path: results_path.clone(),
            probing_rate: effective_probing_rate(
                task.probing_rate,
                self.settings.max_probing_rate,
            ),
            protocol: task.tool_parameters.protocol,
            min_ttl: task.tool_parameters.min_ttl.max(self.settings.min_ttl),
            max_ttl: task.tool_parameters.max_ttl.min(self.settings.max_ttl),
            round: task.round,
            input_file: staged.input_file.clone(),
            prefix_filter_file: staged.prefix_filter.clone(),
            n_packets: task.tool_parameters.n_packets,
            no_sleep: self.settings.no_sleep,
            debug: self.settings.debug_mode,
        };

        let stdin = staged.stdin.take();
        let outcome = run_prober(
            &command,
            stdin,
            cancel_rx,
            self.settings.termination_grace,
        )
        .await;
        stopper.abort();

        match outcome {
            Ok(ProberOutcome::Completed) => {
                let bucket = self.common.measurement_bucket(measurement_uuid);
                let result_key = format!("{measurement_uuid}/{result_filename}");
                self.storage
                    .upload(&bucket, &result_key, &results_path, None)
                    .await?;
                tracing::info!(%measurement_uuid, round = task.round, %result_key, "results uploaded");
                self.publish_complete(task, RoundOutcome::Completed { result_key })
                    .await?;
            }
            Ok(ProberOutcome::Canceled) => {
                tracing::warn!(%measurement_uuid, round = task.round, "round canceled");
                self.publish_complete(task, RoundOutcome::Canceled).await?;
            }
            Ok(ProberOutcome::Failed { code }) => {
                tracing::error!(%measurement_uuid, round = task.round, code, "prober failed");
                self.publish_complete(task, RoundOutcome::AgentFailure).await?;
            }
            Err(err) => {
                tracing::error!(%measurement_uuid, round = task.round, error = %err, "prober error");
                self.publish_complete(task, RoundOutcome::AgentFailure).await?;
            }
        }

        self.cleanup_round(task, staged, &results_path, &measurement_dir)
            .await;
        Ok(())
    }

    /// Watch the measurement's bus state and raise the cancellation signal
    /// when the record disappears or turns canceled.
    fn spawn_stopper(
        &self,
        measurement_uuid: crate::types::MeasurementId,
        cancel: watch::Sender<bool>,
    ) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let refresh = self.settings.stopper_refresh;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(refresh).await;
                match bus.get_measurement_state(measurement_uuid).await {
                    Ok(Some(MeasurementState::Ongoing)) => {}
                    Ok(None) | Ok(Some(MeasurementState::Canceled)) => {
                        tracing::warn!(%measurement_uuid, "measurement canceled");
                        let _ = cancel.send(true);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(%measurement_uuid, error = %err, "stopper poll failed");
                    }
                }
            }
        })
    }

    async fn stage_inputs(&self, task: &RoundTask) -> IrisResult<StagedInput> {
        let mut staged = StagedInput {
            stdin: None,
            input_file: None,
            prefix_filter: None,
            downloaded_target: None,
            downloaded_probes: None,
        };

        if task.round > 1 {
            let key = task
                .probes_file_key
                .clone()
                .ok_or(crate::types::ValidationError::MissingProbesFile)?;
            let filename = key.replace('/', "_");
            let path = self.settings.targets_dir.join(filename);
            let bucket = self.common.measurement_bucket(task.measurement_uuid);
            self.storage.download(&bucket, &key, &path).await?;
            tracing::info!(%key, "downloaded probes file");
            staged.input_file = Some(path.clone());
            staged.downloaded_probes = Some((path, key));
            return Ok(staged);
        }

        match &task.target_file_key {
            None => {
                tracing::info!("full snapshot requested");
                staged = full_snapshot_input(&self.settings, task);
            }
            Some(key) => {
                let bucket = self.common.targets_bucket(&task.username);
                let info = self.storage.head(&bucket, key).await?;
                let kind = TargetFileKind::from_metadata(&info.metadata)?;
                let path = self.settings.targets_dir.join(key.replace('/', "_"));
                self.storage.download(&bucket, key, &path).await?;
                staged.downloaded_target = Some(path.clone());
                let content = tokio::fs::read_to_string(&path).await?;

                match kind {
                    TargetFileKind::TargetsList => {
                        let rows = validate_target_file(&content, kind)?;
                        // One destination, one flow: a custom mapper could
                        // still vary the port here, but no mapper is wired
                        // at this call site.
                        staged.stdin = Some(ProbeGenerator::new(
                            rows,
                            GenerationParams {
                                prefix_len_v4: 32,
                                prefix_len_v6: 128,
                                min_flow: 0,
                                max_flow: 0,
                                destination_port: task.tool_parameters.destination_port,
                                source_port_base: self.settings.source_port_base,
                                mapper: None,
                            },
                        ));
                    }
                    TargetFileKind::PrefixesList => {
                        let rows = validate_target_file(&content, kind)?;
                        staged.stdin = Some(ProbeGenerator::new(
                            rows,
                            GenerationParams {
                                prefix_len_v4: 24,
                                prefix_len_v6: 64,
                                min_flow: 0,
                                max_flow: self.settings.ips_per_subnet,
                                destination_port: task.tool_parameters.destination_port,
                                source_port_base: self.settings.source_port_base,
                                mapper: Some(task.tool_parameters.flow_mapper),
                            },
                        ));
                    }
                    TargetFileKind::Probes => {
                        validate_probes_file(&content)?;
                        staged.input_file = Some(path);
                    }
                }
            }
        }
        Ok(staged)
    }

    async fn publish_complete(&self, task: &RoundTask, outcome: RoundOutcome) -> IrisResult<()> {
        self.bus
            .publish_round_complete(&RoundComplete {
                measurement_uuid: task.measurement_uuid,
                agent_uuid: task.agent_uuid,
                round: task.round,
                outcome,
            })
            .await?;
        Ok(())
    }

    /// Local and remote cleanup after a round. Filesystem errors are
    /// logged, never fatal.
    async fn cleanup_round(
        &self,
        task: &RoundTask,
        staged: StagedInput,
        results_path: &std::path::Path,
        measurement_dir: &std::path::Path,
    ) {
        if !self.settings.debug_mode {
            self.remove_file_quietly(results_path).await;
            self.remove_dir_quietly(measurement_dir).await;
        }
        if let Some(path) = &staged.downloaded_target {
            self.remove_file_quietly(path).await;
        }
        if let Some((path, key)) = &staged.downloaded_probes {
            if !self.settings.debug_mode {
                self.remove_file_quietly(path).await;
            }
            // The probes file was consumed whether or not the round made
            // it to the end.
            let bucket = self.common.measurement_bucket(task.measurement_uuid);
            let status = self.storage.delete_no_check(&bucket, key).await;
            if status != DELETED {
                tracing::error!(%key, status, "could not remove consumed probes file");
            }
        }
    }

    async fn remove_file_quietly(&self, path: &std::path::Path) {
        if let Err(err) = tokio::fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "could not remove file");
            }
        }
    }

    async fn remove_dir_quietly(&self, path: &std::path::Path) {
        if let Err(err) = tokio::fs::remove_dir(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "could not remove directory");
            }
        }
    }
}

/// Staged inputs for an exhaustive snapshot of the whole v4 Internet:
/// a generated probe stream over `0.0.0.0/0` plus the configured BGP
/// prefixes file for the prober's prefix filter.
fn full_snapshot_input(settings: &AgentSettings, task: &RoundTask) -> StagedInput {
    let row = TargetRow {
        prefix: "0.0.0.0/0".parse().expect("constant prefix"),
        protocol: task.tool_parameters.protocol,
        min_ttl: task.tool_parameters.min_ttl,
        max_ttl: task.tool_parameters.max_ttl,
    };
    StagedInput {
        stdin: Some(ProbeGenerator::new(
            vec![row],
            GenerationParams {
                prefix_len_v4: 24,
                prefix_len_v6: 64,
                min_flow: 0,
                max_flow: settings.ips_per_subnet.saturating_sub(1),
                destination_port: task.tool_parameters.destination_port,
                source_port_base: settings.source_port_base,
                mapper: Some(task.tool_parameters.flow_mapper),
            },
        )),
        input_file: None,
        prefix_filter: settings.prefix_filter_file.clone(),
        downloaded_target: None,
        downloaded_probes: None,
    }
}

/// Probing rate ceiling applied to a task, exposed for request validation.
pub fn effective_probing_rate(requested: Option<u32>, advertised_max: u32) -> u32 {
    requested.unwrap_or(advertised_max).min(advertised_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MeasurementId, Tool, ToolParameters};
    use std::path::Path;

    #[test]
    fn probing_rate_is_capped_by_the_agent() {
        assert_eq!(effective_probing_rate(None, 1000), 1000);
        assert_eq!(effective_probing_rate(Some(100), 1000), 100);
        assert_eq!(effective_probing_rate(Some(5000), 1000), 1000);
    }

    #[test]
    fn full_snapshot_staging_wires_the_prefix_filter_file() {
        let mut settings = AgentSettings::default();
        settings.prefix_filter_file = Some(PathBuf::from("/etc/iris/bgp-prefixes.txt"));
        let task = RoundTask {
            measurement_uuid: MeasurementId::new(),
            agent_uuid: settings.agent_uuid,
            round: 1,
            tool: Tool::DiamondMiner,
            probing_rate: None,
            tool_parameters: ToolParameters::default(),
            target_file_key: None,
            probes_file_key: None,
            username: "admin".to_string(),
        };
        let staged = full_snapshot_input(&settings, &task);
        assert_eq!(
            staged.prefix_filter.as_deref(),
            Some(Path::new("/etc/iris/bgp-prefixes.txt"))
        );
        assert!(staged.stdin.is_some());
        assert!(staged.input_file.is_none());
        assert!(staged.downloaded_target.is_none());
    }
}
