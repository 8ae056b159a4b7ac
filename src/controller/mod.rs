//! Controller façade consumed by the external HTTP API
//!
//! Accepts measurement requests, snapshots the participating agents'
//! advertised parameters, seeds round 1 and owns measurement-level
//! cancellation and deletion.

use crate::bus::Bus;
use crate::config::CommonSettings;
use crate::registry::Registry;
use crate::storage::Storage;
use crate::types::{
    AgentState, BusError, IrisResult, Measurement, MeasurementAgent, MeasurementId,
    MeasurementRequest, MeasurementState, RoundTask,
};

/// Control-plane entry point for measurement lifecycle operations
pub struct Controller {
    common: CommonSettings,
    bus: Bus,
    storage: Storage,
    registry: Registry,
}

impl Controller {
    pub async fn new(common: CommonSettings) -> IrisResult<Self> {
        let bus = Bus::connect(&common).await?;
        let storage = Storage::connect(&common).await;
        let registry = Registry::connect(&common);
        registry.create_tables(false).await?;
        Ok(Self {
            common,
            bus,
            storage,
            registry,
        })
    }

    /// Accept a measurement: persist it, register every participating
    /// agent with a snapshot of its advertised parameters, create the
    /// measurement bucket, mark the bus state `Ongoing` and dispatch
    /// round 1 to each agent.
    ///
    /// Every requested agent must be live on the bus and in a known
    /// state; otherwise the request is rejected before any state change.
    pub async fn register_measurement(
        &self,
        request: &MeasurementRequest,
    ) -> IrisResult<Vec<RoundTask>> {
        let mut registrations = Vec::with_capacity(request.agents.len());
        for section in &request.agents {
            let registration = self
                .bus
                .get_agent_registration(section.agent_uuid)
                .await?
                .ok_or(BusError::AgentNotRegistered {
                    agent_uuid: section.agent_uuid,
                })?;
            if registration.state == AgentState::Unknown {
                return Err(BusError::AgentNotRegistered {
                    agent_uuid: section.agent_uuid,
                }
                .into());
            }
            registrations.push(registration);
        }

        self.registry.register_measurement(request).await?;
        self.storage
            .create_bucket(&self.common.measurement_bucket(request.measurement_uuid))
            .await?;
        self.bus
            .set_measurement_state(request.measurement_uuid, MeasurementState::Ongoing)
            .await?;

        let mut tasks = Vec::with_capacity(registrations.len());
        for registration in registrations {
            let section = request
                .agent(registration.agent_uuid)
                .expect("registration comes from the request");
            self.registry
                .register_agent(request, registration.agent_uuid, &registration.parameters)
                .await?;
            let task = RoundTask {
                measurement_uuid: request.measurement_uuid,
                agent_uuid: registration.agent_uuid,
                round: 1,
                tool: request.tool,
                probing_rate: section.probing_rate,
                tool_parameters: section.tool_parameters.clone(),
                target_file_key: section.target_file_key.clone(),
                probes_file_key: None,
                username: request.username.clone(),
            };
            self.bus.publish_round_task(&task).await?;
            tasks.push(task);
        }
        tracing::info!(
            measurement_uuid = %request.measurement_uuid,
            agents = tasks.len(),
            tool = %request.tool,
            "measurement registered"
        );
        Ok(tasks)
    }

    /// Cancel a measurement: the agents' stoppers pick the state change
    /// up within one refresh interval.
    pub async fn cancel_measurement(&self, measurement_uuid: MeasurementId) -> IrisResult<()> {
        self.bus
            .set_measurement_state(measurement_uuid, MeasurementState::Canceled)
            .await?;
        tracing::info!(%measurement_uuid, "measurement canceled");
        Ok(())
    }

    pub async fn measurement(
        &self,
        username: &str,
        measurement_uuid: MeasurementId,
    ) -> IrisResult<Option<Measurement>> {
        Ok(self
            .registry
            .get_measurement(username, measurement_uuid)
            .await?)
    }

    /// Per-agent view of one measurement.
    pub async fn measurement_status(
        &self,
        measurement_uuid: MeasurementId,
    ) -> IrisResult<Vec<MeasurementAgent>> {
        Ok(self.registry.all_agents(measurement_uuid).await?)
    }

    /// Delete a measurement: per-run results tables, the measurement
    /// bucket and the bus state all go away.
    pub async fn delete_measurement(&self, measurement_uuid: MeasurementId) -> IrisResult<()> {
        for agent in self.registry.all_agents(measurement_uuid).await? {
            self.registry
                .drop_results_table(measurement_uuid, agent.agent_uuid)
                .await?;
        }
        let bucket = self.common.measurement_bucket(measurement_uuid);
        for object in self.storage.list(&bucket).await.unwrap_or_default() {
            self.storage.delete_no_check(&bucket, &object.key).await;
        }
        if let Err(err) = self.storage.delete_bucket(&bucket).await {
            tracing::warn!(%bucket, error = %err, "could not delete measurement bucket");
        }
        self.bus.delete_measurement_state(measurement_uuid).await?;
        tracing::info!(%measurement_uuid, "measurement deleted");
        Ok(())
    }
}
