//! Redis-backed bus: agent liveness, measurement state and task dispatch
//!
//! Keys are namespaced `agent:<uuid>:*` and `measurement:<uuid>:*`. Agent
//! liveness keys carry a TTL of five heartbeat intervals, so a crashed
//! agent disappears from the registry without explicit cleanup. Round
//! tasks and round-complete notifications travel over pub/sub channels.

use std::marker::PhantomData;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{CommonSettings, RetryPolicy};
use crate::retry::with_retry;
use crate::types::{
    AgentId, AgentParameters, AgentRegistration, AgentState, BusError, MeasurementId,
    MeasurementState, RoundComplete, RoundTask,
};

/// Liveness keys survive this many missed heartbeats.
pub const TTL_HEARTBEATS: u32 = 5;

/// Channel carrying round-complete notifications for the worker.
pub const RESULTS_CHANNEL: &str = "controller:results";

/// Channel carrying round tasks for one agent.
pub fn agent_tasks_channel(agent_uuid: AgentId) -> String {
    format!("agent:{agent_uuid}:tasks")
}

fn parameters_key(agent_uuid: AgentId) -> String {
    format!("agent:{agent_uuid}:parameters")
}

fn state_key(agent_uuid: AgentId) -> String {
    format!("agent:{agent_uuid}:state")
}

fn heartbeat_key(agent_uuid: AgentId) -> String {
    format!("agent:{agent_uuid}:heartbeat")
}

fn measurement_state_key(measurement_uuid: MeasurementId) -> String {
    format!("measurement:{measurement_uuid}:state")
}

/// Typed client over the shared key/value + pub/sub substrate
#[derive(Clone)]
pub struct Bus {
    client: redis::Client,
    connection: MultiplexedConnection,
    retry: RetryPolicy,
}

impl Bus {
    pub async fn connect(settings: &CommonSettings) -> Result<Self, BusError> {
        let client = redis::Client::open(settings.redis_url.as_str())?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            client,
            connection,
            retry: settings.retry.clone(),
        })
    }

    async fn set_json<T: Serialize>(
        &self,
        key: String,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_string(value).expect("bus values are serializable");
        with_retry(&self.retry, "bus set", |_| true, || {
            let mut connection = self.connection.clone();
            let key = key.clone();
            let payload = payload.clone();
            async move {
                let outcome: redis::RedisResult<()> = match ttl {
                    Some(ttl) => {
                        connection
                            .set_ex(&key, &payload, ttl.as_secs().max(1))
                            .await
                    }
                    None => connection.set(&key, &payload).await,
                };
                outcome
            }
        })
        .await
        .map_err(BusError::Connection)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>, BusError> {
        let payload: Option<String> = with_retry(&self.retry, "bus get", |_| true, || {
            let mut connection = self.connection.clone();
            let key = key.clone();
            async move {
                let outcome: redis::RedisResult<Option<String>> = connection.get(&key).await;
                outcome
            }
        })
        .await
        .map_err(BusError::Connection)?;
        match payload {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| BusError::MalformedPayload {
                    channel: key,
                    reason: e.to_string(),
                }),
        }
    }

    /// Register a live agent: parameters, `Idle` state, zeroed heartbeat,
    /// all under the liveness TTL.
    pub async fn register_agent(
        &self,
        agent_uuid: AgentId,
        parameters: &AgentParameters,
        heartbeat_interval: Duration,
    ) -> Result<(), BusError> {
        let ttl = heartbeat_interval * TTL_HEARTBEATS;
        self.set_json(parameters_key(agent_uuid), parameters, Some(ttl))
            .await?;
        self.set_json(state_key(agent_uuid), &AgentState::Idle, Some(ttl))
            .await?;
        self.set_json(heartbeat_key(agent_uuid), &0u64, Some(ttl))
            .await
    }

    /// Bump the heartbeat counter and refresh every liveness key.
    pub async fn heartbeat(
        &self,
        agent_uuid: AgentId,
        heartbeat_interval: Duration,
    ) -> Result<u64, BusError> {
        let ttl = (heartbeat_interval * TTL_HEARTBEATS).as_secs().max(1) as i64;
        let mut connection = self.connection.clone();
        let count: u64 = connection.incr(heartbeat_key(agent_uuid), 1u64).await?;
        for key in [
            parameters_key(agent_uuid),
            state_key(agent_uuid),
            heartbeat_key(agent_uuid),
        ] {
            let _: bool = connection.expire(&key, ttl).await?;
        }
        Ok(count)
    }

    /// Clean shutdown: remove the registration immediately.
    pub async fn deregister_agent(&self, agent_uuid: AgentId) -> Result<(), BusError> {
        let mut connection = self.connection.clone();
        let _: () = connection
            .del(&[
                parameters_key(agent_uuid),
                state_key(agent_uuid),
                heartbeat_key(agent_uuid),
            ])
            .await?;
        Ok(())
    }

    pub async fn set_agent_parameters(
        &self,
        agent_uuid: AgentId,
        parameters: &AgentParameters,
        heartbeat_interval: Duration,
    ) -> Result<(), BusError> {
        let ttl = heartbeat_interval * TTL_HEARTBEATS;
        self.set_json(parameters_key(agent_uuid), parameters, Some(ttl))
            .await
    }

    pub async fn set_agent_state(
        &self,
        agent_uuid: AgentId,
        state: AgentState,
        heartbeat_interval: Duration,
    ) -> Result<(), BusError> {
        let ttl = heartbeat_interval * TTL_HEARTBEATS;
        self.set_json(state_key(agent_uuid), &state, Some(ttl)).await
    }

    /// The live registration of one agent, if present on the bus.
    pub async fn get_agent_registration(
        &self,
        agent_uuid: AgentId,
    ) -> Result<Option<AgentRegistration>, BusError> {
        let parameters: Option<AgentParameters> =
            self.get_json(parameters_key(agent_uuid)).await?;
        let Some(parameters) = parameters else {
            return Ok(None);
        };
        let state: Option<AgentState> = self.get_json(state_key(agent_uuid)).await?;
        let heartbeat: Option<u64> = self.get_json(heartbeat_key(agent_uuid)).await?;
        Ok(Some(AgentRegistration {
            agent_uuid,
            parameters,
            state: state.unwrap_or_default(),
            heartbeat: heartbeat.unwrap_or(0),
        }))
    }

    /// Agents currently registered on the bus.
    pub async fn list_agents(&self) -> Result<Vec<AgentId>, BusError> {
        let mut connection = self.connection.clone();
        let keys: Vec<String> = connection.keys("agent:*:parameters").await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.split(':').nth(1))
            .filter_map(|raw| raw.parse().ok())
            .map(AgentId)
            .collect())
    }

    pub async fn get_measurement_state(
        &self,
        measurement_uuid: MeasurementId,
    ) -> Result<Option<MeasurementState>, BusError> {
        self.get_json(measurement_state_key(measurement_uuid)).await
    }

    pub async fn set_measurement_state(
        &self,
        measurement_uuid: MeasurementId,
        state: MeasurementState,
    ) -> Result<(), BusError> {
        self.set_json(measurement_state_key(measurement_uuid), &state, None)
            .await
    }

    pub async fn delete_measurement_state(
        &self,
        measurement_uuid: MeasurementId,
    ) -> Result<(), BusError> {
        let mut connection = self.connection.clone();
        let _: () = connection
            .del(measurement_state_key(measurement_uuid))
            .await?;
        Ok(())
    }

    async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> Result<(), BusError> {
        let payload = serde_json::to_string(message).expect("bus messages are serializable");
        with_retry(&self.retry, "bus publish", |_| true, || {
            let mut connection = self.connection.clone();
            let payload = payload.clone();
            async move {
                let outcome: redis::RedisResult<i64> = connection.publish(channel, &payload).await;
                outcome.map(|_| ())
            }
        })
        .await
        .map_err(BusError::Connection)
    }

    /// Dispatch a round task to its agent.
    pub async fn publish_round_task(&self, task: &RoundTask) -> Result<(), BusError> {
        self.publish(&agent_tasks_channel(task.agent_uuid), task)
            .await
    }

    /// Notify the worker that a round ended.
    pub async fn publish_round_complete(
        &self,
        complete: &RoundComplete,
    ) -> Result<(), BusError> {
        self.publish(RESULTS_CHANNEL, complete).await
    }

    /// Subscribe to this agent's task channel.
    pub async fn subscribe_round_tasks(
        &self,
        agent_uuid: AgentId,
    ) -> Result<Subscription<RoundTask>, BusError> {
        Subscription::open(&self.client, agent_tasks_channel(agent_uuid)).await
    }

    /// Subscribe to round-complete notifications.
    pub async fn subscribe_round_completes(
        &self,
    ) -> Result<Subscription<RoundComplete>, BusError> {
        Subscription::open(&self.client, RESULTS_CHANNEL.to_string()).await
    }
}

/// A typed pub/sub subscription on a dedicated connection
pub struct Subscription<T> {
    pubsub: redis::aio::PubSub,
    channel: String,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> Subscription<T> {
    async fn open(client: &redis::Client, channel: String) -> Result<Self, BusError> {
        let mut pubsub = client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(&channel).await?;
        Ok(Self {
            pubsub,
            channel,
            _marker: PhantomData,
        })
    }

    /// The next message on the channel. Malformed payloads are surfaced
    /// as errors so callers can log and keep consuming.
    pub async fn next(&mut self) -> Result<T, BusError> {
        let message = self.pubsub.on_message().next().await.ok_or_else(|| {
            BusError::Connection(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "subscription stream ended",
            )))
        })?;
        let payload: String = message.get_payload()?;
        serde_json::from_str(&payload).map_err(|e| BusError::MalformedPayload {
            channel: self.channel.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn keys_are_namespaced_by_identity() {
        let agent = AgentId(Uuid::nil());
        let measurement = MeasurementId(Uuid::nil());
        let nil = "00000000-0000-0000-0000-000000000000";
        assert_eq!(parameters_key(agent), format!("agent:{nil}:parameters"));
        assert_eq!(state_key(agent), format!("agent:{nil}:state"));
        assert_eq!(
            measurement_state_key(measurement),
            format!("measurement:{nil}:state")
        );
        assert_eq!(agent_tasks_channel(agent), format!("agent:{nil}:tasks"));
    }
}
