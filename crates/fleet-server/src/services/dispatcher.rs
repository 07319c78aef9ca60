//! Agent task dispatch
//!
//! Resolves which host serves an instance and hands session tasks to that
//! host's agent over its control connection.

use crate::services::{ConnectionManager, StreamSession};
use fleet_core::ports::InstanceDirectory;
use fleet_core::{AgentTask, ControlMessage, FleetError, Result, Route};
use std::sync::Arc;
use tracing::{debug, info};

pub struct TaskDispatcher {
    directory: Arc<dyn InstanceDirectory>,
    connections: ConnectionManager,
}

impl TaskDispatcher {
    pub fn new(directory: Arc<dyn InstanceDirectory>, connections: ConnectionManager) -> Self {
        Self {
            directory,
            connections,
        }
    }

    /// instance -> owning agent -> host identity. Looked up fresh every time.
    pub async fn resolve(&self, instance_id: &str) -> Result<Route> {
        let instance = self
            .directory
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;

        let agent = self
            .directory
            .get_agent(&instance.agent_id)
            .await?
            .ok_or_else(|| FleetError::AgentNotFound(instance.agent_id.clone()))?;

        if agent.host_id.is_empty() {
            return Err(FleetError::AgentNotFound(format!(
                "{} (no host identity)",
                agent.id
            )));
        }

        debug!(
            "Resolved instance {} -> agent {} -> host {}",
            instance_id, agent.id, agent.host_id
        );
        Ok(Route {
            instance_id: instance.id,
            agent_id: agent.id,
            host_id: agent.host_id,
        })
    }

    pub async fn is_host_online(&self, host_id: &str) -> bool {
        self.connections.has_host(host_id).await
    }

    /// Fire-and-forget hand-off of a task to the host's agent
    pub async fn queue_task(&self, host_id: &str, task: AgentTask) -> Result<()> {
        let task_id = task.task_id.clone();
        let task_type = task.task_type;
        if !self
            .connections
            .send_to_host(host_id, ControlMessage::Task(task))
            .await
        {
            return Err(FleetError::HostUnreachable(host_id.to_string()));
        }
        info!(
            task_id = %task_id,
            task_type = %task_type,
            host_id = %host_id,
            "Task queued for agent"
        );
        Ok(())
    }

    /// Queue the task that asks the agent to serve `session`
    pub async fn dispatch(&self, session: &StreamSession) -> Result<()> {
        self.queue_task(&session.host_id, task_for(session)).await
    }
}

/// Session params merged with the routing params the agent needs
pub fn task_for(session: &StreamSession) -> AgentTask {
    let mut params = session.params.clone();
    params.insert("session_id".to_string(), session.id.clone());
    if !session.container_id.is_empty() {
        params.insert("container_id".to_string(), session.container_id.clone());
    }
    if !session.image_id.is_empty() {
        params.insert("image_id".to_string(), session.image_id.clone());
    }
    AgentTask {
        task_id: session.id.clone(),
        task_type: session.operation,
        params,
    }
}
