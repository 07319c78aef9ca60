//! Fleet inventory lookups used for routing

use crate::Result;
use async_trait::async_trait;
use fleet_types::{AgentRecord, Instance};

/// Read access to the instance/agent inventory
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>>;
    async fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>>;
    async fn touch_agent(&self, id: &str) -> Result<()>;
}
