//! Shared fixtures for unit and handler tests

use crate::config::{RecordingConfig, ServerConfig, SessionConfig, TerminalConfig};
use crate::metrics::StreamMetrics;
use crate::services::{
    stream_adapter, ConnectionManager, PrincipalKind, SessionRegistry, TaskDispatcher,
};
use crate::storage::Database;
use crate::{build_router, AppState};
use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use fleet_core::ports::InstanceDirectory;
use fleet_core::{AgentFrame, AgentRecord, AgentTask, ControlMessage, FleetError, Instance};
use futures::SinkExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const INSTANCE_ID: &str = "inst-1";
pub const AGENT_ID: &str = "agent-1";
pub const HOST_ID: &str = "host-1";

/// Instance whose agent row is missing
pub const ORPHAN_INSTANCE_ID: &str = "inst-orphan";

/// Instance whose host has no control connection
pub const OFFLINE_INSTANCE_ID: &str = "inst-offline";
pub const OFFLINE_AGENT_ID: &str = "agent-offline";
pub const OFFLINE_HOST_ID: &str = "host-offline";

pub const DATA_CAPACITY: usize = 8;
pub const INPUT_CAPACITY: usize = 4;

pub fn session_config() -> SessionConfig {
    SessionConfig {
        ttl_secs: 60,
        sweep_interval_secs: 1,
        ready_timeout_ms: 300,
        data_capacity: DATA_CAPACITY,
        input_capacity: INPUT_CAPACITY,
        input_send_timeout_ms: 100,
    }
}

/// Short timings so terminal timeouts fire within a test
pub fn server_config(dir: &Path) -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        public_url: "ws://fleet.test".to_string(),
        data_dir: dir.to_path_buf(),
        jwt_secret: "test-secret".to_string(),
        sessions: session_config(),
        terminal: TerminalConfig {
            heartbeat_interval_ms: 50,
            inactivity_timeout_ms: 500,
        },
        recording: RecordingConfig::default(),
        ..ServerConfig::default()
    }
}

/// In-memory inventory: one online instance, one orphan, one offline
pub struct StaticDirectory {
    instances: HashMap<String, Instance>,
    agents: HashMap<String, AgentRecord>,
}

impl StaticDirectory {
    pub fn fleet() -> Self {
        let instance = |id: &str, agent_id: &str| Instance {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            name: id.to_string(),
        };
        let agent = |id: &str, host_id: &str| AgentRecord {
            id: id.to_string(),
            host_id: host_id.to_string(),
            name: id.to_string(),
            last_seen: Utc::now(),
        };

        let instances = [
            instance(INSTANCE_ID, AGENT_ID),
            instance(ORPHAN_INSTANCE_ID, "agent-ghost"),
            instance(OFFLINE_INSTANCE_ID, OFFLINE_AGENT_ID),
        ];
        let agents = [
            agent(AGENT_ID, HOST_ID),
            agent(OFFLINE_AGENT_ID, OFFLINE_HOST_ID),
        ];
        Self {
            instances: instances.into_iter().map(|i| (i.id.clone(), i)).collect(),
            agents: agents.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }
}

#[async_trait]
impl InstanceDirectory for StaticDirectory {
    async fn get_instance(&self, id: &str) -> fleet_core::Result<Option<Instance>> {
        Ok(self.instances.get(id).cloned())
    }

    async fn get_agent(&self, id: &str) -> fleet_core::Result<Option<AgentRecord>> {
        Ok(self.agents.get(id).cloned())
    }

    async fn touch_agent(&self, id: &str) -> fleet_core::Result<()> {
        if self.agents.contains_key(id) {
            Ok(())
        } else {
            Err(FleetError::AgentNotFound(id.to_string()))
        }
    }
}

/// Register a control connection for `HOST_ID` that the test reads from
async fn fake_host(connections: &ConnectionManager) -> mpsc::UnboundedReceiver<ControlMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    connections.register_host(HOST_ID, "fake-conn", tx).await;
    rx
}

/// Registry over the static inventory. `HOST_ID` stays online while the
/// returned receiver is alive.
pub async fn registry() -> (Arc<SessionRegistry>, mpsc::UnboundedReceiver<ControlMessage>) {
    let connections = ConnectionManager::new();
    let agent = fake_host(&connections).await;
    let dispatcher = Arc::new(TaskDispatcher::new(
        Arc::new(StaticDirectory::fleet()),
        connections,
    ));
    let registry = Arc::new(SessionRegistry::new(
        dispatcher,
        session_config(),
        Arc::new(StreamMetrics::new()),
    ));
    (registry, agent)
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    /// Control channel of the fake `HOST_ID` connection
    pub agent: mpsc::UnboundedReceiver<ControlMessage>,
    pub user_token: String,
}

/// Full application over a seeded database in `dir`
pub async fn app(dir: &Path) -> TestApp {
    app_with_config(server_config(dir)).await
}

pub async fn app_with_config(config: ServerConfig) -> TestApp {
    let db = Database::new(&config.database_path()).await.unwrap();
    db.upsert_agent(AGENT_ID, HOST_ID, "agent one").await.unwrap();
    db.upsert_agent(OFFLINE_AGENT_ID, OFFLINE_HOST_ID, "agent offline")
        .await
        .unwrap();
    db.upsert_instance(INSTANCE_ID, AGENT_ID, "web").await.unwrap();
    db.upsert_instance(ORPHAN_INSTANCE_ID, "agent-ghost", "orphan")
        .await
        .unwrap();
    db.upsert_instance(OFFLINE_INSTANCE_ID, OFFLINE_AGENT_ID, "db")
        .await
        .unwrap();

    let state = AppState::new(config, Arc::new(db));
    let agent = fake_host(&state.connections).await;
    let router = build_router(state.clone());
    let user_token = state
        .auth_service
        .issue_token("u1", "alice", PrincipalKind::User, chrono::Duration::hours(1))
        .unwrap();

    TestApp {
        state,
        router,
        agent,
        user_token,
    }
}

pub fn agent_token(state: &AppState, agent_id: &str) -> String {
    state
        .auth_service
        .issue_token(agent_id, agent_id, PrincipalKind::Agent, chrono::Duration::hours(1))
        .unwrap()
}

/// Serve the router on an ephemeral port
pub async fn spawn_app(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Play the agent side of the next queued task: attach, report ready and
/// replay `frames` into the session.
pub fn serve_next_task(
    state: &AppState,
    mut agent: mpsc::UnboundedReceiver<ControlMessage>,
    frames: Vec<AgentFrame>,
) -> JoinHandle<AgentTask> {
    let registry = state.registry.clone();
    tokio::spawn(async move {
        let task = loop {
            match agent.recv().await {
                Some(ControlMessage::Task(task)) => break task,
                Some(_) => continue,
                None => panic!("control channel closed before a task arrived"),
            }
        };
        let session = registry.get(&task.task_id).unwrap();
        assert!(session.try_attach());
        session.mark_ready();

        let frames_in = futures::stream::iter(frames.into_iter().map(Ok));
        let frames_out = futures::sink::drain().sink_map_err(|e| match e {});
        stream_adapter::run(session, frames_in, frames_out).await;
        task
    })
}
