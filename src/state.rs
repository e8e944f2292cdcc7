use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::monitor::Monitor;
use crate::process::Supervisor;
use crate::realtime::Fanout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Vanilla,
    Paper,
    Spigot,
    Forge,
    Fabric,
}

impl ServerType {
    pub const ALL: [ServerType; 5] = [
        ServerType::Vanilla,
        ServerType::Paper,
        ServerType::Spigot,
        ServerType::Forge,
        ServerType::Fabric,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServerType::Vanilla => "vanilla",
            ServerType::Paper => "paper",
            ServerType::Spigot => "spigot",
            ServerType::Forge => "forge",
            ServerType::Fabric => "fabric",
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states: `stopped -> starting -> running -> stopping -> stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted part of an instance. Runtime state lives in the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: ServerType,
    pub version: String,
    pub path: PathBuf,
    pub port: u16,
    pub max_memory: String,
    pub created_at: DateTime<Utc>,
}

impl ServerRecord {
    pub fn jar_path(&self) -> PathBuf {
        self.path
            .join(format!("server-{}-{}.jar", self.server_type, self.version))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: ServerType,
    pub version: String,
    pub port: u16,
    pub status: ServerStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDetail {
    #[serde(flatten)]
    pub summary: ServerSummary,
    pub max_memory: String,
}

impl ServerRecord {
    pub fn summary(&self, status: ServerStatus) -> ServerSummary {
        ServerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            server_type: self.server_type,
            version: self.version.clone(),
            port: self.port,
            status,
            created_at: self.created_at,
        }
    }

    pub fn detail(&self, status: ServerStatus) -> ServerDetail {
        ServerDetail {
            summary: self.summary(status),
            max_memory: self.max_memory.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines produced by the agent itself, such as the exit notice.
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    StatusChanged {
        server_id: String,
        status: ServerStatus,
    },
    Log {
        server_id: String,
        stream: LogStream,
        line: String,
    },
}

impl LifecycleEvent {
    pub fn server_id(&self) -> &str {
        match self {
            LifecycleEvent::StatusChanged { server_id, .. } => server_id,
            LifecycleEvent::Log { server_id, .. } => server_id,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub supervisor: Arc<Supervisor>,
    pub monitor: Arc<Monitor>,
    pub fanout: Arc<Fanout>,
}

impl AppState {
    pub fn new(config: Config, supervisor: Arc<Supervisor>) -> Self {
        let monitor = Arc::new(Monitor::new(supervisor.clone(), config.monitor.interval()));
        let fanout = Arc::new(Fanout::new(supervisor.clone()));
        Self {
            config: Arc::new(config),
            supervisor,
            monitor,
            fanout,
        }
    }
}
