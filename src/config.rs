use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::state::ServerType;

pub const CONFIG_PATH_ENV: &str = "LATTICE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

pub const DEFAULT_PORT: u16 = 25565;
pub const DEFAULT_MAX_MEMORY: &str = "2G";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind_address: String,
    pub data_directory: PathBuf,
    pub public_directory: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            data_directory: PathBuf::from("servers"),
            public_directory: PathBuf::from("public"),
        }
    }
}

/// How server processes are launched and torn down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub java_path: String,
    pub min_memory: String,
    /// Time a server gets to exit on its own after the `stop` command.
    pub stop_grace_ms: u64,
    /// Time between SIGTERM and SIGKILL once the grace period has elapsed.
    pub kill_grace_ms: u64,
    pub restart_delay_ms: u64,
    pub readiness_markers: Vec<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            java_path: "java".to_string(),
            min_memory: "512M".to_string(),
            stop_grace_ms: 30_000,
            kill_grace_ms: 5_000,
            restart_delay_ms: 2_000,
            readiness_markers: vec!["Done!".to_string(), "For help, type \"help\"".to_string()],
        }
    }
}

impl ProcessConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000 }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Remote console settings written into each server's properties and used
/// when attaching a console session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub host: String,
    pub port_offset: u16,
    pub password: String,
    pub timeout_ms: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port_offset: 10,
            password: "lattice".to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl ConsoleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn port_for(&self, server_port: u16) -> u16 {
        server_port.saturating_add(self.port_offset)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
}

pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub async fn load_config(path: &Path) -> anyhow::Result<Config> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: Config = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Ok(Config::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Writes `value` as pretty JSON next to `path`, fsyncs, then renames over it.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&json).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await
}

/// Body of a create request, before defaults are applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServer {
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: ServerType,
    pub version: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub max_memory: Option<String>,
}

impl CreateServer {
    pub fn new(name: impl Into<String>, server_type: ServerType, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_type,
            version: version.into(),
            port: None,
            max_memory: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn max_memory(&self) -> &str {
        self.max_memory.as_deref().unwrap_or(DEFAULT_MAX_MEMORY)
    }
}

/// Checks a create request. `port_offset` is the console port offset, which
/// must still land on a valid port.
pub fn validate_create(req: &CreateServer, port_offset: u16) -> Result<()> {
    // The name ends up in server.properties, one property per line.
    if req.name.chars().any(char::is_control) {
        return Err(Error::InvalidConfig(
            "name must not contain control characters".to_string(),
        ));
    }
    let name_len = req.name.trim().chars().count();
    if name_len == 0 || name_len > 64 {
        return Err(Error::InvalidConfig("name must be 1 to 64 characters".to_string()));
    }
    let version = req.version.trim();
    if version.is_empty() {
        return Err(Error::InvalidConfig("version must not be empty".to_string()));
    }
    if version.chars().any(char::is_control) {
        return Err(Error::InvalidConfig(
            "version must not contain control characters".to_string(),
        ));
    }
    // The version is part of the jar file name.
    if version.contains("..") || version.contains('/') || version.contains('\\') {
        return Err(Error::InvalidConfig(
            "version must not contain '..', '/' or '\\'".to_string(),
        ));
    }
    let max_port = u16::MAX - port_offset;
    if req.port() < 1024 || req.port() > max_port {
        return Err(Error::InvalidConfig(format!(
            "port must be between 1024 and {max_port}"
        )));
    }
    if !is_memory_size(req.max_memory()) {
        return Err(Error::InvalidConfig(
            "maxMemory must look like 512M or 2G".to_string(),
        ));
    }
    Ok(())
}

/// JVM heap size syntax: digits with an optional K, M or G suffix.
pub fn is_memory_size(value: &str) -> bool {
    let digits = value.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    let suffix_len = value.len() - digits.len();
    suffix_len <= 1
        && !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && digits.bytes().any(|b| b != b'0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config =
            serde_json::from_str(r#"{"process": {"java_path": "/opt/java/bin/java"}}"#).unwrap();
        assert_eq!(config.process.java_path, "/opt/java/bin/java");
        assert_eq!(config.process.stop_grace_ms, 30_000);
        assert_eq!(config.monitor.interval_ms, 5_000);
        assert_eq!(config.console.port_for(25565), 25575);
        assert_eq!(config.agent.bind_address, "0.0.0.0:3000");
    }

    #[test]
    fn create_defaults() {
        let req = CreateServer::new("test", ServerType::Paper, "1.20.4");
        assert_eq!(req.port(), 25565);
        assert_eq!(req.max_memory(), "2G");
        assert!(validate_create(&req, 10).is_ok());
    }

    #[test]
    fn rejects_bad_requests() {
        let mut req = CreateServer::new("", ServerType::Vanilla, "1.20.4");
        assert!(matches!(validate_create(&req, 10), Err(Error::InvalidConfig(_))));

        req.name = "x".repeat(65);
        assert!(validate_create(&req, 10).is_err());

        req.name = "ok".into();
        req.version = "../1.20".into();
        assert!(validate_create(&req, 10).is_err());

        req.version = "1.20.4".into();
        req.port = Some(80);
        assert!(validate_create(&req, 10).is_err());

        req.port = Some(25570);
        req.max_memory = Some("lots".into());
        assert!(validate_create(&req, 10).is_err());
    }

    #[test]
    fn name_cannot_inject_properties() {
        let mut req = CreateServer::new(
            "x\nrcon.password=owned\nonline-mode=false",
            ServerType::Paper,
            "1.20.4",
        );
        assert!(matches!(validate_create(&req, 10), Err(Error::InvalidConfig(_))));

        req.name = "tab\tname".into();
        assert!(validate_create(&req, 10).is_err());

        req.name = "   ".into();
        assert!(matches!(validate_create(&req, 10), Err(Error::InvalidConfig(_))));

        req.name = "  lobby  ".into();
        assert!(validate_create(&req, 10).is_ok());

        req.version = "1.20.4\nmotd=x".into();
        assert!(validate_create(&req, 10).is_err());
    }

    #[test]
    fn console_port_must_fit() {
        let mut req = CreateServer::new("edge", ServerType::Vanilla, "1.20.4");
        req.port = Some(65535);
        assert!(validate_create(&req, 10).is_err());
        req.port = Some(65526);
        assert!(validate_create(&req, 10).is_err());
        req.port = Some(65525);
        assert!(validate_create(&req, 10).is_ok());
        req.port = Some(65535);
        assert!(validate_create(&req, 0).is_ok());
    }

    #[test]
    fn memory_sizes() {
        assert!(is_memory_size("2G"));
        assert!(is_memory_size("512M"));
        assert!(is_memory_size("1048576"));
        assert!(!is_memory_size("0G"));
        assert!(!is_memory_size("G"));
        assert!(!is_memory_size("2GG"));
        assert!(!is_memory_size("2.5G"));
    }

    #[test]
    fn create_request_uses_camel_case() {
        let req: CreateServer = serde_json::from_str(
            r#"{"name":"lobby","type":"fabric","version":"1.21","maxMemory":"4G"}"#,
        )
        .unwrap();
        assert_eq!(req.server_type, ServerType::Fabric);
        assert_eq!(req.max_memory(), "4G");
    }

    #[tokio::test]
    async fn atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        write_json_atomic(&path, &vec![1, 2, 3]).await.unwrap();
        write_json_atomic(&path, &vec![4]).await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Vec<u32> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, vec![4]);
        assert!(!dir.path().join("servers.json.tmp").exists());
    }
}
