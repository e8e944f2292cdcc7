use dashmap::DashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{self, ConsoleConfig, CreateServer, ProcessConfig};
use crate::error::{Error, Result};
use crate::rcon::RconClient;
use crate::state::{
    LifecycleEvent, LogStream, ServerDetail, ServerRecord, ServerStatus, ServerSummary,
};

const REGISTRY_FILE: &str = "servers.json";
/// How long output readers get to flush after the process has exited.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Owns every server instance and is the only writer of their status and
/// process handles.
pub struct Supervisor {
    servers_dir: PathBuf,
    process: ProcessConfig,
    console: ConsoleConfig,
    servers: DashMap<String, Arc<ManagedServer>>,
    events: EventBus,
    generation: AtomicU64,
}

struct ManagedServer {
    record: ServerRecord,
    runtime: Mutex<Runtime>,
    console: Mutex<Option<RconClient>>,
}

#[derive(Default)]
struct Runtime {
    status: ServerStatus,
    process: Option<ProcessHandle>,
}

struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    started_at: Instant,
    stdin: Arc<Mutex<ChildStdin>>,
    exited: watch::Receiver<bool>,
    kill: Option<oneshot::Sender<()>>,
}

/// Hands lifecycle events to every subscriber in emission order. Each
/// subscriber owns an unbounded queue, so a slow reader never loses a
/// status transition.
#[derive(Clone, Default)]
struct EventBus {
    subscribers: Arc<DashMap<u64, mpsc::UnboundedSender<LifecycleEvent>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        rx
    }

    fn send(&self, event: LifecycleEvent) {
        // Subscribers whose receiver is gone are dropped here.
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

/// What the monitor is allowed to see of a running process.
#[derive(Debug, Clone, Copy)]
pub struct RunningProcess {
    pub pid: u32,
    pub uptime: Duration,
}

impl Supervisor {
    pub fn new(servers_dir: impl Into<PathBuf>, process: ProcessConfig, console: ConsoleConfig) -> Self {
        Self {
            servers_dir: servers_dir.into(),
            process,
            console,
            servers: DashMap::new(),
            events: EventBus::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Builds a supervisor and reloads the instances saved in `servers_dir`.
    pub async fn load(
        servers_dir: impl Into<PathBuf>,
        process: ProcessConfig,
        console: ConsoleConfig,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let supervisor = Self::new(servers_dir, process, console);
        tokio::fs::create_dir_all(&supervisor.servers_dir)
            .await
            .with_context(|| format!("Failed to create {}", supervisor.servers_dir.display()))?;

        let path = supervisor.registry_path();
        let records: Vec<ServerRecord> = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        for record in records {
            supervisor.insert(record);
        }
        tracing::info!("Loaded {} server(s) from {}", supervisor.servers.len(), path.display());
        Ok(supervisor)
    }

    /// Every lifecycle event emitted from now on, in emission order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.servers.contains_key(id)
    }

    pub async fn list(&self) -> Vec<ServerSummary> {
        let servers: Vec<Arc<ManagedServer>> =
            self.servers.iter().map(|s| s.value().clone()).collect();
        let mut result = Vec::with_capacity(servers.len());
        for server in servers {
            let status = server.runtime.lock().await.status;
            result.push(server.record.summary(status));
        }
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        result
    }

    pub async fn get(&self, id: &str) -> Result<ServerDetail> {
        let server = self.entry(id)?;
        let status = server.runtime.lock().await.status;
        Ok(server.record.detail(status))
    }

    pub async fn status(&self, id: &str) -> Result<ServerStatus> {
        let server = self.entry(id)?;
        let status = server.runtime.lock().await.status;
        Ok(status)
    }

    /// Pid and uptime of the instance, only while it is `running`.
    pub async fn running_process(&self, id: &str) -> Option<RunningProcess> {
        let server = self.entry(id).ok()?;
        let runtime = server.runtime.lock().await;
        if runtime.status != ServerStatus::Running {
            return None;
        }
        let process = runtime.process.as_ref()?;
        Some(RunningProcess {
            pid: process.pid?,
            uptime: process.started_at.elapsed(),
        })
    }

    /// Instance roots, used to find orphans left behind by a previous run.
    pub fn server_roots(&self) -> Vec<PathBuf> {
        self.servers.iter().map(|s| s.record.path.clone()).collect()
    }

    pub async fn create(&self, req: CreateServer) -> Result<ServerSummary> {
        config::validate_create(&req, self.console.port_offset)?;

        let id = uuid::Uuid::new_v4().to_string();
        let record = ServerRecord {
            path: self.servers_dir.join(&id),
            id,
            name: req.name.trim().to_string(),
            server_type: req.server_type,
            version: req.version.trim().to_string(),
            port: req.port(),
            max_memory: req.max_memory().to_string(),
            created_at: chrono::Utc::now(),
        };

        tokio::fs::create_dir_all(record.path.join("world")).await?;
        tokio::fs::write(record.path.join("eula.txt"), "eula=true\n").await?;
        tokio::fs::write(
            record.path.join("server.properties"),
            self.server_properties(&record),
        )
        .await?;

        let summary = record.summary(ServerStatus::Stopped);
        self.insert(record);
        self.save_registry().await?;
        tracing::info!("Created server '{}' ({})", summary.name, summary.id);
        Ok(summary)
    }

    fn server_properties(&self, record: &ServerRecord) -> String {
        format!(
            "server-port={port}\n\
             motd=Lattice Server - {name}\n\
             max-players=20\n\
             online-mode=true\n\
             enable-rcon=true\n\
             rcon.port={rcon_port}\n\
             rcon.password={password}\n",
            port = record.port,
            name = record.name,
            rcon_port = self.console.port_for(record.port),
            password = self.console.password,
        )
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let server = self.entry(id)?;
        let mut runtime = server.runtime.lock().await;
        if runtime.status != ServerStatus::Stopped || runtime.process.is_some() {
            return Err(Error::InvalidState {
                id: id.to_string(),
                status: runtime.status,
                action: "start",
            });
        }
        self.set_status(&server.record.id, &mut runtime, ServerStatus::Starting);

        let mut child = match self.launch_command(&server.record).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to spawn server '{}': {}", id, e);
                self.emit_log(id, LogStream::Agent, format!("Failed to start server: {e}"));
                self.set_status(id, &mut runtime, ServerStatus::Stopped);
                return Ok(());
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            self.emit_log(id, LogStream::Agent, "Failed to attach to server output".to_string());
            self.set_status(id, &mut runtime, ServerStatus::Stopped);
            return Ok(());
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let pid = child.id();
        let (exit_tx, exited) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();

        let stdout_task = tokio::spawn(pump_output(
            server.clone(),
            self.events.clone(),
            generation,
            LogStream::Stdout,
            stdout,
            self.process.readiness_markers.clone(),
        ));
        let stderr_task = tokio::spawn(pump_output(
            server.clone(),
            self.events.clone(),
            generation,
            LogStream::Stderr,
            stderr,
            Vec::new(),
        ));
        tokio::spawn(watch_exit(
            server.clone(),
            self.events.clone(),
            generation,
            child,
            kill_rx,
            exit_tx,
            [stdout_task, stderr_task],
        ));

        runtime.process = Some(ProcessHandle {
            generation,
            pid,
            started_at: Instant::now(),
            stdin: Arc::new(Mutex::new(stdin)),
            exited,
            kill: Some(kill_tx),
        });

        tracing::info!("Started server '{}' with PID {:?}", id, pid);
        Ok(())
    }

    fn launch_command(&self, record: &ServerRecord) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.process.java_path);
        cmd.arg(format!("-Xmx{}", record.max_memory))
            .arg(format!("-Xms{}", self.process.min_memory))
            .arg("-jar")
            .arg(record.jar_path())
            .arg("nogui")
            .current_dir(&record.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        let server = self.entry(id)?;
        let (stdin, mut exited, pid, kill) = {
            let mut runtime = server.runtime.lock().await;
            if runtime.status != ServerStatus::Running {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    status: runtime.status,
                    action: "stop",
                });
            }
            let Some(process) = runtime.process.as_mut() else {
                return Err(Error::NotRunning(id.to_string()));
            };
            let parts = (
                process.stdin.clone(),
                process.exited.clone(),
                process.pid,
                process.kill.take(),
            );
            self.set_status(id, &mut runtime, ServerStatus::Stopping);
            parts
        };

        let deadline = Instant::now() + self.process.stop_grace();
        if let Err(e) = self.deliver_stop(&server, &stdin).await {
            tracing::warn!("Failed to send stop command to '{}': {}", id, e);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if wait_for_exit(&mut exited, remaining).await {
            tracing::info!("Stopped server '{}'", id);
            return Ok(());
        }
        tracing::warn!(
            "Server '{}' did not exit within {:?}, terminating",
            id,
            self.process.stop_grace()
        );

        if let Some(pid) = pid {
            match send_sigterm(pid) {
                Ok(()) => {
                    if wait_for_exit(&mut exited, self.process.kill_grace()).await {
                        tracing::info!("Stopped server '{}' after SIGTERM", id);
                        return Ok(());
                    }
                }
                Err(e) => tracing::warn!("Server '{}': {}", id, e),
            }
        }

        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        let _ = exited.wait_for(|done| *done).await;
        tracing::warn!("Killed server '{}'", id);
        Ok(())
    }

    /// Sends `stop` exactly once: over the attached console if there is one,
    /// stdin otherwise. Stdin is only used when the console frame could not be
    /// written.
    async fn deliver_stop(&self, server: &ManagedServer, stdin: &Mutex<ChildStdin>) -> Result<()> {
        {
            let mut console = server.console.lock().await;
            if let Some(client) = console.as_mut() {
                match client.dispatch("stop").await {
                    Ok(request) => {
                        // A stopping server may close the session instead of answering.
                        if let Err(e) = client.read_response(request).await {
                            tracing::debug!(
                                "No console reply to stop from '{}': {}",
                                server.record.id,
                                e
                            );
                        }
                        if !client.is_connected() {
                            *console = None;
                        }
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Console stop failed for '{}', falling back to stdin: {}",
                            server.record.id,
                            e
                        );
                        client.disconnect().await;
                        *console = None;
                    }
                }
            }
        }
        write_line(stdin, "stop").await
    }

    pub async fn restart(&self, id: &str) -> Result<()> {
        self.stop(id).await?;
        tokio::time::sleep(self.process.restart_delay()).await;
        self.start(id).await
    }

    /// Writes one line to the server's stdin. Nothing is read back.
    pub async fn send_command(&self, id: &str, command: &str) -> Result<()> {
        let server = self.entry(id)?;
        let stdin = {
            let runtime = server.runtime.lock().await;
            runtime
                .process
                .as_ref()
                .map(|p| p.stdin.clone())
                .ok_or_else(|| Error::NotRunning(id.to_string()))?
        };
        write_line(&stdin, command).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let server = self.entry(id)?;
        let (status, exited, kill) = {
            let mut runtime = server.runtime.lock().await;
            let exited = runtime.process.as_ref().map(|p| p.exited.clone());
            let kill = if runtime.status == ServerStatus::Starting {
                runtime.process.as_mut().and_then(|p| p.kill.take())
            } else {
                None
            };
            (runtime.status, exited, kill)
        };

        match status {
            ServerStatus::Stopped => {}
            ServerStatus::Running => self.stop(id).await?,
            ServerStatus::Starting | ServerStatus::Stopping => {
                if let Some(kill) = kill {
                    let _ = kill.send(());
                }
                if let Some(mut exited) = exited {
                    let _ = exited.wait_for(|done| *done).await;
                }
            }
        }

        self.detach_console(id).await?;
        match tokio::fs::remove_dir_all(&server.record.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        self.servers.remove(id);
        self.save_registry().await?;
        tracing::info!("Deleted server '{}'", id);
        Ok(())
    }

    /// Opens a console session to the server's RCON port and makes it the
    /// preferred command channel.
    pub async fn attach_console(&self, id: &str) -> Result<()> {
        let server = self.entry(id)?;
        let port = self.console.port_for(server.record.port);
        let client = RconClient::connect_with_timeout(
            &self.console.host,
            port,
            &self.console.password,
            self.console.timeout(),
        )
        .await?;

        let previous = server.console.lock().await.replace(client);
        if let Some(mut previous) = previous {
            previous.disconnect().await;
        }
        tracing::info!("Attached console to '{}' on port {}", id, port);
        Ok(())
    }

    pub async fn detach_console(&self, id: &str) -> Result<()> {
        let server = self.entry(id)?;
        let client = server.console.lock().await.take();
        if let Some(mut client) = client {
            client.disconnect().await;
            tracing::info!("Detached console from '{}'", id);
        }
        Ok(())
    }

    pub async fn has_console(&self, id: &str) -> bool {
        match self.entry(id) {
            Ok(server) => server.console.lock().await.is_some(),
            Err(_) => false,
        }
    }

    /// Runs a command over the attached console and returns its reply.
    pub async fn console_command(&self, id: &str, command: &str) -> Result<String> {
        let server = self.entry(id)?;
        let mut console = server.console.lock().await;
        let client = console.as_mut().ok_or(Error::NotConnected)?;
        let result = client.send_command(command).await;
        if !client.is_connected() {
            *console = None;
        }
        result
    }

    /// Stops every running instance; used on host shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.servers.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            match self.status(&id).await {
                Ok(ServerStatus::Running) => {
                    if let Err(e) = self.stop(&id).await {
                        tracing::warn!("Failed to stop '{}' during shutdown: {}", id, e);
                    }
                }
                Ok(ServerStatus::Starting) => {
                    if let Err(e) = self.kill(&id).await {
                        tracing::warn!("Failed to kill '{}' during shutdown: {}", id, e);
                    }
                }
                _ => {}
            }
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let server = self.entry(id)?;
        let (kill, exited) = {
            let mut runtime = server.runtime.lock().await;
            match runtime.process.as_mut() {
                Some(p) => (p.kill.take(), Some(p.exited.clone())),
                None => (None, None),
            }
        };
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        if let Some(mut exited) = exited {
            let _ = exited.wait_for(|done| *done).await;
        }
        Ok(())
    }

    fn entry(&self, id: &str) -> Result<Arc<ManagedServer>> {
        self.servers
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn insert(&self, record: ServerRecord) {
        let id = record.id.clone();
        self.servers.insert(
            id,
            Arc::new(ManagedServer {
                record,
                runtime: Mutex::new(Runtime::default()),
                console: Mutex::new(None),
            }),
        );
    }

    fn registry_path(&self) -> PathBuf {
        self.servers_dir.join(REGISTRY_FILE)
    }

    async fn save_registry(&self) -> Result<()> {
        let mut records: Vec<ServerRecord> =
            self.servers.iter().map(|s| s.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tokio::fs::create_dir_all(&self.servers_dir).await?;
        config::write_json_atomic(&self.registry_path(), &records).await?;
        Ok(())
    }

    fn set_status(&self, id: &str, runtime: &mut Runtime, status: ServerStatus) {
        set_status(&self.events, id, runtime, status);
    }

    fn emit_log(&self, id: &str, stream: LogStream, line: String) {
        emit_log(&self.events, id, stream, line);
    }
}

/// Status only changes under the instance lock, so per-server status events
/// leave in the same order the transitions happened.
fn set_status(events: &EventBus, id: &str, runtime: &mut Runtime, status: ServerStatus) {
    runtime.status = status;
    events.send(LifecycleEvent::StatusChanged {
        server_id: id.to_string(),
        status,
    });
}

fn emit_log(events: &EventBus, id: &str, stream: LogStream, line: String) {
    events.send(LifecycleEvent::Log {
        server_id: id.to_string(),
        stream,
        line,
    });
}

async fn write_line(stdin: &Mutex<ChildStdin>, line: &str) -> Result<()> {
    let mut stdin = stdin.lock().await;
    stdin.write_all(format!("{line}\n").as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

/// Sends SIGTERM to exactly `pid`. A process that is already gone counts as
/// signalled.
#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;

    // 0 and negative values address process groups, not a single process.
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Err(Error::Process(format!("refusing to signal pid {pid}"))),
    };
    match signal::kill(NixPid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Process(format!("SIGTERM to pid {pid} failed: {e}"))),
    }
}

#[cfg(not(unix))]
fn send_sigterm(pid: u32) -> Result<()> {
    Err(Error::Process(format!(
        "SIGTERM is not available on this platform (pid {pid})"
    )))
}

async fn wait_for_exit(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    // A dropped sender means the exit watcher is gone, which only happens
    // after it has published the exit.
    tokio::time::timeout(limit, exited.wait_for(|done| *done))
        .await
        .is_ok()
}

pub fn is_ready_line(line: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| line.contains(m.as_str()))
}

async fn pump_output<R>(
    server: Arc<ManagedServer>,
    events: EventBus,
    generation: u64,
    stream: LogStream,
    output: R,
    readiness_markers: Vec<String>,
) where
    R: AsyncRead + Unpin,
{
    let id = server.record.id.as_str();
    let mut lines = BufReader::new(output).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Output reader for '{}' stopped: {}", id, e);
                break;
            }
        };
        let ready = is_ready_line(&line, &readiness_markers);
        emit_log(&events, id, stream, line);

        if ready {
            let mut runtime = server.runtime.lock().await;
            let current = runtime.process.as_ref().map(|p| p.generation);
            if runtime.status == ServerStatus::Starting && current == Some(generation) {
                set_status(&events, id, &mut runtime, ServerStatus::Running);
                tracing::info!("Server '{}' is ready", id);
            }
        }
    }
}

async fn watch_exit(
    server: Arc<ManagedServer>,
    events: EventBus,
    generation: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<bool>,
    mut readers: [JoinHandle<()>; 2],
) {
    let id = server.record.id.as_str();
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!("Failed to kill server '{}': {}", id, e);
            }
            child.wait().await
        }
    };

    let drained = tokio::time::timeout(OUTPUT_DRAIN, async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        for reader in &readers {
            reader.abort();
        }
    }

    {
        let mut runtime = server.runtime.lock().await;
        if runtime.process.as_ref().map(|p| p.generation) == Some(generation) {
            runtime.process = None;
            set_status(&events, id, &mut runtime, ServerStatus::Stopped);
            emit_log(&events, id, LogStream::Agent, exit_line(&status));
        }
    }

    let console = server.console.lock().await.take();
    if let Some(mut console) = console {
        console.disconnect().await;
    }

    tracing::info!("Server '{}' exited: {}", id, exit_line(&status));
    let _ = exit_tx.send(true);
}

fn exit_line(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("Server stopped with code {code}"),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return format!("Server stopped by signal {signal}");
                    }
                }
                "Server stopped".to_string()
            }
        },
        Err(e) => format!("Server stopped, exit status unknown: {e}"),
    }
}

/// Kills `java` processes left running in one of `roots` by a previous run.
pub async fn kill_orphaned_servers(roots: &[PathBuf]) {
    if roots.is_empty() {
        return;
    }
    let sys = System::new_all();
    let mut killed = 0;
    for (pid, process) in sys.processes() {
        let is_java = process.cmd().iter().any(|c| c.contains("java"))
            || process.name().contains("java");
        if !is_java {
            continue;
        }
        let Some(cwd) = process.cwd() else { continue };
        if roots.iter().any(|root| root.as_path() == cwd) {
            tracing::warn!("Found orphaned server in {} (PID {}), killing it", cwd.display(), pid);
            process.kill();
            killed += 1;
        }
    }
    if killed > 0 {
        // Give them a moment to exit
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
