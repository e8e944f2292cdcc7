//! Periodic CPU and memory sampling for running servers.
//!
//! Sampling is opt-in per server and independent of the lifecycle: a task
//! keeps ticking while its server is stopped and simply records nothing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::process::Supervisor;

pub const MAX_SAMPLES: usize = 100;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Player count and tick rate cannot be read from OS metrics, so every
/// sample carries these placeholders.
pub const PLACEHOLDER_PLAYERS: u32 = 0;
pub const PLACEHOLDER_TPS: f32 = 20.0;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatSample {
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
    /// Process CPU usage in percent of one core.
    pub cpu: f32,
    /// Resident memory in percent of total system memory.
    pub memory: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub uptime: u64,
    pub players: u32,
    pub tps: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub total_memory_bytes: u64,
}

/// Reads OS metrics for `pid`. Anything that cannot be read comes back as zero.
pub fn probe_usage(system: &mut System, pid: u32) -> ProcessUsage {
    let pid = Pid::from_u32(pid);
    system.refresh_memory();
    let total_memory_bytes = system.total_memory();
    if !system.refresh_process(pid) {
        return ProcessUsage {
            total_memory_bytes,
            ..ProcessUsage::default()
        };
    }
    match system.process(pid) {
        Some(process) => ProcessUsage {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            total_memory_bytes,
        },
        None => ProcessUsage {
            total_memory_bytes,
            ..ProcessUsage::default()
        },
    }
}

impl StatSample {
    pub fn from_usage(server_id: &str, usage: ProcessUsage, uptime: Duration) -> Self {
        let memory = if usage.total_memory_bytes > 0 {
            usage.memory_bytes as f64 / usage.total_memory_bytes as f64 * 100.0
        } else {
            0.0
        };
        Self {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
            cpu: if usage.cpu_percent.is_finite() {
                usage.cpu_percent
            } else {
                0.0
            },
            memory,
            memory_used: (usage.memory_bytes + MIB / 2) / MIB,
            memory_total: (usage.total_memory_bytes + MIB / 2) / MIB,
            uptime: uptime.as_secs(),
            players: PLACEHOLDER_PLAYERS,
            tps: PLACEHOLDER_TPS,
        }
    }
}

type History = DashMap<String, VecDeque<StatSample>>;

pub struct Monitor {
    supervisor: Arc<Supervisor>,
    interval: Duration,
    tasks: DashMap<String, JoinHandle<()>>,
    history: Arc<History>,
}

impl Monitor {
    pub fn new(supervisor: Arc<Supervisor>, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
            tasks: DashMap::new(),
            history: Arc::new(DashMap::new()),
        }
    }

    /// Starts the polling task for `id`. Does nothing if one is already running.
    pub fn start_monitoring(&self, id: &str) {
        let dashmap::mapref::entry::Entry::Vacant(slot) = self.tasks.entry(id.to_string()) else {
            return;
        };
        let task = tokio::spawn(poll(
            self.supervisor.clone(),
            self.history.clone(),
            id.to_string(),
            self.interval,
        ));
        slot.insert(task);
        tracing::info!("Started monitoring '{}' every {:?}", id, self.interval);
    }

    pub fn stop_monitoring(&self, id: &str) {
        if let Some((_, task)) = self.tasks.remove(id) {
            task.abort();
            tracing::info!("Stopped monitoring '{}'", id);
        }
    }

    pub fn is_monitoring(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Every buffered sample for `id`, oldest first.
    pub fn get_stats(&self, id: &str) -> Vec<StatSample> {
        self.history
            .get(id)
            .map(|samples| samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_latest_stats(&self, id: &str) -> Option<StatSample> {
        self.history.get(id).and_then(|samples| samples.back().cloned())
    }

    pub fn shutdown(&self) {
        for task in self.tasks.iter() {
            task.value().abort();
        }
        self.tasks.clear();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn record(history: &History, sample: StatSample) {
    let mut samples = history.entry(sample.server_id.clone()).or_default();
    push_capped(&mut samples, sample);
}

fn push_capped(samples: &mut VecDeque<StatSample>, sample: StatSample) {
    samples.push_back(sample);
    while samples.len() > MAX_SAMPLES {
        samples.pop_front();
    }
}

async fn collect(supervisor: &Supervisor, system: &mut System, id: &str) -> Option<StatSample> {
    let process = supervisor.running_process(id).await?;
    let usage = probe_usage(system, process.pid);
    Some(StatSample::from_usage(id, usage, process.uptime))
}

async fn poll(supervisor: Arc<Supervisor>, history: Arc<History>, id: String, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; samples start one period in.
    ticker.tick().await;

    // Kept across ticks so CPU usage is measured against the previous refresh.
    let mut system = System::new();
    loop {
        ticker.tick().await;
        if let Some(sample) = collect(&supervisor, &mut system, &id).await {
            record(&history, sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsoleConfig, CreateServer, ProcessConfig};
    use crate::state::ServerType;

    fn sample(id: &str, cpu: f32) -> StatSample {
        StatSample {
            server_id: id.to_string(),
            timestamp: Utc::now(),
            cpu,
            memory: 0.0,
            memory_used: 0,
            memory_total: 0,
            uptime: 0,
            players: PLACEHOLDER_PLAYERS,
            tps: PLACEHOLDER_TPS,
        }
    }

    fn monitor(dir: &std::path::Path, interval: Duration) -> (Arc<Supervisor>, Monitor) {
        let supervisor = Arc::new(Supervisor::new(
            dir,
            ProcessConfig::default(),
            ConsoleConfig::default(),
        ));
        let monitor = Monitor::new(supervisor.clone(), interval);
        (supervisor, monitor)
    }

    #[test]
    fn keeps_most_recent_hundred() {
        let history = History::new();
        for i in 0..150 {
            record(&history, sample("a", i as f32));
        }
        let samples = history.get("a").unwrap();
        assert_eq!(samples.len(), MAX_SAMPLES);
        assert_eq!(samples.front().unwrap().cpu, 50.0);
        assert_eq!(samples.back().unwrap().cpu, 149.0);
        assert!(samples
            .iter()
            .zip(samples.iter().skip(1))
            .all(|(a, b)| a.cpu < b.cpu));
    }

    #[test]
    fn histories_are_per_server() {
        let history = History::new();
        record(&history, sample("a", 1.0));
        record(&history, sample("b", 2.0));
        record(&history, sample("a", 3.0));
        assert_eq!(history.get("a").unwrap().len(), 2);
        assert_eq!(history.get("b").unwrap().len(), 1);
    }

    #[test]
    fn memory_percent_and_placeholders() {
        let usage = ProcessUsage {
            cpu_percent: 12.5,
            memory_bytes: 2048 * MIB,
            total_memory_bytes: 8192 * MIB,
        };
        let s = StatSample::from_usage("a", usage, Duration::from_secs(90));
        assert_eq!(s.memory, 25.0);
        assert_eq!(s.memory_used, 2048);
        assert_eq!(s.memory_total, 8192);
        assert_eq!(s.uptime, 90);
        assert_eq!(s.players, 0);
        assert_eq!(s.tps, 20.0);
    }

    #[test]
    fn zero_total_memory_degrades_to_zero() {
        let s = StatSample::from_usage("a", ProcessUsage::default(), Duration::ZERO);
        assert_eq!(s.memory, 0.0);
        assert_eq!(s.cpu, 0.0);
    }

    #[test]
    fn probe_of_missing_pid_is_zero() {
        let mut system = System::new();
        let usage = probe_usage(&mut system, u32::MAX - 1);
        assert_eq!(usage.cpu_percent, 0.0);
        assert_eq!(usage.memory_bytes, 0);
    }

    #[test]
    fn sample_serializes_camel_case() {
        let json = serde_json::to_value(sample("a", 1.0)).unwrap();
        assert_eq!(json["serverId"], "a");
        assert!(json.get("memoryUsed").is_some());
        assert!(json.get("memoryTotal").is_some());
        assert_eq!(json["tps"], 20.0);
    }

    #[tokio::test]
    async fn skips_servers_that_are_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, monitor) = monitor(dir.path(), Duration::from_millis(10));
        let created = supervisor
            .create(CreateServer::new("idle", ServerType::Vanilla, "1.20.4"))
            .await
            .unwrap();

        monitor.start_monitoring(&created.id);
        monitor.start_monitoring("unknown");
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(monitor.get_stats(&created.id).is_empty());
        assert!(monitor.get_latest_stats(&created.id).is_none());
        assert!(monitor.get_stats("unknown").is_empty());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_supervisor, monitor) = monitor(dir.path(), DEFAULT_INTERVAL);

        monitor.start_monitoring("a");
        monitor.start_monitoring("a");
        monitor.start_monitoring("b");
        assert!(monitor.is_monitoring("a"));
        assert_eq!(monitor.tasks.len(), 2);

        monitor.stop_monitoring("a");
        monitor.stop_monitoring("a");
        assert!(!monitor.is_monitoring("a"));
        assert!(monitor.is_monitoring("b"));
    }
}
