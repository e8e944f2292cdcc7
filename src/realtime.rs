//! Relays lifecycle events to realtime clients and routes their commands
//! back to the supervisor.
//!
//! Transport-agnostic: each connection is an unbounded queue of serialized
//! JSON envelopes, drained by whatever owns the socket.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::process::Supervisor;
use crate::state::{LifecycleEvent, LogStream, ServerStatus};

pub type ConnectionId = u64;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Subscribe {
        #[serde(rename = "serverId")]
        server_id: String,
    },
    Unsubscribe,
    Command {
        #[serde(rename = "serverId")]
        server_id: String,
        command: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound<'a> {
    Connected,
    Subscribed {
        #[serde(rename = "serverId")]
        server_id: &'a str,
    },
    Unsubscribed,
    Log {
        #[serde(rename = "serverId")]
        server_id: &'a str,
        payload: LogPayload<'a>,
        timestamp: i64,
    },
    Status {
        #[serde(rename = "serverId")]
        server_id: &'a str,
        payload: StatusPayload,
        timestamp: i64,
    },
    CommandSent {
        #[serde(rename = "serverId")]
        server_id: &'a str,
        command: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<&'static str>,
    },
}

#[derive(Debug, Serialize)]
pub struct LogPayload<'a> {
    pub stream: LogStream,
    pub line: &'a str,
}

#[derive(Debug, Serialize)]
pub struct StatusPayload {
    pub status: ServerStatus,
}

impl<'a> Outbound<'a> {
    pub fn from_event(event: &'a LifecycleEvent) -> Self {
        let timestamp = Utc::now().timestamp_millis();
        match event {
            LifecycleEvent::StatusChanged { server_id, status } => Outbound::Status {
                server_id,
                payload: StatusPayload { status: *status },
                timestamp,
            },
            LifecycleEvent::Log {
                server_id,
                stream,
                line,
            } => Outbound::Log {
                server_id,
                payload: LogPayload {
                    stream: *stream,
                    line,
                },
                timestamp,
            },
        }
    }

    fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!("Failed to serialize realtime envelope: {}", e);
                None
            }
        }
    }
}

struct Connection {
    outbox: mpsc::UnboundedSender<String>,
    subscription: Option<String>,
}

pub struct Fanout {
    supervisor: Arc<Supervisor>,
    connections: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
}

impl Fanout {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Relays every supervisor event to its subscribers until the returned
    /// task is aborted.
    pub fn spawn_relay(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.supervisor.subscribe();
        let fanout = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                fanout.publish(&event);
            }
            tracing::debug!("Realtime relay stopped");
        })
    }

    /// Registers a connection and queues its `connected` acknowledgment.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            id,
            Connection {
                outbox,
                subscription: None,
            },
        );
        self.reply(id, &Outbound::Connected);
        tracing::debug!("Realtime connection {} opened", id);
        (id, rx)
    }

    pub fn disconnect(&self, conn: ConnectionId) {
        if self.connections.remove(&conn).is_some() {
            tracing::debug!("Realtime connection {} closed", conn);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscription(&self, conn: ConnectionId) -> Option<String> {
        self.connections
            .get(&conn)
            .and_then(|c| c.subscription.clone())
    }

    /// Handles one inbound text frame. Every reply goes to `conn` only.
    pub async fn handle_message(&self, conn: ConnectionId, text: &str) {
        let message = match serde_json::from_str::<Inbound>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Malformed realtime message on {}: {}", conn, e);
                self.reply(
                    conn,
                    &Outbound::Error {
                        message: "Invalid message format".to_string(),
                        kind: None,
                    },
                );
                return;
            }
        };

        match message {
            Inbound::Subscribe { server_id } => {
                if let Some(mut c) = self.connections.get_mut(&conn) {
                    c.subscription = Some(server_id.clone());
                }
                self.reply(conn, &Outbound::Subscribed { server_id: &server_id });
            }
            Inbound::Unsubscribe => {
                if let Some(mut c) = self.connections.get_mut(&conn) {
                    c.subscription = None;
                }
                self.reply(conn, &Outbound::Unsubscribed);
            }
            Inbound::Command { server_id, command } => {
                let result = if self.supervisor.has_console(&server_id).await {
                    self.supervisor
                        .console_command(&server_id, &command)
                        .await
                        .map(Some)
                } else {
                    self.supervisor
                        .send_command(&server_id, &command)
                        .await
                        .map(|()| None)
                };
                let reply = match result {
                    Ok(response) => Outbound::CommandSent {
                        server_id: &server_id,
                        command: &command,
                        response,
                    },
                    Err(e) => Outbound::Error {
                        message: e.to_string(),
                        kind: Some(e.kind()),
                    },
                };
                self.reply(conn, &reply);
            }
        }
    }

    /// Delivers `event` to every connection subscribed to its server.
    pub fn publish(&self, event: &LifecycleEvent) {
        let Some(json) = Outbound::from_event(event).to_json() else {
            return;
        };
        let server_id = event.server_id();
        for c in self.connections.iter() {
            if c.subscription.as_deref() != Some(server_id) {
                continue;
            }
            // A closed socket's queue has no receiver left; skip it.
            let _ = c.outbox.send(json.clone());
        }
    }

    fn reply(&self, conn: ConnectionId, message: &Outbound<'_>) {
        let Some(json) = message.to_json() else {
            return;
        };
        if let Some(c) = self.connections.get(&conn) {
            let _ = c.outbox.send(json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsoleConfig, CreateServer, ProcessConfig};
    use crate::state::ServerType;
    use serde_json::Value;

    fn fanout(dir: &std::path::Path) -> (Arc<Supervisor>, Fanout) {
        let supervisor = Arc::new(Supervisor::new(
            dir,
            ProcessConfig::default(),
            ConsoleConfig::default(),
        ));
        (supervisor.clone(), Fanout::new(supervisor))
    }

    fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let text = rx.try_recv().expect("expected a queued message");
        serde_json::from_str(&text).unwrap()
    }

    fn log(server_id: &str, line: &str) -> LifecycleEvent {
        LifecycleEvent::Log {
            server_id: server_id.to_string(),
            stream: LogStream::Stdout,
            line: line.to_string(),
        }
    }

    #[tokio::test]
    async fn connect_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let (_, fanout) = fanout(dir.path());
        let (_, mut rx) = fanout.connect();
        assert_eq!(next(&mut rx)["type"], "connected");
        assert_eq!(fanout.connection_count(), 1);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe() {
        let dir = tempfile::tempdir().unwrap();
        let (_, fanout) = fanout(dir.path());
        let (conn, mut rx) = fanout.connect();
        next(&mut rx);

        fanout
            .handle_message(conn, r#"{"type":"subscribe","serverId":"a"}"#)
            .await;
        let ack = next(&mut rx);
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["serverId"], "a");
        assert_eq!(fanout.subscription(conn).as_deref(), Some("a"));

        fanout
            .handle_message(conn, r#"{"type":"subscribe","serverId":"b"}"#)
            .await;
        next(&mut rx);
        assert_eq!(fanout.subscription(conn).as_deref(), Some("b"));

        fanout.handle_message(conn, r#"{"type":"unsubscribe"}"#).await;
        assert_eq!(next(&mut rx)["type"], "unsubscribed");
        assert_eq!(fanout.subscription(conn), None);
    }

    #[tokio::test]
    async fn events_only_reach_matching_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let (_, fanout) = fanout(dir.path());
        let (a, mut rx_a) = fanout.connect();
        let (b, mut rx_b) = fanout.connect();
        let (_idle, mut rx_idle) = fanout.connect();
        next(&mut rx_a);
        next(&mut rx_b);
        next(&mut rx_idle);

        fanout
            .handle_message(a, r#"{"type":"subscribe","serverId":"server-a"}"#)
            .await;
        fanout
            .handle_message(b, r#"{"type":"subscribe","serverId":"server-b"}"#)
            .await;
        next(&mut rx_a);
        next(&mut rx_b);

        fanout.publish(&LifecycleEvent::StatusChanged {
            server_id: "server-b".to_string(),
            status: ServerStatus::Starting,
        });

        assert!(rx_a.try_recv().is_err());
        assert!(rx_idle.try_recv().is_err());
        let status = next(&mut rx_b);
        assert_eq!(status["type"], "status");
        assert_eq!(status["serverId"], "server-b");
        assert_eq!(status["payload"]["status"], "starting");
        assert!(status["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn shared_subscription_gets_identical_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (_, fanout) = fanout(dir.path());
        let (a, mut rx_a) = fanout.connect();
        let (b, mut rx_b) = fanout.connect();
        rx_a.try_recv().unwrap();
        rx_b.try_recv().unwrap();
        for conn in [a, b] {
            fanout
                .handle_message(conn, r#"{"type":"subscribe","serverId":"s"}"#)
                .await;
        }
        rx_a.try_recv().unwrap();
        rx_b.try_recv().unwrap();

        fanout.publish(&log("s", "[Server thread/INFO]: Starting minecraft server"));
        fanout.publish(&log("s", "[Server thread/INFO]: Done!"));

        let first_a = rx_a.try_recv().unwrap();
        let second_a = rx_a.try_recv().unwrap();
        assert_eq!(first_a, rx_b.try_recv().unwrap());
        assert_eq!(second_a, rx_b.try_recv().unwrap());

        let first: Value = serde_json::from_str(&first_a).unwrap();
        assert_eq!(first["type"], "log");
        assert_eq!(first["payload"]["stream"], "stdout");
        assert_eq!(
            first["payload"]["line"],
            "[Server thread/INFO]: Starting minecraft server"
        );
    }

    #[tokio::test]
    async fn malformed_message_errors_only_to_sender() {
        let dir = tempfile::tempdir().unwrap();
        let (_, fanout) = fanout(dir.path());
        let (a, mut rx_a) = fanout.connect();
        let (_b, mut rx_b) = fanout.connect();
        next(&mut rx_a);
        next(&mut rx_b);

        fanout.handle_message(a, "not json").await;
        fanout.handle_message(a, r#"{"type":"subscribe"}"#).await;
        fanout.handle_message(a, r#"{"type":"teleport"}"#).await;

        for _ in 0..3 {
            let err = next(&mut rx_a);
            assert_eq!(err["type"], "error");
            assert_eq!(err["message"], "Invalid message format");
        }
        assert!(rx_b.try_recv().is_err());
        assert_eq!(fanout.connection_count(), 2);
    }

    #[tokio::test]
    async fn command_failures_reply_to_sender() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, fanout) = fanout(dir.path());
        let created = supervisor
            .create(CreateServer::new("test", ServerType::Paper, "1.20.4"))
            .await
            .unwrap();

        let (a, mut rx_a) = fanout.connect();
        let (b, mut rx_b) = fanout.connect();
        next(&mut rx_a);
        next(&mut rx_b);
        let subscribe = format!(r#"{{"type":"subscribe","serverId":"{}"}}"#, created.id);
        fanout.handle_message(b, &subscribe).await;
        next(&mut rx_b);

        // `a` is not subscribed to anything and still gets its own replies.
        fanout
            .handle_message(a, r#"{"type":"command","serverId":"missing","command":"list"}"#)
            .await;
        let err = next(&mut rx_a);
        assert_eq!(err["type"], "error");
        assert_eq!(err["kind"], "not_found");

        let stopped = format!(
            r#"{{"type":"command","serverId":"{}","command":"list"}}"#,
            created.id
        );
        fanout.handle_message(a, &stopped).await;
        let err = next(&mut rx_a);
        assert_eq!(err["kind"], "invalid_state");

        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_connections_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (_, fanout) = fanout(dir.path());
        let (a, rx_a) = fanout.connect();
        let (b, mut rx_b) = fanout.connect();
        rx_b.try_recv().unwrap();
        for conn in [a, b] {
            fanout
                .handle_message(conn, r#"{"type":"subscribe","serverId":"s"}"#)
                .await;
        }
        rx_b.try_recv().unwrap();
        drop(rx_a);

        fanout.publish(&log("s", "still here"));
        let delivered = next(&mut rx_b);
        assert_eq!(delivered["payload"]["line"], "still here");

        fanout.disconnect(a);
        fanout.disconnect(a);
        assert_eq!(fanout.connection_count(), 1);
    }

    #[tokio::test]
    async fn relay_forwards_supervisor_events() {
        let dir = tempfile::tempdir().unwrap();
        let process = ProcessConfig {
            java_path: dir.path().join("no-such-java").display().to_string(),
            ..ProcessConfig::default()
        };
        let supervisor = Arc::new(Supervisor::new(dir.path(), process, ConsoleConfig::default()));
        let fanout = Arc::new(Fanout::new(supervisor.clone()));
        let relay = fanout.spawn_relay();

        let created = supervisor
            .create(CreateServer::new("test", ServerType::Paper, "1.20.4"))
            .await
            .unwrap();
        let (conn, mut rx) = fanout.connect();
        let subscribe = format!(r#"{{"type":"subscribe","serverId":"{}"}}"#, created.id);
        fanout.handle_message(conn, &subscribe).await;
        next(&mut rx);
        next(&mut rx);

        // The binary does not exist, so the spawn fails and is reported via events.
        supervisor.start(&created.id).await.unwrap();

        let mut received = Vec::new();
        while received.len() < 3 {
            let text = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .expect("relay timed out")
                .expect("relay closed");
            received.push(serde_json::from_str::<Value>(&text).unwrap());
        }
        assert_eq!(received[0]["payload"]["status"], "starting");
        assert_eq!(received[1]["type"], "log");
        assert_eq!(received[1]["payload"]["stream"], "agent");
        assert_eq!(received[2]["payload"]["status"], "stopped");
        assert_eq!(
            supervisor.status(&created.id).await.unwrap(),
            ServerStatus::Stopped
        );
        relay.abort();
    }
}
