//! In-memory platform for orchestrator tests
//!
//! Spawned "processes" are tokio tasks speaking the framed pipe protocol
//! over duplex streams. Each fake host answers the initialization
//! handshake, load and terminate commands, and a few scripted modules:
//!
//! - `ConfStore` announces the configuration store topic and answers
//!   `Query` requests with the current scripted document
//! - `Echo` subscribes to [`ECHO_TOPIC`] and records what it receives
//! - `Ping` publishes to [`ECHO_TOPIC`] for any session
//! - `PingSession<N>` publishes to [`ECHO_TOPIC`] scoped to session N

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tm_broker::platform::{ChildProcess, ContainmentGroup, Platform, SpawnRequest, SpawnedChild};
use tm_broker::{BrokerStatus, Orchestrator, OrchestratorHandle};
use tm_core::{BackoffConfig, BrokerSettings, LaunchError, PlatformError};
use tm_protocol::payload::CMD_QUERY;
use tm_protocol::topic::{format_guid, CONF_STORE_TOPIC, CONF_TOPIC, MODULE_META_TOPIC};
use tm_protocol::{
    ConfStoreRequest, HostCommand, HostInit, Message, ModuleAction, ModuleMeta, SessionSelector,
    Topic, TopicCodec,
};

/// Topic the `Echo` module subscribes to
pub const ECHO_TOPIC: Uuid = Uuid::from_u128(0x0B5E_55ED_0000_4000_8000_0000_0000_0001);

/// Upper bound on any single wait in a test
pub const WAIT: Duration = Duration::from_secs(10);

const PIPE_CAPACITY: usize = 64 * 1024;

/// A process spawn observed by the fake platform
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub group: String,
    pub pid: u32,
    pub session: u32,
    pub cross_session: bool,
    pub breakaway: bool,
}

/// A message delivered to an `Echo` module
#[derive(Debug, Clone)]
pub struct Delivery {
    pub pid: u32,
    pub session: u32,
    pub topic: Topic,
    pub payload: String,
}

#[derive(Default)]
struct Record {
    spawns: Vec<SpawnRecord>,
    loads: Vec<(u32, String)>,
    terminated: Vec<u32>,
    exited: Vec<u32>,
    deliveries: Vec<Delivery>,
    assigned: Vec<(u32, u32)>,
    controls: HashMap<u32, mpsc::UnboundedSender<Control>>,
}

enum Control {
    Publish(Message),
    /// Write bytes that do not form a valid frame
    Garbage,
}

/// Observable state shared between the fake platform and its hosts
pub struct Hosts {
    record: Mutex<Record>,
    document: Mutex<String>,
    next_pid: AtomicU32,
}

impl Hosts {
    fn lock(&self) -> std::sync::MutexGuard<'_, Record> {
        self.record.lock().unwrap()
    }

    /// Every spawn so far, in order
    pub fn spawns(&self) -> Vec<SpawnRecord> {
        self.lock().spawns.clone()
    }

    /// Spawns of one group
    pub fn spawns_of(&self, group: &str) -> Vec<SpawnRecord> {
        self.spawns().into_iter().filter(|s| s.group == group).collect()
    }

    /// Modules loaded into `pid`, in order
    pub fn loads(&self, pid: u32) -> Vec<String> {
        self.lock()
            .loads
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Whether `pid` received the terminate command
    pub fn was_terminated(&self, pid: u32) -> bool {
        self.lock().terminated.contains(&pid)
    }

    /// How many times `pid` received the terminate command
    pub fn terminations(&self, pid: u32) -> usize {
        self.lock().terminated.iter().filter(|p| **p == pid).count()
    }

    /// Whether the host task of `pid` has finished
    pub fn has_exited(&self, pid: u32) -> bool {
        self.lock().exited.contains(&pid)
    }

    /// Messages received by `Echo` modules
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.lock().deliveries.clone()
    }

    /// Containment assignments as (session, pid)
    pub fn assigned(&self) -> Vec<(u32, u32)> {
        self.lock().assigned.clone()
    }

    /// Replace the document the configuration store answers with
    pub fn set_document(&self, document: &str) {
        *self.document.lock().unwrap() = document.to_string();
    }

    /// Make the host `pid` publish the current document as a change notification
    pub fn push_document(&self, pid: u32) {
        let document = self.document.lock().unwrap().clone();
        let message = Message::new(Topic::any(CONF_TOPIC), Bytes::from(document));
        if let Some(control) = self.lock().controls.get(&pid) {
            let _ = control.send(Control::Publish(message));
        }
    }

    /// Make the host `pid` write a frame whose length cannot hold a topic
    pub fn corrupt(&self, pid: u32) {
        if let Some(control) = self.lock().controls.get(&pid) {
            let _ = control.send(Control::Garbage);
        }
    }
}

/// Platform whose processes are in-process tasks
pub struct FakePlatform {
    pub hosts: Arc<Hosts>,
    own_session: u32,
    service: bool,
    sessions: Mutex<Vec<u32>>,
    active_console: Mutex<Option<u32>>,
    /// Remaining spawn attempts to fail, per group
    failures: Mutex<HashMap<String, u32>>,
    kills: Mutex<HashMap<u32, CancellationToken>>,
}

impl FakePlatform {
    /// A non-service broker running in `own_session`
    pub fn console(own_session: u32) -> Self {
        Self::build(own_session, false, Vec::new())
    }

    /// A service broker in session 0 with the given user sessions
    pub fn service(sessions: Vec<u32>) -> Self {
        Self::build(0, true, sessions)
    }

    fn build(own_session: u32, service: bool, sessions: Vec<u32>) -> Self {
        Self {
            hosts: Arc::new(Hosts {
                record: Mutex::new(Record::default()),
                document: Mutex::new(String::new()),
                next_pid: AtomicU32::new(1000),
            }),
            own_session,
            service,
            sessions: Mutex::new(sessions),
            active_console: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            kills: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the set of interactive user sessions
    pub fn set_sessions(&self, sessions: Vec<u32>) {
        *self.sessions.lock().unwrap() = sessions;
    }

    /// Fail the next `count` spawns of `group`
    pub fn fail_spawns(&self, group: &str, count: u32) {
        self.failures.lock().unwrap().insert(group.to_string(), count);
    }

    /// Make the host `pid` die without the terminate handshake
    pub fn crash(&self, pid: u32) {
        if let Some(kill) = self.kills.lock().unwrap().get(&pid) {
            kill.cancel();
        }
    }
}

impl Platform for FakePlatform {
    fn current_session(&self) -> u32 {
        self.own_session
    }

    fn is_service(&self) -> bool {
        self.service
    }

    fn is_protected(&self) -> bool {
        false
    }

    fn interactive_sessions(&self) -> Result<Vec<u32>, PlatformError> {
        Ok(self.sessions.lock().unwrap().clone())
    }

    fn active_console_session(&self) -> Option<u32> {
        *self.active_console.lock().unwrap()
    }

    fn create_containment_group(
        &self,
        session: u32,
    ) -> Result<Box<dyn ContainmentGroup>, PlatformError> {
        Ok(Box::new(FakeGroup {
            session,
            hosts: Arc::clone(&self.hosts),
        }))
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedChild, LaunchError> {
        let group = request.args.first().cloned().unwrap_or_default();

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&group) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(LaunchError::Spawn(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "scripted spawn failure",
                    )));
                }
            }
        }

        let pid = self.hosts.next_pid.fetch_add(1, Ordering::SeqCst);
        let session = request.target_session;

        let (stdin, host_in) = tokio::io::duplex(PIPE_CAPACITY);
        let (host_out, stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (host_err, stderr) = tokio::io::duplex(PIPE_CAPACITY);

        let kill = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        {
            let mut record = self.hosts.lock();
            record.spawns.push(SpawnRecord {
                group: group.clone(),
                pid,
                session,
                cross_session: request.cross_session,
                breakaway: request.breakaway,
            });
            record.controls.insert(pid, control_tx);
        }
        self.kills.lock().unwrap().insert(pid, kill.clone());

        let host = FakeHost {
            pid,
            session,
            hosts: Arc::clone(&self.hosts),
            own_topic: None,
        };
        tokio::spawn(host.run(host_in, host_out, host_err, control_rx, kill.clone(), exited_tx));

        Ok(SpawnedChild {
            process: Box::new(FakeChild {
                pid,
                session,
                kill,
                exited: exited_rx,
            }),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }
}

struct FakeGroup {
    session: u32,
    hosts: Arc<Hosts>,
}

impl ContainmentGroup for FakeGroup {
    fn assign(&self, pid: u32) -> Result<(), PlatformError> {
        self.hosts.lock().assigned.push((self.session, pid));
        Ok(())
    }
}

struct FakeChild {
    pid: u32,
    session: u32,
    kill: CancellationToken,
    exited: watch::Receiver<bool>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn session(&self) -> u32 {
        self.session
    }

    fn resume(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        // A dropped sender also means the host task is gone
        let _ = self.exited.wait_for(|exited| *exited).await;
        Ok(Some(0))
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.kill.cancel();
        Ok(())
    }
}

struct FakeHost {
    pid: u32,
    session: u32,
    hosts: Arc<Hosts>,
    own_topic: Option<Uuid>,
}

type HostSink = FramedWrite<DuplexStream, TopicCodec>;

impl FakeHost {
    async fn run(
        mut self,
        input: DuplexStream,
        output: DuplexStream,
        stderr: DuplexStream,
        mut controls: mpsc::UnboundedReceiver<Control>,
        kill: CancellationToken,
        exited: watch::Sender<bool>,
    ) {
        let mut frames = FramedRead::new(input, TopicCodec::new());
        let mut sink = FramedWrite::new(output, TopicCodec::new());
        let pingers = CancellationToken::new();

        loop {
            tokio::select! {
                _ = kill.cancelled() => break,
                Some(control) = controls.recv() => {
                    let written = match control {
                        Control::Publish(message) => sink.send(message).await.is_ok(),
                        Control::Garbage => {
                            let output = sink.get_mut();
                            output.write_all(&[4, 0, 0, 0, 1, 2, 3, 4]).await.is_ok()
                                && output.flush().await.is_ok()
                        }
                    };
                    if !written {
                        break;
                    }
                }
                frame = frames.next() => {
                    let Some(Ok(message)) = frame else { break };
                    if !self.handle(message, &mut sink, &pingers).await {
                        break;
                    }
                }
            }
        }

        pingers.cancel();
        drop(sink);
        drop(stderr);
        self.hosts.lock().exited.push(self.pid);
        let _ = exited.send(true);
    }

    /// Returns false once the host should exit
    async fn handle(
        &mut self,
        message: Message,
        sink: &mut HostSink,
        pingers: &CancellationToken,
    ) -> bool {
        if message.topic == HostInit::topic() {
            if let Ok(init) = message.parse::<HostInit>() {
                self.own_topic = tm_protocol::parse_guid(&init.topic_id).ok();
            }
            return true;
        }

        if Some(message.topic.id) == self.own_topic {
            let Ok(command) = message.parse::<HostCommand>() else {
                return true;
            };
            if command == HostCommand::terminate() {
                self.hosts.lock().terminated.push(self.pid);
                return false;
            }
            if let Ok(Some(control)) = command.module_control() {
                if control.cmd == ModuleAction::Load {
                    self.hosts.lock().loads.push((self.pid, control.module.clone()));
                    return self.load(&control.module, sink, pingers).await;
                }
            }
            return true;
        }

        if message.topic.id == CONF_STORE_TOPIC {
            if let Ok(request) = message.parse::<ConfStoreRequest>() {
                if request.cmd == CMD_QUERY {
                    let document = self.hosts.document.lock().unwrap().clone();
                    let reply = Message::new(Topic::any(CONF_TOPIC), Bytes::from(document));
                    return sink.send(reply).await.is_ok();
                }
            }
            return true;
        }

        if message.topic.id == ECHO_TOPIC {
            self.hosts.lock().deliveries.push(Delivery {
                pid: self.pid,
                session: self.session,
                topic: message.topic,
                payload: message.text().into_owned(),
            });
        }
        true
    }

    async fn load(&self, module: &str, sink: &mut HostSink, pingers: &CancellationToken) -> bool {
        let topics = match module {
            "ConfStore" => vec![CONF_STORE_TOPIC],
            "Echo" => vec![ECHO_TOPIC],
            _ => Vec::new(),
        };

        let meta = ModuleMeta {
            pid: self.pid,
            name: module.to_string(),
            topic_ids: topics.iter().map(format_guid).collect(),
        };
        let Ok(announcement) = Message::json(Topic::any(MODULE_META_TOPIC), &meta) else {
            return false;
        };
        if sink.send(announcement).await.is_err() {
            return false;
        }

        let target = if module == "Ping" {
            Some(SessionSelector::Any)
        } else {
            module
                .strip_prefix("PingSession")
                .and_then(|n| n.parse::<u32>().ok())
                .map(SessionSelector::Id)
        };
        if let Some(session) = target {
            let hosts = Arc::clone(&self.hosts);
            let pid = self.pid;
            let stop = pingers.clone();
            let topic = Topic::new(ECHO_TOPIC, session);
            // Pings go through the control channel so they share the sink
            let control = hosts.lock().controls.get(&pid).cloned();
            if let Some(control) = control {
                tokio::spawn(async move {
                    for n in 0..200 {
                        let ping = Message::new(topic, Bytes::from(format!("ping {} from {}", n, pid)));
                        if control.send(Control::Publish(ping)).is_err() {
                            return;
                        }
                        tokio::select! {
                            _ = stop.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                        }
                    }
                });
            }
        }
        true
    }
}

/// Settings with short delays suited to tests
pub fn test_settings() -> BrokerSettings {
    let quick = BackoffConfig {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: 0.0,
    };
    BrokerSettings {
        host_dir: Some(std::path::PathBuf::from("/nonexistent/hosts")),
        terminate_timeout: Duration::from_millis(500),
        restart_backoff: quick.clone(),
        fault_backoff: quick,
        ..Default::default()
    }
}

/// A running orchestrator over a fake platform
pub struct Harness {
    pub platform: Arc<FakePlatform>,
    pub handle: OrchestratorHandle,
    pub run: tokio::task::JoinHandle<()>,
}

impl Harness {
    /// Start an orchestrator and post the initial event
    pub async fn start(platform: FakePlatform, document: &str) -> Self {
        let platform = Arc::new(platform);
        platform.hosts.set_document(document);

        let dyn_platform: Arc<dyn Platform> = platform.clone();
        let (orchestrator, handle) = Orchestrator::new(dyn_platform, test_settings());
        let run = tokio::spawn(orchestrator.run());
        handle.initialize().await.unwrap();

        Self {
            platform,
            handle,
            run,
        }
    }

    pub fn hosts(&self) -> &Hosts {
        &self.platform.hosts
    }

    /// Wait until a status snapshot satisfies `predicate`
    pub async fn wait_for(&self, what: &str, predicate: impl FnMut(&BrokerStatus) -> bool) -> BrokerStatus {
        let mut status = self.handle.status();
        let snapshot = match tokio::time::timeout(WAIT, status.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => snapshot.clone(),
            Ok(Err(_)) => panic!("orchestrator stopped while waiting for {}", what),
            Err(_) => panic!(
                "timed out waiting for {}; last status {:?}",
                what,
                *self.handle.status().borrow()
            ),
        };
        snapshot
    }

    /// Wait until `condition` holds on the fake hosts
    pub async fn eventually(&self, what: &str, mut condition: impl FnMut(&Hosts) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !condition(self.hosts()) {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Shut down and wait for the orchestrator task to finish
    pub async fn shutdown(self) -> Arc<FakePlatform> {
        self.handle.shutdown().await.unwrap();
        tokio::time::timeout(WAIT, self.run)
            .await
            .expect("orchestrator did not stop")
            .expect("orchestrator task panicked");
        self.platform
    }
}

/// Configuration document listing `entries` under `Broker.ChildProcesses`
pub fn document(entries: &[serde_json::Value]) -> String {
    serde_json::json!({ "Broker": { "ChildProcesses": entries } }).to_string()
}

/// The configuration store entry, identical to the bootstrap configuration
pub fn conf_store_entry() -> serde_json::Value {
    serde_json::json!({ "GroupName": "ConfStore", "Session": 0, "Modules": ["ConfStore"] })
}

/// A host entry in the broker's own session
pub fn entry(group: &str, modules: &[&str]) -> serde_json::Value {
    serde_json::json!({ "GroupName": group, "Modules": modules })
}

/// A host entry launched once per interactive user session
pub fn all_users_entry(group: &str, modules: &[&str]) -> serde_json::Value {
    serde_json::json!({ "GroupName": group, "Session": -1, "Modules": modules })
}
