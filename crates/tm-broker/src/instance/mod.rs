//! Host process instances
//!
//! A [`ChildProcessInstance`] owns one host process: its three pipes, the
//! reader/dispatcher pair on stdout, the stderr forwarder, and a
//! keep-alive watcher that reports unexpected exits to the orchestrator.
//! Instances are owned and driven exclusively by the orchestrator task;
//! the only way back is the event channel held in [`InstanceContext`].

mod stderr;

pub use stderr::{parse_line, HostLevel};

use std::fmt;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tm_core::{BrokerSettings, ChildProcessConfig, LaunchError, TransportError};
use tm_protocol::{HostCommand, HostInit, Message, ModuleControl, SessionSelector, Topic};

use crate::backoff::ExponentialBackoff;
use crate::orchestrator::{DesiredInstance, Event};
use crate::platform::{ChildProcess, ContainmentGroups, Platform, SpawnRequest, SpawnedChild};
use crate::transport::{start_read, PipeWriter, ReadHandle};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of an instance, unique for the broker's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wrap a raw id
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Why a launch was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchReason {
    /// Reconciliation wants the instance running; no-op if it already is
    ApplyConfig,
    /// The previous process exited unexpectedly
    Restart,
}

/// Result of publishing to an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Frame written to the host's input pipe
    Sent,
    /// Topic is scoped to a session the host does not run in
    NotApplicable,
}

/// Shared services an instance needs from its owner
pub struct InstanceContext {
    pub platform: Arc<dyn Platform>,
    pub settings: Arc<BrokerSettings>,
    pub containment: Arc<ContainmentGroups>,
    /// Orchestrator inbox, for inbound messages and exit notifications
    pub events: mpsc::Sender<Event>,
    /// Fires once broker shutdown has begun
    pub shutdown: CancellationToken,
}

/// Resources of a launched process
struct Running {
    pid: u32,
    session: u32,
    writer: Arc<PipeWriter>,
    reader: ReadHandle,
    stderr: JoinHandle<()>,
    keep_alive: JoinHandle<()>,
    io_cancel: CancellationToken,
    keep_alive_cancel: CancellationToken,
}

/// One host process, live or about to be
pub struct ChildProcessInstance {
    id: InstanceId,
    desired: DesiredInstance,
    /// The host's own topic: fresh id bound to the target session
    topic: Topic,
    ctx: Arc<InstanceContext>,
    running: Option<Running>,
    restart_backoff: Arc<Mutex<ExponentialBackoff>>,
    terminated: bool,
}

impl ChildProcessInstance {
    /// Create an instance for a desired (config, session) pair; nothing is launched yet
    pub fn new(desired: DesiredInstance, ctx: Arc<InstanceContext>) -> Self {
        let topic = Topic::new(Uuid::new_v4(), SessionSelector::Id(desired.session));
        let restart_backoff = ExponentialBackoff::from_config(&ctx.settings.restart_backoff);
        Self {
            id: InstanceId::next(),
            desired,
            topic,
            ctx,
            running: None,
            restart_backoff: Arc::new(Mutex::new(restart_backoff)),
            terminated: false,
        }
    }

    /// Instance identifier
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// The (config, session) pair this instance was created for
    pub fn desired(&self) -> &DesiredInstance {
        &self.desired
    }

    /// Configuration shared with every instance derived from it
    pub fn config(&self) -> &ChildProcessConfig {
        &self.desired.config
    }

    /// The host's own topic
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Process id of the current process, if launched
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|r| r.pid)
    }

    /// Whether a launched process is still being watched
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.keep_alive.is_finished())
            .unwrap_or(false)
    }

    /// Start the host process
    ///
    /// With [`LaunchReason::ApplyConfig`] this is a no-op while the process
    /// is running. A failed launch is not retried here.
    pub async fn launch(&mut self, reason: LaunchReason) -> Result<(), LaunchError> {
        if self.terminated {
            return Err(LaunchError::Terminated);
        }
        if reason == LaunchReason::ApplyConfig && self.is_running() {
            tracing::debug!("{} already running, launch skipped", self);
            return Ok(());
        }
        if let Some(previous) = self.running.take() {
            tracing::debug!("Releasing previous process {} of {}", previous.pid, self);
            self.release(previous).await;
        }

        let platform = Arc::clone(&self.ctx.platform);
        let config = Arc::clone(&self.desired.config);
        let image = self.ctx.settings.host_image_path(config.wow64)?;
        let cross_session = self.desired.session != platform.current_session();
        let breakaway = cross_session && platform.is_service();

        let request = SpawnRequest {
            working_dir: image.parent().map(Path::to_path_buf),
            image,
            args: vec![config.group_name.clone()],
            target_session: self.desired.session,
            cross_session,
            higher_integrity: config.higher_integrity,
            protected: platform.is_protected() && !config.ui,
            breakaway,
        };

        let SpawnedChild {
            mut process,
            stdin,
            stdout,
            stderr: stderr_pipe,
        } = platform.spawn(&request)?;
        let pid = process.pid();

        if breakaway {
            if let Err(e) = self.contain(process.as_mut()) {
                tracing::error!("Failed to contain pid {} of {}: {}", pid, self, e);
                if let Err(kill) = process.start_kill() {
                    tracing::warn!("Failed to kill uncontained pid {}: {}", pid, kill);
                }
                return Err(e);
            }
        }

        let session = process.session();
        tracing::info!(
            "Launched {} as pid {} in session {} ({:?})",
            self,
            pid,
            session,
            reason
        );

        let io_cancel = CancellationToken::new();
        let keep_alive_cancel = CancellationToken::new();
        let writer = Arc::new(PipeWriter::new(format!("{} stdin", self), stdin));

        let reader = {
            let events = self.ctx.events.clone();
            let instance = self.id;
            start_read(
                format!("{} stdout", self),
                stdout,
                self.ctx.settings.message_queue_capacity,
                &io_cancel,
                move |message| {
                    let events = events.clone();
                    async move {
                        match events.send(Event::ReceivedMessage { instance, message }).await {
                            Ok(()) => ControlFlow::Continue(()),
                            Err(_) => ControlFlow::Break(()),
                        }
                    }
                },
            )
        };

        let stderr = tokio::spawn(stderr::forward(
            stderr_pipe,
            pid,
            config.group_name.clone(),
            io_cancel.clone(),
        ));

        let keep_alive = tokio::spawn(keep_alive(Watch {
            instance: self.id,
            label: self.to_string(),
            process,
            started: Instant::now(),
            reader_closed: reader.closed(),
            stop: keep_alive_cancel.clone(),
            shutdown: self.ctx.shutdown.clone(),
            grace: self.ctx.settings.terminate_timeout,
            backoff: Arc::clone(&self.restart_backoff),
            events: self.ctx.events.clone(),
        }));

        self.running = Some(Running {
            pid,
            session,
            writer: Arc::clone(&writer),
            reader,
            stderr,
            keep_alive,
            io_cancel,
            keep_alive_cancel,
        });

        let init = HostInit::new(&self.topic.id, config.group_name.clone());
        let message = Message::json(HostInit::topic(), &init).map_err(TransportError::Write)?;
        writer.send(message).await?;

        Ok(())
    }

    /// Stop the host process and release everything it owns
    ///
    /// The keep-alive watcher is cancelled before anything else so the
    /// exit is not mistaken for a crash. Safe to call more than once.
    pub async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        let Some(running) = self.running.take() else {
            tracing::debug!("{} terminated before launch", self);
            return;
        };

        tracing::info!("Terminating {} (pid {})", self, running.pid);
        running.keep_alive_cancel.cancel();
        running.io_cancel.cancel();

        if let Err(e) = send_command(&running.writer, self.topic, &HostCommand::terminate()).await {
            tracing::debug!("Terminate command to {} not delivered: {}", self, e);
        }

        self.release(running).await;
        tracing::info!("{} terminated", self);
    }

    /// Ask the host to load every configured module, in order
    ///
    /// Skipped once broker shutdown has begun.
    pub async fn load_modules(&self) -> Result<(), TransportError> {
        if self.ctx.shutdown.is_cancelled() {
            tracing::debug!("Shutting down, not loading modules into {}", self);
            return Ok(());
        }

        let running = self.running.as_ref().ok_or(TransportError::PipeClosed)?;
        for module in &self.desired.config.modules {
            tracing::debug!("Loading module {} into {}", module, self);
            let command = HostCommand::ctrl_module(&ModuleControl::load(module.clone()))?;
            send_command(&running.writer, self.topic, &command).await?;
        }
        Ok(())
    }

    /// Forward a payload to the host
    ///
    /// Topics scoped to a session other than the host's own yield
    /// [`PublishOutcome::NotApplicable`] without writing anything.
    pub async fn publish(&self, topic: Topic, payload: Bytes) -> Result<PublishOutcome, TransportError> {
        let running = self.running.as_ref().ok_or(TransportError::PipeClosed)?;

        let applicable = match topic.session {
            SessionSelector::Id(session) => session == running.session,
            SessionSelector::Active => {
                self.ctx.platform.active_console_session() == Some(running.session)
            }
            SessionSelector::Any | SessionSelector::HostInit => true,
        };
        if !applicable {
            tracing::trace!("{} not applicable to {} in session {}", topic, self, running.session);
            return Ok(PublishOutcome::NotApplicable);
        }

        running.writer.send(Message::new(topic, payload)).await?;
        Ok(PublishOutcome::Sent)
    }

    fn contain(&self, process: &mut dyn ChildProcess) -> Result<(), LaunchError> {
        let group = self
            .ctx
            .containment
            .get_or_create(self.ctx.platform.as_ref(), self.desired.session)?;
        group.assign(process.pid())?;
        process.resume()?;
        Ok(())
    }

    async fn release(&self, running: Running) {
        running.keep_alive_cancel.cancel();
        running.io_cancel.cancel();
        running.writer.close().await;

        let Running {
            pid,
            reader,
            stderr,
            keep_alive,
            ..
        } = running;

        let joined = async {
            if let Err(e) = keep_alive.await {
                tracing::warn!("Keep-alive task of pid {} failed: {}", pid, e);
            }
            reader.join().await;
            if let Err(e) = stderr.await {
                tracing::warn!("Stderr task of pid {} failed: {}", pid, e);
            }
        };

        let limit = self.ctx.settings.terminate_timeout * 2;
        if tokio::time::timeout(limit, joined).await.is_err() {
            tracing::warn!("Timed out joining tasks of {} (pid {})", self, pid);
        }
    }
}

impl fmt::Display for ChildProcessInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{}",
            self.desired.config.group_name,
            self.desired.session,
            self.id.as_u64()
        )
    }
}

impl Drop for ChildProcessInstance {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.keep_alive_cancel.cancel();
            running.io_cancel.cancel();
        }
    }
}

async fn send_command(
    writer: &PipeWriter,
    topic: Topic,
    command: &HostCommand,
) -> Result<(), TransportError> {
    let message = Message::json(topic, command)?;
    writer.send(message).await
}

/// State handed to a keep-alive watcher
struct Watch {
    instance: InstanceId,
    label: String,
    process: Box<dyn ChildProcess>,
    started: Instant,
    reader_closed: CancellationToken,
    stop: CancellationToken,
    shutdown: CancellationToken,
    grace: Duration,
    backoff: Arc<Mutex<ExponentialBackoff>>,
    events: mpsc::Sender<Event>,
}

enum Wake {
    Stop,
    Exited(std::io::Result<Option<i32>>),
    PipeClosed,
}

/// Watch the process until it exits or the watcher is stopped
///
/// An unexpected exit outside shutdown is reported as
/// [`Event::ChildExited`] after the restart backoff delay; the relaunch
/// itself happens on the orchestrator task.
async fn keep_alive(mut watch: Watch) {
    let pid = watch.process.pid();
    let mut pipe_closed = false;

    let exit = loop {
        let wake = tokio::select! {
            biased;
            _ = watch.stop.cancelled() => Wake::Stop,
            status = watch.process.wait() => Wake::Exited(status),
            _ = watch.reader_closed.cancelled(), if !pipe_closed => Wake::PipeClosed,
        };

        match wake {
            Wake::Stop => {
                stop_process(&mut watch, pid).await;
                return;
            }
            Wake::Exited(status) => break status,
            Wake::PipeClosed => {
                tracing::warn!("{} output pipe closed, treating pid {} as gone", watch.label, pid);
                pipe_closed = true;
                if let Err(e) = watch.process.start_kill() {
                    tracing::debug!("Kill of pid {} failed: {}", pid, e);
                }
            }
        }
    };

    match exit {
        Ok(code) => tracing::warn!("{} (pid {}) exited unexpectedly, code {:?}", watch.label, pid, code),
        Err(e) => tracing::warn!("{} (pid {}) wait failed: {}", watch.label, pid, e),
    }

    if watch.shutdown.is_cancelled() {
        tracing::info!("{} exited during shutdown, not restarting", watch.label);
        return;
    }

    let delay = {
        let mut backoff = watch.backoff.lock().unwrap_or_else(|e| e.into_inner());
        if watch.started.elapsed() > backoff.max() {
            backoff.reset();
        }
        backoff.next_delay()
    };
    tracing::info!("Restarting {} in {:?}", watch.label, delay);

    tokio::select! {
        _ = watch.stop.cancelled() => return,
        _ = watch.shutdown.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    let event = Event::ChildExited {
        instance: watch.instance,
        pid,
    };
    if watch.events.send(event).await.is_err() {
        tracing::debug!("Orchestrator gone, {} not restarted", watch.label);
    }
}

/// Give the process `grace` to exit on its own, then kill it
async fn stop_process(watch: &mut Watch, pid: u32) {
    match tokio::time::timeout(watch.grace, watch.process.wait()).await {
        Ok(status) => tracing::debug!("{} (pid {}) exited: {:?}", watch.label, pid, status),
        Err(_) => {
            tracing::warn!("{} (pid {}) did not exit in {:?}, killing", watch.label, pid, watch.grace);
            if let Err(e) = watch.process.start_kill() {
                tracing::warn!("Kill of pid {} failed: {}", pid, e);
            }
            if let Err(e) = watch.process.wait().await {
                tracing::debug!("Wait for pid {} after kill failed: {}", pid, e);
            }
        }
    }
}
