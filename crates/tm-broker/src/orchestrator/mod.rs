//! Orchestrator
//!
//! A single task owns every host instance, the subscription table and
//! the current configuration. Everything that can change that state
//! (session notifications, shutdown, host messages, exit notifications)
//! arrives as an [`Event`] on one channel and is applied through the pure
//! state machine in [`machine`]. Completion events raised by the
//! orchestrator's own actions go on a local ready-queue that is drained
//! before the channel is polled again.

pub mod machine;
pub mod reconcile;

pub use machine::{
    classify, transition, Action, Event, Guards, MachineState, MessageKind, ReconfigureStep,
    Transition,
};
pub use reconcile::{compute_desired, plan, DesiredInstance, ReconcilePlan, SessionView};

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use tm_core::{BrokerError, BrokerSettings, ChildProcessConfig};
use tm_protocol::topic::{ALL_TOPICS, CONF_STORE_TOPIC};
use tm_protocol::{ConfStoreRequest, Message, ModuleMeta, Topic};

use crate::backoff::ExponentialBackoff;
use crate::instance::{ChildProcessInstance, InstanceContext, InstanceId, LaunchReason, PublishOutcome};
use crate::platform::{ContainmentGroups, Platform};
use crate::router::SubscriptionTable;

/// Configuration section requested from the configuration store
const BROKER_SECTION: &str = "Broker";

/// Summary of one live instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub group_name: String,
    /// Session the instance targets
    pub session: u32,
    pub pid: Option<u32>,
    pub running: bool,
}

/// Snapshot published after every processed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStatus {
    pub state: MachineState,
    pub instances: Vec<InstanceSummary>,
    pub bootstrapping: bool,
    pub shutting_down: bool,
    /// Number of reconciliation cycles started so far
    pub cycle: u64,
}

impl BrokerStatus {
    fn initial() -> Self {
        Self {
            state: MachineState::Launched,
            instances: Vec::new(),
            bootstrapping: false,
            shutting_down: false,
            cycle: 0,
        }
    }

    /// Live instances of a group
    pub fn group(&self, group_name: &str) -> impl Iterator<Item = &InstanceSummary> {
        let group_name = group_name.to_string();
        self.instances.iter().filter(move |i| i.group_name == group_name)
    }
}

/// Handle used by the entry point (and tests) to drive the orchestrator
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    status: watch::Receiver<BrokerStatus>,
}

impl OrchestratorHandle {
    /// Start bootstrapping
    pub async fn initialize(&self) -> Result<(), BrokerError> {
        self.post(Event::Initialize).await
    }

    /// Report that a user session logged on or off
    pub async fn session_changed(&self) -> Result<(), BrokerError> {
        self.post(Event::SessionChanged).await
    }

    /// Begin shutdown
    ///
    /// The shutdown signal is raised before the event is posted so that
    /// hosts exiting from here on are never restarted.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.shutdown.cancel();
        self.post(Event::Shutdown).await
    }

    /// Receiver of status snapshots
    pub fn status(&self) -> watch::Receiver<BrokerStatus> {
        self.status.clone()
    }

    async fn post(&self, event: Event) -> Result<(), BrokerError> {
        self.events.send(event).await.map_err(|_| BrokerError::Stopped)
    }
}

/// Owner of all host instances and the reconciliation state machine
pub struct Orchestrator {
    state: MachineState,
    ctx: Arc<InstanceContext>,
    events: mpsc::Receiver<Event>,
    instances: Vec<ChildProcessInstance>,
    router: SubscriptionTable,
    /// Current configuration, replaced wholesale on every update
    configs: Vec<Arc<ChildProcessConfig>>,
    desired: Vec<DesiredInstance>,
    /// Desired entries without a live match, filled by the diff
    missing: Vec<DesiredInstance>,
    /// Instances launched in the current cycle
    fresh: Vec<InstanceId>,
    deferred: VecDeque<Event>,
    pending: VecDeque<Event>,
    cycle: u64,
    bootstrapping: bool,
    containment_ready: bool,
    fault_backoff: ExponentialBackoff,
    status: watch::Sender<BrokerStatus>,
}

impl Orchestrator {
    /// Create an orchestrator and the handle that drives it
    pub fn new(platform: Arc<dyn Platform>, settings: BrokerSettings) -> (Self, OrchestratorHandle) {
        let (tx, rx) = mpsc::channel(settings.event_queue_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(BrokerStatus::initial());
        let shutdown = CancellationToken::new();
        let fault_backoff = ExponentialBackoff::from_config(&settings.fault_backoff);

        let ctx = Arc::new(InstanceContext {
            platform,
            settings: Arc::new(settings),
            containment: Arc::new(ContainmentGroups::new()),
            events: tx.clone(),
            shutdown: shutdown.clone(),
        });

        let orchestrator = Self {
            state: MachineState::Launched,
            ctx,
            events: rx,
            instances: Vec::new(),
            router: SubscriptionTable::new(),
            configs: Vec::new(),
            desired: Vec::new(),
            missing: Vec::new(),
            fresh: Vec::new(),
            deferred: VecDeque::new(),
            pending: VecDeque::new(),
            cycle: 0,
            bootstrapping: false,
            containment_ready: false,
            fault_backoff,
            status: status_tx,
        };

        let handle = OrchestratorHandle {
            events: tx,
            shutdown,
            status: status_rx,
        };

        (orchestrator, handle)
    }

    /// Containment groups shared with every instance
    ///
    /// Dropping the last reference closes the groups, which kills their
    /// members.
    pub fn containment(&self) -> Arc<ContainmentGroups> {
        Arc::clone(&self.ctx.containment)
    }

    /// Process events until the machine terminates
    pub async fn run(mut self) {
        tracing::info!("Orchestrator running");

        while self.state != MachineState::Terminated {
            let event = match self.pending.pop_front() {
                Some(event) => event,
                None => match self.events.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
            self.publish_status();
        }

        for instance in &mut self.instances {
            instance.terminate().await;
        }
        self.instances.clear();
        self.publish_status();

        tracing::info!("Orchestrator stopped");
    }

    fn guards(&self) -> Guards {
        Guards {
            bootstrapping: self.bootstrapping,
            shutting_down: self.ctx.shutdown.is_cancelled(),
            has_children: !self.desired.is_empty(),
            cycle: self.cycle,
        }
    }

    async fn handle(&mut self, event: Event) {
        let from = self.state;
        tracing::debug!("{} <- {}", from, event);

        let Transition { next, actions } = transition(from, event, &self.guards());
        if next != from {
            tracing::info!("State {} -> {}", from, next);
        }
        self.state = next;

        for action in actions {
            if let Err(e) = self.execute(action).await {
                tracing::error!("Action failed in {}: {}", self.state, e);
                self.pending.retain(|event| !event.is_completion());
                self.pending.push_front(Event::Fault(e.to_string()));
                break;
            }
        }

        if self.state == MachineState::Active && from != MachineState::Active {
            self.fault_backoff.reset();
        }
    }

    async fn execute(&mut self, action: Action) -> Result<(), BrokerError> {
        match action {
            Action::StoreBootstrapConfig => {
                let bootstrap = &self.ctx.settings.bootstrap;
                tracing::info!(
                    "Applying bootstrap configuration: {} with module {}",
                    bootstrap.group_name,
                    bootstrap.module
                );
                self.configs = vec![Arc::new(ChildProcessConfig::bootstrap(
                    bootstrap.group_name.clone(),
                    bootstrap.module.clone(),
                ))];
                self.bootstrapping = true;
            }
            Action::StoreEmptyConfig => {
                tracing::info!("Applying empty configuration");
                self.configs.clear();
            }
            Action::StoreBrokerConfig(message) => {
                let configs = ChildProcessConfig::parse_document(&message.text())?;
                tracing::info!("Applying broker configuration with {} host(s)", configs.len());
                self.configs = configs.into_iter().map(Arc::new).collect();
                self.bootstrapping = false;
            }
            Action::PrepareContainment => self.prepare_containment()?,
            Action::CalculateDesired => self.calculate_desired()?,
            Action::TerminateUndesired => self.terminate_undesired(),
            Action::LaunchMissing => self.launch_missing().await?,
            Action::LoadModules => self.load_modules().await,
            Action::ReleaseDeferred => {
                if !self.deferred.is_empty() {
                    tracing::debug!("Re-delivering {} deferred event(s)", self.deferred.len());
                }
                self.pending.extend(self.deferred.drain(..));
            }
            Action::Stop => {
                tracing::info!("No hosts desired, stopping");
            }
            Action::RecordModuleMeta { instance, message } => {
                self.record_module_meta(instance, &message)?;
            }
            Action::QueryBrokerConfig => self.query_broker_config().await?,
            Action::Broadcast(message) => {
                self.broadcast(&message).await;
            }
            Action::Defer(event) => self.deferred.push_back(event),
            Action::Restart { instance, pid } => self.restart(instance, pid).await?,
            Action::ScheduleInitialize => self.schedule_initialize(),
        }
        Ok(())
    }

    /// Containment for the broker's own session, created once
    fn prepare_containment(&mut self) -> Result<(), BrokerError> {
        if self.containment_ready {
            return Ok(());
        }
        let platform = self.ctx.platform.as_ref();
        let session = platform.current_session();
        let group = self.ctx.containment.get_or_create(platform, session)?;
        group.assign(std::process::id())?;
        self.containment_ready = true;
        Ok(())
    }

    fn calculate_desired(&mut self) -> Result<(), BrokerError> {
        self.cycle += 1;

        let platform = self.ctx.platform.as_ref();
        let is_service = platform.is_service();
        let needs_sessions = is_service && self.configs.iter().any(|c| c.all_users);
        let view = SessionView {
            is_service,
            own_session: platform.current_session(),
            interactive_sessions: if needs_sessions {
                platform.interactive_sessions()?
            } else {
                Vec::new()
            },
        };

        self.desired = compute_desired(&self.configs, &view);
        tracing::info!(
            "Cycle {}: {} host(s) desired from {} configuration(s)",
            self.cycle,
            self.desired.len(),
            self.configs.len()
        );
        for entry in &self.desired {
            tracing::debug!(
                "Desired {} in session {} with modules {:?}",
                entry.config.group_name,
                entry.session,
                entry.config.modules
            );
        }

        self.pending.push_back(Event::CalculatedDesiredProcesses);
        Ok(())
    }

    fn terminate_undesired(&mut self) {
        let live = self
            .instances
            .iter()
            .map(|i| (i.id(), i.desired(), i.is_running()));
        let ReconcilePlan {
            keep,
            terminate,
            launch,
        } = plan(live, self.desired.clone());

        tracing::info!(
            "Cycle {}: keeping {}, terminating {}, launching {}",
            self.cycle,
            keep.len(),
            terminate.len(),
            launch.len()
        );
        self.missing = launch;

        let cycle = self.cycle;
        if terminate.is_empty() {
            self.pending
                .push_back(Event::AllUndesiredProcessesTerminated { cycle });
            return;
        }

        let (doomed, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.instances)
            .into_iter()
            .partition(|i| terminate.contains(&i.id()));
        self.instances = live;
        for instance in &doomed {
            self.router.remove(instance.id());
        }

        let events = self.ctx.events.clone();
        tokio::spawn(async move {
            let mut doomed = doomed;
            join_all(doomed.iter_mut().map(|i| i.terminate())).await;
            drop(doomed);
            if events
                .send(Event::AllUndesiredProcessesTerminated { cycle })
                .await
                .is_err()
            {
                tracing::debug!("Orchestrator gone before cycle {} finished terminating", cycle);
            }
        });
    }

    async fn launch_missing(&mut self) -> Result<(), BrokerError> {
        self.fresh.clear();

        for desired in std::mem::take(&mut self.missing) {
            let mut instance = ChildProcessInstance::new(desired, Arc::clone(&self.ctx));
            if let Err(e) = instance.launch(LaunchReason::ApplyConfig).await {
                tracing::error!("Failed to launch {}: {}", instance, e);
                instance.terminate().await;
                return Err(e.into());
            }
            self.fresh.push(instance.id());
            self.instances.push(instance);
        }

        self.pending.push_back(Event::AllDesiredProcessesLaunched);
        Ok(())
    }

    async fn load_modules(&mut self) {
        for instance in self.instances.iter().filter(|i| self.fresh.contains(&i.id())) {
            if let Err(e) = instance.load_modules().await {
                tracing::warn!("Failed to load modules into {}: {}", instance, e);
            }
        }
        self.fresh.clear();
        self.pending.push_back(Event::AllModulesLoaded);
    }

    fn record_module_meta(&mut self, instance: InstanceId, message: &Message) -> Result<(), BrokerError> {
        let Some(owner) = self.instances.iter().find(|i| i.id() == instance) else {
            tracing::debug!("Module meta from departed {} ignored", instance);
            return Ok(());
        };

        let meta: ModuleMeta = message.parse()?;
        let added = self.router.extend(instance, meta.topic_set());
        tracing::info!(
            "{} module {} (pid {}) announced {} topic(s), {} new",
            owner,
            meta.name,
            meta.pid,
            meta.topic_ids.len(),
            added
        );
        Ok(())
    }

    async fn query_broker_config(&mut self) -> Result<(), BrokerError> {
        let message = Message::json(
            Topic::any(CONF_STORE_TOPIC),
            &ConfStoreRequest::query(BROKER_SECTION),
        )?;
        let sent = self.broadcast(&message).await;
        if sent == 0 {
            tracing::debug!("No configuration store announced yet, query deferred to its announcement");
        } else {
            tracing::info!("Queried broker configuration from {} host(s)", sent);
        }
        Ok(())
    }

    /// Forward a message to every subscribed instance, in list order
    ///
    /// Returns the number of instances the message was written to.
    async fn broadcast(&self, message: &Message) -> usize {
        if message.topic.id == ALL_TOPICS {
            tracing::warn!("Dropping message addressed to the all-topics wildcard");
            return 0;
        }

        let ids: Vec<InstanceId> = self
            .router
            .subscribers(self.instances.iter().map(|i| i.id()), &message.topic.id)
            .collect();

        let mut sent = 0;
        for instance in self.instances.iter().filter(|i| ids.contains(&i.id())) {
            match instance.publish(message.topic, message.payload.clone()).await {
                Ok(PublishOutcome::Sent) => sent += 1,
                Ok(PublishOutcome::NotApplicable) => {}
                Err(e) => tracing::warn!("Failed to publish {} to {}: {}", message.topic, instance, e),
            }
        }
        tracing::trace!("{} delivered to {} of {} subscriber(s)", message.topic, sent, ids.len());
        sent
    }

    async fn restart(&mut self, id: InstanceId, pid: u32) -> Result<(), BrokerError> {
        let Some(instance) = self.instances.iter_mut().find(|i| i.id() == id) else {
            tracing::debug!("Exit of departed {} (pid {}) ignored", id, pid);
            return Ok(());
        };
        if instance.pid() != Some(pid) {
            tracing::debug!("Stale exit of pid {} for {} ignored", pid, instance);
            return Ok(());
        }

        tracing::info!("Restarting {} after exit of pid {}", instance, pid);
        instance.launch(LaunchReason::Restart).await?;
        if let Err(e) = instance.load_modules().await {
            tracing::warn!("Failed to reload modules into {}: {}", instance, e);
        }
        Ok(())
    }

    fn schedule_initialize(&mut self) {
        let delay = self.fault_backoff.next_delay();
        tracing::info!("Re-initializing in {:?}", delay);

        let events = self.ctx.events.clone();
        let shutdown = self.ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if events.send(Event::Initialize).await.is_err() {
                tracing::debug!("Orchestrator gone, re-initialization dropped");
            }
        });
    }

    fn publish_status(&self) {
        let instances = self
            .instances
            .iter()
            .map(|i| InstanceSummary {
                id: i.id(),
                group_name: i.config().group_name.clone(),
                session: i.desired().session,
                pid: i.pid(),
                running: i.is_running(),
            })
            .collect();

        self.status.send_replace(BrokerStatus {
            state: self.state,
            instances,
            bootstrapping: self.bootstrapping,
            shutting_down: self.ctx.shutdown.is_cancelled(),
            cycle: self.cycle,
        });
    }
}
