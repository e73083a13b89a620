//! Reconciliation state machine
//!
//! The machine is a plain enum plus a pure [`transition`] function. It
//! never touches instances or pipes itself: it returns the actions the
//! orchestrator must carry out, in order. Guards are read from a
//! [`Guards`] snapshot taken just before the event is applied.

use std::fmt;

use tm_core::config::has_broker_section;
use tm_protocol::topic::{BROKER_TOPIC, CONF_STORE_TOPIC, CONF_TOPIC, MODULE_META_TOPIC};
use tm_protocol::{Message, ModuleMeta};

use crate::instance::InstanceId;

/// Steps of the reconfiguration sub-machine, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigureStep {
    CalculatingDesired,
    TerminatingUndesired,
    LaunchingMissing,
    LoadingModules,
}

/// Top-level machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Initial state, and the state after a fault reset
    Launched,
    /// Converging live hosts on the desired set
    Reconfiguring(ReconfigureStep),
    /// Hosts running, messages being routed
    Active,
    /// Nothing left to run
    Terminated,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launched => write!(f, "Launched"),
            Self::Reconfiguring(step) => write!(f, "Reconfiguring/{:?}", step),
            Self::Active => write!(f, "Active"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Inputs to the machine
#[derive(Debug)]
pub enum Event {
    /// Start bootstrapping
    Initialize,
    /// Desired set computed
    CalculatedDesiredProcesses,
    /// Undesired hosts of reconciliation `cycle` have been terminated
    AllUndesiredProcessesTerminated { cycle: u64 },
    /// Every missing host has been launched
    AllDesiredProcessesLaunched,
    /// Load commands sent to every freshly launched host
    AllModulesLoaded,
    /// A user session logged on or off
    SessionChanged,
    /// Tear everything down
    Shutdown,
    /// A host published a message
    ReceivedMessage { instance: InstanceId, message: Message },
    /// A host exited unexpectedly and its restart delay has passed
    ChildExited { instance: InstanceId, pid: u32 },
    /// An action failed
    Fault(String),
}

impl Event {
    /// Completion events raised by the orchestrator's own actions
    ///
    /// These are discarded when an action faults, since the cycle they
    /// belong to is abandoned.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Self::CalculatedDesiredProcesses
                | Self::AllUndesiredProcessesTerminated { .. }
                | Self::AllDesiredProcessesLaunched
                | Self::AllModulesLoaded
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialize => write!(f, "Initialize"),
            Self::CalculatedDesiredProcesses => write!(f, "CalculatedDesiredProcesses"),
            Self::AllUndesiredProcessesTerminated { cycle } => {
                write!(f, "AllUndesiredProcessesTerminated(cycle {})", cycle)
            }
            Self::AllDesiredProcessesLaunched => write!(f, "AllDesiredProcessesLaunched"),
            Self::AllModulesLoaded => write!(f, "AllModulesLoaded"),
            Self::SessionChanged => write!(f, "SessionChanged"),
            Self::Shutdown => write!(f, "Shutdown"),
            Self::ReceivedMessage { instance, message } => {
                write!(f, "ReceivedMessage({} on {})", instance, message.topic)
            }
            Self::ChildExited { instance, pid } => write!(f, "ChildExited({} pid {})", instance, pid),
            Self::Fault(reason) => write!(f, "Fault({})", reason),
        }
    }
}

/// Read-only snapshot of orchestrator state used by guards
#[derive(Debug, Clone, Copy, Default)]
pub struct Guards {
    /// Only the bootstrap configuration has been applied so far
    pub bootstrapping: bool,
    /// Broker shutdown has begun
    pub shutting_down: bool,
    /// The current desired set is non-empty
    pub has_children: bool,
    /// Current reconciliation cycle
    pub cycle: u64,
}

/// How an inbound message is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Module-meta announcement
    ModuleMeta { from_conf_store: bool },
    /// Configuration change carrying a broker section
    BrokerConfig,
    /// Reserved broker topic
    Broker,
    /// Well-known topic with an unreadable payload
    Malformed,
    /// Anything else, routed to subscribers
    Other,
}

/// Classify a message by topic and, for well-known topics, by payload
pub fn classify(message: &Message) -> MessageKind {
    let id = message.topic.id;
    if id == MODULE_META_TOPIC {
        match message.parse::<ModuleMeta>() {
            Ok(meta) => MessageKind::ModuleMeta {
                from_conf_store: meta.topic_set().contains(&CONF_STORE_TOPIC),
            },
            Err(_) => MessageKind::Malformed,
        }
    } else if id == CONF_TOPIC {
        match message.parse::<serde_json::Value>() {
            Ok(document) if has_broker_section(&document) => MessageKind::BrokerConfig,
            Ok(_) => MessageKind::Other,
            Err(_) => MessageKind::Malformed,
        }
    } else if id == BROKER_TOPIC {
        MessageKind::Broker
    } else {
        MessageKind::Other
    }
}

/// Work the orchestrator performs for a transition
#[derive(Debug)]
pub enum Action {
    /// Replace the configuration with the bootstrap configuration
    StoreBootstrapConfig,
    /// Set up containment for the broker's own session
    PrepareContainment,
    /// Start a reconciliation cycle by computing the desired set
    CalculateDesired,
    /// Diff and terminate live hosts that are not desired
    TerminateUndesired,
    /// Launch desired hosts that have no live match
    LaunchMissing,
    /// Send load commands to hosts launched this cycle
    LoadModules,
    /// Re-deliver deferred events
    ReleaseDeferred,
    /// Machine finished
    Stop,
    /// Grow the sender's subscription set
    RecordModuleMeta { instance: InstanceId, message: Message },
    /// Ask the configuration store for the broker section
    QueryBrokerConfig,
    /// Replace the configuration with the one carried by the message
    StoreBrokerConfig(Message),
    /// Replace the configuration with an empty one
    StoreEmptyConfig,
    /// Route the message to every subscribed host
    Broadcast(Message),
    /// Keep the event for re-delivery once the machine is active
    Defer(Event),
    /// Relaunch a host that exited, then reload its modules
    Restart { instance: InstanceId, pid: u32 },
    /// Post `Initialize` again after the fault backoff
    ScheduleInitialize,
}

/// Result of applying one event
#[derive(Debug)]
pub struct Transition {
    pub next: MachineState,
    pub actions: Vec<Action>,
}

impl Transition {
    fn to(next: MachineState, actions: Vec<Action>) -> Self {
        Self { next, actions }
    }

    fn stay(state: MachineState) -> Self {
        Self::to(state, Vec::new())
    }
}

/// Apply `event` to `state`
pub fn transition(state: MachineState, event: Event, guards: &Guards) -> Transition {
    use ReconfigureStep::*;

    if let Event::Fault(reason) = &event {
        if state == MachineState::Terminated {
            return Transition::stay(state);
        }
        tracing::error!("Fault in {}: {}, resetting", state, reason);
        return Transition::to(
            MachineState::Launched,
            vec![Action::ReleaseDeferred, Action::ScheduleInitialize],
        );
    }

    match state {
        MachineState::Launched => match event {
            Event::Initialize => Transition::to(
                MachineState::Reconfiguring(CalculatingDesired),
                vec![
                    Action::StoreBootstrapConfig,
                    Action::PrepareContainment,
                    Action::CalculateDesired,
                ],
            ),
            Event::Shutdown => Transition::to(
                MachineState::Reconfiguring(CalculatingDesired),
                vec![Action::StoreEmptyConfig, Action::CalculateDesired],
            ),
            Event::ReceivedMessage { instance, message } => match classify(&message) {
                MessageKind::ModuleMeta { .. } => Transition::to(
                    state,
                    vec![Action::RecordModuleMeta { instance, message }],
                ),
                _ => {
                    tracing::debug!("Dropping message on {} from {} before initialization", message.topic, instance);
                    Transition::stay(state)
                }
            },
            other => ignore(state, other),
        },

        MachineState::Reconfiguring(step) => reconfiguring(step, event, guards),

        MachineState::Active => match event {
            Event::SessionChanged => Transition::to(
                MachineState::Reconfiguring(CalculatingDesired),
                vec![Action::CalculateDesired],
            ),
            Event::Shutdown => Transition::to(
                MachineState::Reconfiguring(CalculatingDesired),
                vec![Action::StoreEmptyConfig, Action::CalculateDesired],
            ),
            Event::ReceivedMessage { instance, message } => active_message(instance, message, guards),
            Event::ChildExited { instance, pid } => restart(state, instance, pid, guards),
            other => ignore(state, other),
        },

        MachineState::Terminated => ignore(state, event),
    }
}

fn reconfiguring(step: ReconfigureStep, event: Event, guards: &Guards) -> Transition {
    use ReconfigureStep::*;
    let state = MachineState::Reconfiguring(step);

    match (step, event) {
        (CalculatingDesired, Event::CalculatedDesiredProcesses) => Transition::to(
            MachineState::Reconfiguring(TerminatingUndesired),
            vec![Action::TerminateUndesired],
        ),
        (TerminatingUndesired, Event::AllUndesiredProcessesTerminated { cycle }) => {
            if cycle != guards.cycle {
                tracing::debug!("Ignoring termination of stale cycle {} (current {})", cycle, guards.cycle);
                return Transition::stay(state);
            }
            Transition::to(
                MachineState::Reconfiguring(LaunchingMissing),
                vec![Action::LaunchMissing],
            )
        }
        (LaunchingMissing, Event::AllDesiredProcessesLaunched) => Transition::to(
            MachineState::Reconfiguring(LoadingModules),
            vec![Action::LoadModules],
        ),
        (LoadingModules, Event::AllModulesLoaded) => {
            if guards.has_children {
                let mut actions = vec![Action::ReleaseDeferred];
                if guards.bootstrapping && !guards.shutting_down {
                    actions.push(Action::QueryBrokerConfig);
                }
                Transition::to(MachineState::Active, actions)
            } else {
                Transition::to(MachineState::Terminated, vec![Action::Stop])
            }
        }

        (_, Event::ReceivedMessage { instance, message }) => match classify(&message) {
            MessageKind::ModuleMeta { from_conf_store } => {
                let bootstrap_meta = guards.bootstrapping && from_conf_store;
                if step == LoadingModules && bootstrap_meta {
                    tracing::debug!("Deferring configuration store announcement from {}", instance);
                    return Transition::to(
                        state,
                        vec![Action::Defer(Event::ReceivedMessage { instance, message })],
                    );
                }
                let mut actions = vec![Action::RecordModuleMeta { instance, message }];
                if bootstrap_meta && !guards.shutting_down {
                    actions.push(Action::QueryBrokerConfig);
                }
                Transition::to(state, actions)
            }
            MessageKind::Malformed => {
                tracing::warn!("Dropping malformed message on {} from {}", message.topic, instance);
                Transition::stay(state)
            }
            _ => Transition::to(
                state,
                vec![Action::Defer(Event::ReceivedMessage { instance, message })],
            ),
        },
        (_, event @ (Event::SessionChanged | Event::Shutdown)) => {
            tracing::debug!("Deferring {} while {}", event, state);
            Transition::to(state, vec![Action::Defer(event)])
        }
        (_, Event::ChildExited { instance, pid }) => restart(state, instance, pid, guards),
        (_, other) => ignore(state, other),
    }
}

fn active_message(instance: InstanceId, message: Message, guards: &Guards) -> Transition {
    let state = MachineState::Active;
    if guards.shutting_down {
        tracing::debug!("Shutting down, dropping message on {} from {}", message.topic, instance);
        return Transition::stay(state);
    }

    match classify(&message) {
        MessageKind::ModuleMeta { from_conf_store } => {
            let mut actions = vec![Action::RecordModuleMeta {
                instance,
                message: message.clone(),
            }];
            if guards.bootstrapping && from_conf_store {
                actions.push(Action::QueryBrokerConfig);
            }
            actions.push(Action::Broadcast(message));
            Transition::to(state, actions)
        }
        MessageKind::BrokerConfig => Transition::to(
            MachineState::Reconfiguring(ReconfigureStep::CalculatingDesired),
            vec![Action::StoreBrokerConfig(message), Action::CalculateDesired],
        ),
        MessageKind::Broker => {
            tracing::debug!("Broker command from {} ignored", instance);
            Transition::stay(state)
        }
        MessageKind::Malformed => {
            tracing::warn!("Dropping malformed message on {} from {}", message.topic, instance);
            Transition::stay(state)
        }
        MessageKind::Other => Transition::to(state, vec![Action::Broadcast(message)]),
    }
}

fn restart(state: MachineState, instance: InstanceId, pid: u32, guards: &Guards) -> Transition {
    if guards.shutting_down {
        tracing::debug!("Shutting down, not restarting {} (pid {})", instance, pid);
        return Transition::stay(state);
    }
    Transition::to(state, vec![Action::Restart { instance, pid }])
}

fn ignore(state: MachineState, event: Event) -> Transition {
    tracing::debug!("Ignoring {} in {}", event, state);
    Transition::stay(state)
}
