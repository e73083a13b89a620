//! Desired-set computation and live/desired diffing
//!
//! Both functions are pure; the orchestrator feeds them its current
//! configuration, a snapshot of the OS session view and its live
//! instances, then carries out the resulting plan.

use std::sync::Arc;

use tm_core::ChildProcessConfig;

use crate::instance::InstanceId;

/// One host that should be running: a configuration bound to a session
///
/// Two entries are equal when every configuration field (module order
/// included) and the session match.
#[derive(Debug, Clone)]
pub struct DesiredInstance {
    pub config: Arc<ChildProcessConfig>,
    pub session: u32,
}

impl DesiredInstance {
    /// Bind a configuration to a session
    pub fn new(config: Arc<ChildProcessConfig>, session: u32) -> Self {
        Self { config, session }
    }
}

impl PartialEq for DesiredInstance {
    fn eq(&self, other: &Self) -> bool {
        self.session == other.session && *self.config == *other.config
    }
}

impl Eq for DesiredInstance {}

/// OS session facts the desired set depends on
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    /// Broker runs as a service
    pub is_service: bool,
    /// Session the broker runs in
    pub own_session: u32,
    /// Active or disconnected user sessions
    pub interactive_sessions: Vec<u32>,
}

/// Expand configurations into the list of hosts that should be running
///
/// An all-users configuration yields one entry per non-zero interactive
/// session when the broker is a service, otherwise a single entry in the
/// broker's own session. Duplicate entries are collapsed.
pub fn compute_desired(configs: &[Arc<ChildProcessConfig>], view: &SessionView) -> Vec<DesiredInstance> {
    let mut desired: Vec<DesiredInstance> = Vec::new();
    let mut push = |entry: DesiredInstance| {
        if desired.contains(&entry) {
            tracing::debug!(
                "Duplicate desired host {} in session {} ignored",
                entry.config.group_name,
                entry.session
            );
        } else {
            desired.push(entry);
        }
    };

    for config in configs {
        if config.all_users && view.is_service {
            for session in view.interactive_sessions.iter().filter(|s| **s != 0) {
                push(DesiredInstance::new(Arc::clone(config), *session));
            }
        } else {
            push(DesiredInstance::new(Arc::clone(config), view.own_session));
        }
    }

    desired
}

/// What a reconciliation pass has to do
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Live instances that match a desired entry
    pub keep: Vec<InstanceId>,
    /// Live instances no longer desired (or no longer running)
    pub terminate: Vec<InstanceId>,
    /// Desired entries with no live match
    pub launch: Vec<DesiredInstance>,
}

/// Diff live instances against the desired list
///
/// Each desired entry matches at most one running live instance. Live
/// instances whose process is gone never match, so they get replaced.
pub fn plan<'a, I>(live: I, desired: Vec<DesiredInstance>) -> ReconcilePlan
where
    I: IntoIterator<Item = (InstanceId, &'a DesiredInstance, bool)>,
{
    let mut remaining = desired;
    let mut result = ReconcilePlan::default();

    for (id, key, running) in live {
        let matched = running
            .then(|| remaining.iter().position(|d| d == key))
            .flatten();
        match matched {
            Some(index) => {
                remaining.remove(index);
                result.keep.push(id);
            }
            None => result.terminate.push(id),
        }
    }

    result.launch = remaining;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(group: &str, modules: &[&str]) -> Arc<ChildProcessConfig> {
        Arc::new(ChildProcessConfig {
            all_users: false,
            wow64: false,
            higher_integrity: false,
            ui: false,
            group_name: group.to_string(),
            modules: modules.iter().map(|m| m.to_string()).collect(),
        })
    }

    fn all_users(group: &str) -> Arc<ChildProcessConfig> {
        let mut c = (*config(group, &["M"])).clone();
        c.all_users = true;
        Arc::new(c)
    }

    fn service_view(sessions: &[u32]) -> SessionView {
        SessionView {
            is_service: true,
            own_session: 0,
            interactive_sessions: sessions.to_vec(),
        }
    }

    #[test]
    fn test_all_users_expands_per_session() {
        let desired = compute_desired(&[all_users("User")], &service_view(&[0, 1, 2]));

        let sessions: Vec<u32> = desired.iter().map(|d| d.session).collect();
        assert_eq!(sessions, vec![1, 2]);
        assert!(desired.iter().all(|d| d.config.group_name == "User"));
    }

    #[test]
    fn test_all_users_outside_service_uses_own_session() {
        let view = SessionView {
            is_service: false,
            own_session: 4,
            interactive_sessions: vec![1, 2],
        };
        let desired = compute_desired(&[all_users("User")], &view);

        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].session, 4);
    }

    #[test]
    fn test_all_users_with_no_sessions() {
        let desired = compute_desired(&[all_users("User")], &service_view(&[]));
        assert!(desired.is_empty());
    }

    #[test]
    fn test_duplicates_collapsed() {
        let desired = compute_desired(
            &[config("A", &["X"]), config("A", &["X"]), config("A", &["Y"])],
            &service_view(&[]),
        );
        assert_eq!(desired.len(), 2);
    }

    #[test]
    fn test_equality_includes_module_order_and_session() {
        let a = DesiredInstance::new(config("G", &["X", "Y"]), 1);
        assert_eq!(a, DesiredInstance::new(config("G", &["X", "Y"]), 1));
        assert_ne!(a, DesiredInstance::new(config("G", &["Y", "X"]), 1));
        assert_ne!(a, DesiredInstance::new(config("G", &["X", "Y"]), 2));
    }

    #[test]
    fn test_plan_diff() {
        let keep = DesiredInstance::new(config("Keep", &["K"]), 0);
        let stale = DesiredInstance::new(config("Stale", &["S"]), 0);
        let fresh = DesiredInstance::new(config("Fresh", &["F"]), 0);

        let live = vec![(InstanceId::new(1), &keep, true), (InstanceId::new(2), &stale, true)];
        let result = plan(live, vec![keep.clone(), fresh.clone()]);

        assert_eq!(result.keep, vec![InstanceId::new(1)]);
        assert_eq!(result.terminate, vec![InstanceId::new(2)]);
        assert_eq!(result.launch, vec![fresh]);
    }

    #[test]
    fn test_plan_identical_sets_is_noop() {
        let a = DesiredInstance::new(config("A", &["M"]), 0);
        let b = DesiredInstance::new(config("B", &["M"]), 3);

        let live = vec![(InstanceId::new(1), &a, true), (InstanceId::new(2), &b, true)];
        let result = plan(live, vec![b.clone(), a.clone()]);

        assert_eq!(result.keep.len(), 2);
        assert!(result.terminate.is_empty());
        assert!(result.launch.is_empty());
    }

    #[test]
    fn test_plan_replaces_dead_instance() {
        let a = DesiredInstance::new(config("A", &["M"]), 0);

        let live = vec![(InstanceId::new(1), &a, false)];
        let result = plan(live, vec![a.clone()]);

        assert_eq!(result.terminate, vec![InstanceId::new(1)]);
        assert_eq!(result.launch, vec![a]);
    }

    #[test]
    fn test_plan_duplicate_live_instances() {
        let a = DesiredInstance::new(config("A", &["M"]), 0);

        let live = vec![(InstanceId::new(1), &a, true), (InstanceId::new(2), &a, true)];
        let result = plan(live, vec![a.clone()]);

        assert_eq!(result.keep, vec![InstanceId::new(1)]);
        assert_eq!(result.terminate, vec![InstanceId::new(2)]);
        assert!(result.launch.is_empty());
    }

    #[test]
    fn test_plan_empty_desired_terminates_everything() {
        let a = DesiredInstance::new(config("A", &["M"]), 0);
        let live = vec![(InstanceId::new(1), &a, true)];
        let result = plan(live, Vec::new());

        assert_eq!(result.terminate, vec![InstanceId::new(1)]);
        assert!(result.keep.is_empty());
    }
}
