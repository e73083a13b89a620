//! Orchestrator integration tests
//!
//! Drives the full bootstrap, reconfiguration, restart and shutdown
//! sequences against in-memory host processes.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use tm_broker::{BrokerStatus, MachineState};

use common::{
    all_users_entry, conf_store_entry, document, entry, FakePlatform, Harness, WAIT,
};

fn pid_of(status: &BrokerStatus, group: &str) -> u32 {
    let mut instances = status.group(group);
    let instance = instances.next().unwrap_or_else(|| panic!("no {} instance", group));
    assert!(instances.next().is_none(), "more than one {} instance", group);
    instance.pid.unwrap_or_else(|| panic!("{} not launched", group))
}

fn sessions_of(status: &BrokerStatus, group: &str) -> BTreeSet<u32> {
    status.group(group).map(|i| i.session).collect()
}

fn configured(status: &BrokerStatus) -> bool {
    status.state == MachineState::Active && !status.bootstrapping
}

#[tokio::test]
async fn test_bootstrap_applies_stored_configuration() {
    let doc = document(&[conf_store_entry(), entry("Worker", &["Echo"])]);
    let harness = Harness::start(FakePlatform::console(1), &doc).await;

    let status = harness
        .wait_for("worker launched", |s| configured(s) && s.group("Worker").count() == 1)
        .await;

    // The configuration store matches the bootstrap entry and survives
    let conf_store = pid_of(&status, "ConfStore");
    let worker = pid_of(&status, "Worker");
    assert_eq!(harness.hosts().spawns_of("ConfStore").len(), 1);
    assert_eq!(harness.hosts().spawns_of("Worker").len(), 1);
    assert!(!harness.hosts().was_terminated(conf_store));

    harness
        .eventually("modules loaded", |h| {
            h.loads(conf_store) == ["ConfStore"] && h.loads(worker) == ["Echo"]
        })
        .await;

    for spawn in harness.hosts().spawns() {
        assert_eq!(spawn.session, 1);
        assert!(!spawn.cross_session);
        assert!(!spawn.breakaway);
    }
    assert!(harness
        .hosts()
        .assigned()
        .contains(&(1, std::process::id())));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_fault_during_bootstrap_retries() {
    let platform = FakePlatform::console(1);
    platform.fail_spawns("ConfStore", 2);
    let doc = document(&[conf_store_entry()]);
    let harness = Harness::start(platform, &doc).await;

    let status = harness.wait_for("configured after retries", configured).await;
    assert_eq!(status.group("ConfStore").count(), 1);
    assert_eq!(harness.hosts().spawns_of("ConfStore").len(), 1);
    assert_eq!(
        harness.hosts().assigned().iter().filter(|(_, pid)| *pid == std::process::id()).count(),
        1
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_all_users_follows_sessions() {
    let doc = document(&[conf_store_entry(), all_users_entry("Desktop", &["Echo"])]);
    let harness = Harness::start(FakePlatform::service(vec![1, 2]), &doc).await;

    let status = harness
        .wait_for("desktop in both sessions", |s| {
            configured(s) && sessions_of(s, "Desktop") == BTreeSet::from([1, 2])
        })
        .await;

    // The configuration store stays in the service session
    assert_eq!(sessions_of(&status, "ConfStore"), BTreeSet::from([0]));

    let desktops = harness.hosts().spawns_of("Desktop");
    assert_eq!(desktops.len(), 2);
    for spawn in &desktops {
        assert!(spawn.cross_session);
        assert!(spawn.breakaway);
        assert!(harness.hosts().assigned().contains(&(spawn.session, spawn.pid)));
    }
    let in_session = |session: u32| {
        desktops
            .iter()
            .find(|s| s.session == session)
            .map(|s| s.pid)
            .unwrap()
    };
    let (first, second) = (in_session(1), in_session(2));

    harness.platform.set_sessions(vec![1, 3]);
    harness.handle.session_changed().await.unwrap();

    let status = harness
        .wait_for("desktop follows sessions", |s| {
            s.cycle > status.cycle
                && s.state == MachineState::Active
                && sessions_of(s, "Desktop") == BTreeSet::from([1, 3])
        })
        .await;

    let survivor = status
        .group("Desktop")
        .find(|i| i.session == 1)
        .and_then(|i| i.pid);
    assert_eq!(survivor, Some(first));
    assert!(harness.hosts().was_terminated(second));
    assert!(!harness.hosts().was_terminated(first));
    assert_eq!(harness.hosts().spawns_of("Desktop").len(), 3);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_session_change_without_difference_is_idempotent() {
    let doc = document(&[conf_store_entry(), entry("Worker", &["Echo"])]);
    let harness = Harness::start(FakePlatform::console(1), &doc).await;

    let before = harness
        .wait_for("configured", |s| configured(s) && s.group("Worker").count() == 1)
        .await;
    let spawned = harness.hosts().spawns().len();

    harness.handle.session_changed().await.unwrap();
    let after = harness
        .wait_for("second cycle", |s| {
            s.cycle > before.cycle && s.state == MachineState::Active
        })
        .await;

    assert_eq!(harness.hosts().spawns().len(), spawned);
    assert_eq!(pid_of(&after, "Worker"), pid_of(&before, "Worker"));
    assert_eq!(pid_of(&after, "ConfStore"), pid_of(&before, "ConfStore"));
    for spawn in harness.hosts().spawns() {
        assert!(!harness.hosts().was_terminated(spawn.pid));
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn test_configuration_change_relaunches_only_changed_hosts() {
    let doc = document(&[
        conf_store_entry(),
        entry("A", &["X"]),
        entry("B", &["Y"]),
    ]);
    let harness = Harness::start(FakePlatform::console(1), &doc).await;

    let before = harness
        .wait_for("initial hosts", |s| {
            configured(s) && s.group("A").count() == 1 && s.group("B").count() == 1
        })
        .await;
    let conf_store = pid_of(&before, "ConfStore");
    let a = pid_of(&before, "A");
    let b = pid_of(&before, "B");

    harness.hosts().set_document(&document(&[
        conf_store_entry(),
        entry("A", &["X"]),
        entry("B", &["Y", "Z"]),
        entry("C", &["W"]),
    ]));
    harness.hosts().push_document(conf_store);

    let after = harness
        .wait_for("changed hosts", |s| {
            s.state == MachineState::Active
                && s.group("C").count() == 1
                && s.group("B").count() == 1
                && s.group("B").all(|i| i.pid != Some(b))
        })
        .await;

    assert_eq!(pid_of(&after, "ConfStore"), conf_store);
    assert_eq!(pid_of(&after, "A"), a);
    assert_eq!(harness.hosts().terminations(b), 1);
    assert_eq!(harness.hosts().terminations(a), 0);
    assert_eq!(harness.hosts().terminations(conf_store), 0);

    let new_b = pid_of(&after, "B");
    harness
        .eventually("new modules loaded", |h| h.loads(new_b) == ["Y", "Z"])
        .await;
    assert_eq!(harness.hosts().loads(a), ["X"]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_crashed_host_is_restarted() {
    let doc = document(&[conf_store_entry(), entry("Worker", &["Echo"])]);
    let harness = Harness::start(FakePlatform::console(1), &doc).await;

    let before = harness
        .wait_for("configured", |s| configured(s) && s.group("Worker").count() == 1)
        .await;
    let old = pid_of(&before, "Worker");

    harness.platform.crash(old);

    let after = harness
        .wait_for("worker relaunched", |s| {
            s.group("Worker")
                .any(|i| i.running && i.pid.is_some() && i.pid != Some(old))
        })
        .await;
    let new = pid_of(&after, "Worker");

    harness
        .eventually("modules reloaded", |h| h.loads(new) == ["Echo"])
        .await;
    assert!(harness.hosts().has_exited(old));
    assert!(!harness.hosts().was_terminated(old));
    assert_eq!(harness.hosts().spawns_of("Worker").len(), 2);
    assert_eq!(harness.hosts().spawns_of("ConfStore").len(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_malformed_output_restarts_host() {
    let doc = document(&[conf_store_entry(), entry("Worker", &["Echo"])]);
    let harness = Harness::start(FakePlatform::console(1), &doc).await;

    let before = harness
        .wait_for("configured", |s| configured(s) && s.group("Worker").count() == 1)
        .await;
    let old = pid_of(&before, "Worker");
    harness
        .eventually("modules loaded", |h| h.loads(old) == ["Echo"])
        .await;

    harness.hosts().corrupt(old);

    let after = harness
        .wait_for("worker relaunched", |s| {
            s.group("Worker")
                .any(|i| i.running && i.pid.is_some() && i.pid != Some(old))
        })
        .await;
    let new = pid_of(&after, "Worker");

    harness
        .eventually("modules reloaded", |h| h.loads(new) == ["Echo"])
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(harness.hosts().has_exited(old));
    assert_eq!(harness.hosts().terminations(old), 0);
    assert_eq!(harness.hosts().spawns_of("Worker").len(), 2);
    assert_eq!(harness.hosts().loads(new), ["Echo"]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_terminates_every_host() {
    let doc = document(&[
        conf_store_entry(),
        entry("Worker", &["Echo"]),
        entry("Other", &[]),
    ]);
    let harness = Harness::start(FakePlatform::console(1), &doc).await;
    harness
        .wait_for("configured", |s| configured(s) && s.instances.len() == 3)
        .await;

    let handle = harness.handle.clone();
    let platform = harness.shutdown().await;

    let status = handle.status().borrow().clone();
    assert_eq!(status.state, MachineState::Terminated);
    assert!(status.instances.is_empty());
    assert!(status.shutting_down);

    let spawns = platform.hosts.spawns();
    assert_eq!(spawns.len(), 3);
    for spawn in spawns {
        assert_eq!(
            platform.hosts.terminations(spawn.pid),
            1,
            "{} not terminated exactly once",
            spawn.group
        );
        assert!(platform.hosts.has_exited(spawn.pid), "{} still running", spawn.group);
    }

    // The orchestrator no longer accepts events
    assert!(handle.session_changed().await.is_err());
}

#[tokio::test]
async fn test_empty_configuration_stops_broker() {
    let harness = Harness::start(FakePlatform::console(1), &document(&[])).await;

    tokio::time::timeout(WAIT, harness.run)
        .await
        .expect("broker did not stop on its own")
        .expect("orchestrator task panicked");

    let status = harness.handle.status().borrow().clone();
    assert_eq!(status.state, MachineState::Terminated);
    assert!(!status.shutting_down);

    let conf_store = harness.platform.hosts.spawns_of("ConfStore");
    assert_eq!(conf_store.len(), 1);
    assert!(harness.platform.hosts.was_terminated(conf_store[0].pid));
}

#[tokio::test]
async fn test_messages_reach_subscribers_only() {
    let doc = document(&[
        conf_store_entry(),
        entry("Listener", &["Echo"]),
        entry("Talker", &["Ping"]),
    ]);
    let harness = Harness::start(FakePlatform::console(1), &doc).await;

    let status = harness
        .wait_for("configured", |s| configured(s) && s.instances.len() == 3)
        .await;
    let listener = pid_of(&status, "Listener");

    harness
        .eventually("ping delivered", |h| !h.deliveries().is_empty())
        .await;
    for delivery in harness.hosts().deliveries() {
        assert_eq!(delivery.pid, listener);
        assert!(delivery.payload.starts_with("ping "));
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn test_session_scoped_topic_reaches_matching_session() {
    let doc = document(&[
        conf_store_entry(),
        all_users_entry("Desktop", &["Echo"]),
        entry("Talker", &["PingSession2"]),
    ]);
    let harness = Harness::start(FakePlatform::service(vec![1, 2]), &doc).await;

    harness
        .wait_for("configured", |s| {
            configured(s) && s.group("Desktop").count() == 2 && s.group("Talker").count() == 1
        })
        .await;

    harness
        .eventually("ping delivered", |h| !h.deliveries().is_empty())
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let deliveries = harness.hosts().deliveries();
    assert!(deliveries.len() > 1);
    for delivery in deliveries {
        assert_eq!(delivery.session, 2);
    }

    harness.shutdown().await;
}
