//! Cluster scenarios on the simulated network.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use steward_cluster::{
    place, MemberStatus, NodeConfig, RestartPolicy, StartOutcome, SupervisorError, WorkerSpec,
};
use steward_core::{ChildId, MemberId};
use steward_runtime::{EntryRegistry, ShutdownBudget, StartDescriptor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::harness::{SimCluster, SimConfig};
use crate::network::Latency;
use crate::seed::SimSeed;

const WAIT: Duration = Duration::from_secs(10);

type Signal = (ChildId, MemberId);

/// Channels the test entries report through
struct Signals {
    release: CancellationToken,
    done: mpsc::UnboundedSender<Signal>,
    started: mpsc::UnboundedSender<Signal>,
    crashed_once: Arc<AtomicBool>,
}

struct Receivers {
    done: mpsc::UnboundedReceiver<Signal>,
    started: mpsc::UnboundedReceiver<Signal>,
}

fn signals() -> (Signals, Receivers) {
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let (started_tx, started_rx) = mpsc::unbounded_channel();
    let signals = Signals {
        release: CancellationToken::new(),
        done: done_tx,
        started: started_tx,
        crashed_once: Arc::new(AtomicBool::new(false)),
    };
    (signals, Receivers { done: done_rx, started: started_rx })
}

fn registry(signals: &Signals) -> EntryRegistry {
    let mut registry = EntryRegistry::new();
    registry
        .register("idle", |ctx| async move {
            ctx.shutdown_requested().await;
            Ok(())
        })
        .unwrap();
    registry.register("quick", |_ctx| async move { Ok(()) }).unwrap();
    registry
        .register("crash", |_ctx| async move { Err("boom".to_string()) })
        .unwrap();
    registry
        .register("stubborn", |_ctx| async move {
            std::future::pending::<()>().await;
            Ok(())
        })
        .unwrap();

    let flag = Arc::clone(&signals.crashed_once);
    registry
        .register("crash_once", move |ctx| {
            let first = !flag.swap(true, Ordering::SeqCst);
            async move {
                if first {
                    return Err("first run fails".to_string());
                }
                ctx.shutdown_requested().await;
                Ok(())
            }
        })
        .unwrap();

    let (release, done) = (signals.release.clone(), signals.done.clone());
    registry
        .register("finisher", move |ctx| {
            let (release, done) = (release.clone(), done.clone());
            async move {
                tokio::select! {
                    () = ctx.shutdown_requested() => {}
                    () = release.cancelled() => {
                        let _ = done.send((ctx.child.clone(), ctx.member));
                    }
                }
                Ok(())
            }
        })
        .unwrap();

    let started = signals.started.clone();
    registry
        .register("linger", move |ctx| {
            let started = started.clone();
            async move {
                let _ = started.send((ctx.child.clone(), ctx.member));
                ctx.shutdown_requested().await;
                let linger = ctx.args.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(linger)).await;
                Ok(())
            }
        })
        .unwrap();
    registry
}

fn cluster(seed: u64) -> (SimCluster, Receivers, CancellationToken) {
    cluster_with(SimConfig::new(SimSeed::from_literal(seed)))
}

fn cluster_with(config: SimConfig) -> (SimCluster, Receivers, CancellationToken) {
    let (signals, receivers) = signals();
    let release = signals.release.clone();
    (SimCluster::new(config, registry(&signals)), receivers, release)
}

fn idle(id: &str) -> WorkerSpec {
    WorkerSpec::new(id, StartDescriptor::new("idle"))
}

fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}-{}", prefix, i)).collect()
}

/// The first `n` ids with `prefix` that rendezvous places on `owner`
fn ids_owned_by(owner: &str, members: &[&str], prefix: &str, n: usize) -> Vec<String> {
    let owner = SimCluster::member_id(owner);
    let members: Vec<MemberId> = members.iter().map(|name| SimCluster::member_id(name)).collect();
    (0..)
        .map(|i| format!("{}-{}", prefix, i))
        .filter(|id| place(&ChildId::new(id.clone()), &members).is_ok_and(|m| m == owner))
        .take(n)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_is_placed_and_unique() {
    let (sim, _rx, _) = cluster(1);
    sim.spawn_cluster(&["a", "b", "c"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();

    let a = sim.node("a").await.unwrap();
    let b = sim.node("b").await.unwrap();
    let members = [SimCluster::member_id("a"), SimCluster::member_id("b"), SimCluster::member_id("c")];

    for id in ids("job", 30) {
        let started = a.start_child(idle(&id)).await.unwrap();
        let StartOutcome::Started(handle) = started else {
            panic!("{} was not freshly started", id);
        };
        assert_eq!(handle.member, place(&ChildId::new(id.clone()), &members).unwrap());

        let again = b.start_child(idle(&id)).await.unwrap();
        assert_eq!(again, StartOutcome::AlreadyStarted(handle));
    }

    let counts = sim.await_active("c", 30, WAIT).await.unwrap();
    assert_eq!(counts.specs, 30);
    assert_eq!(counts.workers, 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_from_any_member() {
    let (sim, _rx, _) = cluster(2);
    sim.spawn_cluster(&["a", "b", "c"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();

    let a = sim.node("a").await.unwrap();
    let c = sim.node("c").await.unwrap();
    for id in ids("job", 10) {
        a.start_child(idle(&id)).await.unwrap();
    }
    sim.await_converged(WAIT).await.unwrap();

    for id in ids("job", 10).iter().take(4) {
        c.stop_child(&ChildId::new(id.clone())).await.unwrap();
    }
    sim.await_active("b", 6, WAIT).await.unwrap();

    let again = c.stop_child(&ChildId::from("job-0")).await.unwrap_err();
    assert_eq!(again, SupervisorError::NotFound(ChildId::from("job-0")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_policies() {
    let (sim, _rx, _) = cluster(3);
    sim.spawn_cluster(&["a", "b"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();
    let a = sim.node("a").await.unwrap();

    let once = WorkerSpec::new("once", StartDescriptor::new("crash_once"));
    let quick = WorkerSpec::new("quick", StartDescriptor::new("quick"))
        .with_restart(RestartPolicy::Transient);
    let temp = WorkerSpec::new("temp", StartDescriptor::new("crash"))
        .with_restart(RestartPolicy::Temporary);
    let looping = WorkerSpec::new("looping", StartDescriptor::new("crash"));
    for spec in [once, quick, temp, looping] {
        a.start_child(spec).await.unwrap();
    }

    // Only the child that crashed once comes back; the crash loop gives up
    sim.await_condition("restarts to settle", WAIT, || async {
        let reports = a.which_children().await;
        let running: Vec<&str> = reports
            .iter()
            .filter(|report| report.handle.is_some())
            .map(|report| report.id.as_str())
            .collect();
        reports.len() == 4 && running == ["once"]
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failover_restores_population() {
    let (sim, _rx, _) = cluster(4);
    sim.spawn_cluster(&["a", "b", "c"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();

    let a = sim.node("a").await.unwrap();
    for id in ids("w", 200) {
        a.start_child(idle(&id)).await.unwrap();
    }
    sim.await_active("a", 200, WAIT).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();

    let lost = sim.node("c").await.unwrap().local_children().await.len();
    assert!(lost > 0);

    sim.crash("c").await.unwrap();
    sim.notify_down("c").await;

    let counts = sim.await_active("b", 200, WAIT).await.unwrap();
    assert_eq!(counts.specs, 200);

    let on_survivors = a.local_children().await.len() + sim.node("b").await.unwrap().local_children().await.len();
    assert_eq!(on_survivors, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_detector_triggers_failover() {
    let config = SimConfig::new(SimSeed::from_literal(5))
        .with_node(NodeConfig::new().with_gossip_interval(20).with_call_timeout(200).with_suspect_after(Some(3)));
    let (sim, _rx, _) = cluster_with(config);
    sim.spawn_cluster(&["a", "b"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();

    let a = sim.node("a").await.unwrap();
    for id in ids("w", 20) {
        a.start_child(idle(&id)).await.unwrap();
    }
    sim.await_converged(WAIT).await.unwrap();

    // No notification: a has to find out by itself
    sim.crash("b").await.unwrap();
    let counts = sim.await_active("a", 20, WAIT).await.unwrap();
    assert_eq!(counts.specs, 20);
    assert_eq!(a.store().status(&SimCluster::member_id("b")).await, Some(MemberStatus::Dead));
    assert_eq!(a.local_children().await.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_start_then_join_completes_once() {
    let (sim, mut rx, release) = cluster(6);
    let a = sim.spawn_member("a").await.unwrap();
    let b = sim.spawn_member("b").await.unwrap();

    // Two separate clusters, each running its own instance
    let job = WorkerSpec::new("job", StartDescriptor::new("finisher"))
        .with_restart(RestartPolicy::Transient);
    assert!(matches!(a.start_child(job.clone()).await.unwrap(), StartOutcome::Started(_)));
    assert!(matches!(b.start_child(job).await.unwrap(), StartOutcome::Started(_)));

    sim.join("b", "a").await.unwrap();
    sim.await_converged(WAIT).await.unwrap();
    sim.await_condition("one instance left", WAIT, || async {
        a.local_children().await.len() + b.local_children().await.len() == 1
    })
    .await
    .unwrap();

    release.cancel();
    let (child, _) = tokio::time::timeout(WAIT, rx.done.recv()).await.unwrap().unwrap();
    assert_eq!(child, ChildId::from("job"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.done.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partition_heal_leaves_one_instance() {
    let config = SimConfig::new(SimSeed::from_literal(7))
        .with_node(NodeConfig::new().with_gossip_interval(20).with_call_timeout(200).with_suspect_after(Some(3)));
    let (sim, _rx, _) = cluster_with(config);
    sim.spawn_cluster(&["a", "b", "c"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();

    let a = sim.node("a").await.unwrap();
    for id in ids("p", 30) {
        a.start_child(idle(&id)).await.unwrap();
    }
    sim.await_converged(WAIT).await.unwrap();

    // Each side fails over the other's children
    sim.partition(&[&["a"], &["b", "c"]]).await;
    sim.await_active("a", 30, WAIT).await.unwrap();
    sim.await_active("b", 30, WAIT).await.unwrap();

    sim.heal().await;
    sim.await_condition("duplicates resolved", WAIT, || async {
        let mut local = 0;
        for node in sim.nodes().await {
            local += node.local_children().await.len();
        }
        local == 30
    })
    .await
    .unwrap();
    sim.await_converged(WAIT).await.unwrap();

    let counts = sim.await_active("c", 30, WAIT).await.unwrap();
    assert_eq!(counts.specs, 30);
    for name in ["a", "b", "c"] {
        let status = a.store().status(&SimCluster::member_id(name)).await;
        assert_eq!(status, Some(MemberStatus::Alive));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restarted_member_releases_old_claims() {
    let (sim, _rx, _) = cluster(8);
    sim.spawn_cluster(&["a", "b"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();

    let a = sim.node("a").await.unwrap();
    for id in ids("r", 10) {
        a.start_child(idle(&id)).await.unwrap();
    }
    sim.await_converged(WAIT).await.unwrap();

    sim.crash("b").await.unwrap();
    sim.spawn_member("b").await.unwrap();
    sim.join("b", "a").await.unwrap();

    let counts = sim.await_active("b", 10, WAIT).await.unwrap();
    assert_eq!(counts.specs, 10);
}

/// Running instances per child id across all members
async fn instances(sim: &SimCluster) -> BTreeMap<ChildId, usize> {
    let mut counts = BTreeMap::new();
    for node in sim.nodes().await {
        for report in node.local_children().await {
            if report.handle.is_some() {
                *counts.entry(report.id).or_default() += 1;
            }
        }
    }
    counts
}

fn without_detector(seed: u64) -> SimConfig {
    SimConfig::new(SimSeed::from_literal(seed)).with_node(
        NodeConfig::new()
            .with_gossip_interval(20)
            .with_call_timeout(200)
            .with_query_timeout(200)
            .with_forward_attempts(2)
            .with_suspect_after(None),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restarted_member_keeps_one_instance_of_solo_start() {
    let (sim, _rx, _) = cluster_with(without_detector(13));
    let target = ids_owned_by("a", &["a", "b"], "x", 1).remove(0);
    let mut started = ids("x", 10);
    if !started.contains(&target) {
        started.push(target.clone());
    }

    let b = sim.spawn_member("b").await.unwrap();
    for id in &started {
        b.start_child(idle(id)).await.unwrap();
    }
    sim.spawn_member("a").await.unwrap();
    sim.join("a", "b").await.unwrap();
    sim.await_converged(WAIT).await.unwrap();

    // b comes back alone, starts one of its old ids, then finds a again
    sim.crash("b").await.unwrap();
    let b = sim.spawn_member("b").await.unwrap();
    let solo = b.start_child(idle(&target)).await.unwrap();
    assert!(matches!(solo, StartOutcome::Started(_)));
    sim.join("b", "a").await.unwrap();

    let expected = started.len();
    let sim_ref = &sim;
    sim.await_condition("one instance per child", WAIT, move || async move {
        let counts = instances(sim_ref).await;
        counts.len() == expected && counts.values().all(|&n| n == 1)
    })
    .await
    .unwrap();
    sim.await_converged(WAIT).await.unwrap();

    // Stays that way once gossip has settled
    tokio::time::sleep(Duration::from_millis(300)).await;
    let counts = instances(&sim).await;
    assert_eq!(counts.len(), expected);
    assert!(counts.values().all(|&n| n == 1), "{:?}", counts);
    assert_eq!(sim.node("a").await.unwrap().count_children().await.active, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_fails_while_owner_is_unreachable() {
    let (sim, _rx, _) = cluster_with(without_detector(15));
    sim.spawn_cluster(&["a", "b"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();
    let a = sim.node("a").await.unwrap();

    let id = ids_owned_by("b", &["a", "b"], "u", 1).remove(0);
    sim.crash("b").await.unwrap();
    let err = a.start_child(idle(&id)).await.unwrap_err();
    assert_eq!(err, SupervisorError::OwnerUnreachable(SimCluster::member_id("b")));

    sim.notify_down("b").await;
    let outcome = a.start_child(idle(&id)).await.unwrap();
    assert!(matches!(&outcome, StartOutcome::Started(handle) if handle.member == a.id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_is_idempotent() {
    let (sim, _rx, _) = cluster(14);
    let a = sim.spawn_member("a").await.unwrap();
    let b = sim.spawn_member("b").await.unwrap();
    a.start_child(idle("from-a")).await.unwrap();
    b.start_child(idle("from-b")).await.unwrap();

    sim.join("a", "b").await.unwrap();
    sim.join("b", "a").await.unwrap();
    sim.await_converged(WAIT).await.unwrap();
    sim.await_active("a", 2, WAIT).await.unwrap();

    let state = a.store().snapshot().await;
    let epochs = (a.store().epoch(), b.store().epoch());
    sim.join("a", "b").await.unwrap();
    sim.join("b", "a").await.unwrap();
    sim.join("a", "a").await.unwrap();

    assert_eq!(a.store().snapshot().await, state);
    assert_eq!(b.store().snapshot().await, state);
    assert_eq!((a.store().epoch(), b.store().epoch()), epochs);
}

/// Member statuses by name and the cluster-wide child rows, as seen from `name`
async fn outcome_of(
    sim: &SimCluster,
    names: &[&str],
    name: &str,
) -> (Vec<Option<MemberStatus>>, Vec<(ChildId, Option<MemberId>)>) {
    let node = sim.node(name).await.unwrap();
    let mut statuses = Vec::new();
    for member in names {
        statuses.push(node.store().status(&SimCluster::member_id(member)).await);
    }
    let rows = node
        .which_children()
        .await
        .into_iter()
        .map(|report| (report.id, report.handle.map(|handle| handle.member)))
        .collect();
    (statuses, rows)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_direction_does_not_matter() {
    let mut outcomes = Vec::new();
    for (joiner, via) in [("a", "b"), ("b", "a")] {
        let (sim, _rx, _) = cluster(16);
        let a = sim.spawn_member("a").await.unwrap();
        let b = sim.spawn_member("b").await.unwrap();
        for id in ids("pa", 5) {
            a.start_child(idle(&id)).await.unwrap();
        }
        for id in ids("pb", 5) {
            b.start_child(idle(&id)).await.unwrap();
        }

        sim.join(joiner, via).await.unwrap();
        sim.await_converged(WAIT).await.unwrap();
        sim.await_active("a", 10, WAIT).await.unwrap();
        let from_a = outcome_of(&sim, &["a", "b"], "a").await;
        assert_eq!(from_a, outcome_of(&sim, &["a", "b"], "b").await);
        outcomes.push(from_a);
    }
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_handoff_follows_budgets() {
    let (sim, mut rx, _) = cluster(9);
    sim.spawn_cluster(&["a", "b"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();
    let a = sim.node("a").await.unwrap();

    let owned = ids_owned_by("a", &["a", "b"], "h", 3);
    let lingers = [300u64, 0, 120];
    for (id, linger) in owned.iter().zip(lingers) {
        let spec = WorkerSpec::new(id.as_str(), StartDescriptor::new("linger").with_args(serde_json::json!(linger)));
        let handle = a.start_child(spec).await.unwrap();
        assert_eq!(handle.handle().member, a.id());
    }
    for _ in 0..3 {
        rx.started.recv().await.unwrap();
    }

    let report = sim.stop("a", Duration::from_secs(5)).await.unwrap();
    let by_budget: Vec<ChildId> = [1, 2, 0].iter().map(|&i| ChildId::new(owned[i].clone())).collect();
    assert_eq!(report.handed_off, by_budget);
    assert!(!report.timed_out);

    let mut arrivals = Vec::new();
    for _ in 0..3 {
        let (child, member) = tokio::time::timeout(WAIT, rx.started.recv()).await.unwrap().unwrap();
        assert_eq!(member, SimCluster::member_id("b"));
        arrivals.push(child);
    }
    assert_eq!(arrivals, by_budget);
    sim.await_active("b", 3, WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_timeout_leaves_rest_to_failover() {
    let (sim, _rx, _) = cluster(10);
    sim.spawn_cluster(&["a", "b"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();
    let a = sim.node("a").await.unwrap();

    let id = ids_owned_by("a", &["a", "b"], "s", 1).remove(0);
    let spec = WorkerSpec::new(id.as_str(), StartDescriptor::new("stubborn"))
        .with_shutdown(ShutdownBudget::Infinity);
    a.start_child(spec).await.unwrap();

    let report = sim.stop("a", Duration::from_millis(150)).await.unwrap();
    assert!(report.timed_out);
    assert_eq!(report.forced, vec![ChildId::new(id)]);

    sim.await_active("b", 1, WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wire_encoding_round_trips() {
    let (sim, _rx, _) = cluster_with(SimConfig::new(SimSeed::from_literal(11)).with_wire_json(true));
    sim.spawn_cluster(&["a", "b"]).await.unwrap();
    sim.await_converged(WAIT).await.unwrap();

    let b = sim.node("b").await.unwrap();
    for id in ids("j", 10) {
        b.start_child(idle(&id)).await.unwrap();
    }
    sim.await_active("a", 10, WAIT).await.unwrap();
    assert!(sim.network().stats().delivered > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_twenty_thousand_on_one_member() {
    let (sim, _rx, _) = cluster_with(SimConfig::new(SimSeed::from_literal(12)).with_latency(Latency::ZERO));
    let a = sim.spawn_member("a").await.unwrap();
    for id in ids("bulk", 20_000) {
        a.start_child(idle(&id)).await.unwrap();
    }

    // Children stay where they are when a member joins
    sim.spawn_member("b").await.unwrap();
    sim.join("b", "a").await.unwrap();

    let counts = sim.await_active("b", 20_000, Duration::from_secs(30)).await.unwrap();
    assert_eq!(counts.specs, 20_000);
    assert_eq!(a.local_children().await.len(), 20_000);
}
