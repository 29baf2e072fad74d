//! Behavioural tests driving the controller through its public API.

use std::sync::Arc;
use std::time::Duration;

use stratus::test_support::FakeEnvironment;
use stratus::{
    Cluster, Conn, ControllerConfig, DbError, Environment, ProviderKind, Role, run,
    update_cluster,
};
use tokio::sync::watch;
use tokio::time::timeout;

const AMAZON: &str = "FakeAmazon";
const REGION: &str = "fake-region";

fn test_env() -> FakeEnvironment {
    FakeEnvironment::new(&[(AMAZON, "Amazon cloud config")], REGION)
}

fn set_namespace(conn: &Conn, namespace: &str) {
    conn.txn::<_, DbError>(|view| {
        let mut row = match view.cluster() {
            Ok(row) => row,
            Err(DbError::NoCluster) => view.insert_cluster()?,
            Err(err) => return Err(err),
        };
        row.namespace = namespace.to_owned();
        view.commit_cluster(row)
    })
    .expect("namespace should commit");
}

fn insert_worker(conn: &Conn, size: &str) {
    conn.txn::<_, DbError>(|view| {
        let mut row = view.insert_machine();
        row.kind = ProviderKind::new(AMAZON);
        row.region = REGION.to_owned();
        row.size = size.to_owned();
        row.role = Role::Worker;
        view.commit_machine(row)
    })
    .expect("row should insert");
}

#[tokio::test]
async fn booted_machines_round_trip_into_the_store() {
    let env = test_env();
    let conn = Conn::new();
    set_namespace(&conn, "ns");
    insert_worker(&conn, "m4.large");

    let mut cluster = Cluster::new(conn.clone(), Arc::new(env.clone()), "ns");
    cluster.run_once().await.expect("tick should succeed");

    let rows = conn.machines().expect("select");
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].cloud_id.is_empty());
    assert!(!rows[0].public_ip.is_empty());
    assert_eq!(rows[0].role, Role::Worker);

    // A second tick finds nothing to do.
    let fakes = env.providers();
    fakes[0].clear_logs();
    cluster.run_once().await.expect("tick should succeed");
    assert!(fakes[0].boot_requests().is_empty());
    assert!(fakes[0].stop_requests().is_empty());
}

#[tokio::test]
async fn the_controller_moves_work_to_the_new_namespace() {
    let env = test_env();
    let env_arc: Arc<dyn Environment> = Arc::new(env.clone());
    let conn = Conn::new();
    set_namespace(&conn, "ns1");
    insert_worker(&conn, "m4.large");

    let handle = update_cluster(&conn, &env_arc, None)
        .await
        .expect("update should succeed");
    assert_eq!(env.provider_count(), 1);

    set_namespace(&conn, "ns2");
    update_cluster(&conn, &env_arc, handle)
        .await
        .expect("update should succeed")
        .expect("a handle should exist");

    assert_eq!(env.provider_count(), 2);
    let fakes = env.providers();
    assert_eq!(fakes[0].namespace(), "ns1");
    assert_eq!(fakes[1].namespace(), "ns2");
    // Only the new namespace's provider booted the machine.
    assert_eq!(fakes[1].boot_requests().len(), 1);
}

#[tokio::test]
async fn the_loop_finishes_the_tick_and_exits_on_stop() {
    let env = test_env();
    let conn = Conn::new();
    set_namespace(&conn, "ns");
    insert_worker(&conn, "m4.large");

    let (stop_tx, stop_rx) = watch::channel(false);
    let config = ControllerConfig {
        poll_interval_secs: 0,
    };
    let worker = tokio::spawn(run(conn.clone(), config, Arc::new(env.clone()), stop_rx));

    // Give the loop a moment to tick, then ask it to stop.
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop_tx.send(true).expect("loop should still be listening");

    timeout(Duration::from_secs(5), worker)
        .await
        .expect("loop should exit promptly")
        .expect("loop task should not panic")
        .expect("loop should exit cleanly");

    let rows = conn.machines().expect("select");
    assert!(!rows[0].cloud_id.is_empty());
}
