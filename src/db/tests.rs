//! Unit tests for the store.

use rstest::rstest;

use super::{Conn, DbError, Machine, PortRange};
use crate::provider::ProviderKind;

fn insert_sized(conn: &Conn, size: &str) -> Machine {
    conn.txn::<_, DbError>(|view| {
        let mut row = view.insert_machine();
        row.kind = ProviderKind::new("Amazon");
        row.size = size.to_owned();
        view.commit_machine(row.clone())?;
        Ok(row)
    })
    .expect("insert should succeed")
}

#[rstest]
fn committed_rows_are_visible_in_insertion_order() {
    let conn = Conn::new();
    insert_sized(&conn, "m4.large");
    insert_sized(&conn, "m4.xlarge");

    let sizes: Vec<String> = conn
        .machines()
        .expect("select should succeed")
        .into_iter()
        .map(|row| row.size)
        .collect();
    assert_eq!(sizes, vec!["m4.large", "m4.xlarge"]);
}

#[rstest]
fn select_applies_the_filter() {
    let conn = Conn::new();
    insert_sized(&conn, "m4.large");
    insert_sized(&conn, "m4.xlarge");

    let matched = conn
        .txn::<_, DbError>(|view| Ok(view.select_machines(|row| row.size == "m4.xlarge")))
        .expect("select should succeed");
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].size, "m4.xlarge");
}

#[rstest]
fn removed_rows_disappear_and_cannot_be_committed() {
    let conn = Conn::new();
    let row = insert_sized(&conn, "m4.large");

    conn.txn::<_, DbError>(|view| view.remove_machine(&row))
        .expect("remove should succeed");
    assert!(conn.machines().expect("select").is_empty());

    let err = conn
        .txn::<_, DbError>(|view| view.commit_machine(row))
        .expect_err("commit of a removed row should fail");
    assert!(matches!(err, DbError::UnknownRow { table: "machine", .. }));
}

#[rstest]
fn a_failed_transaction_leaves_no_partial_writes() {
    let conn = Conn::new();

    let err = conn
        .txn::<(), DbError>(|view| {
            let mut row = view.insert_machine();
            row.size = String::from("m4.large");
            view.commit_machine(row)?;
            Err(DbError::NoCluster)
        })
        .expect_err("transaction should fail");
    assert_eq!(err, DbError::NoCluster);
    assert!(conn.machines().expect("select").is_empty());
}

#[rstest]
fn cluster_row_is_a_singleton() {
    let conn = Conn::new();
    assert_eq!(conn.cluster(), Err(DbError::NoCluster));

    conn.txn::<_, DbError>(|view| {
        let mut row = view.insert_cluster()?;
        row.namespace = String::from("ns");
        row.port_ranges = vec![PortRange { min: 80, max: 80 }];
        view.commit_cluster(row)
    })
    .expect("insert should succeed");

    let row = conn.cluster().expect("cluster row should exist");
    assert_eq!(row.namespace, "ns");
    assert_eq!(row.port_ranges, vec![PortRange { min: 80, max: 80 }]);

    let err = conn
        .txn(|view| view.insert_cluster())
        .expect_err("second insert should fail");
    assert_eq!(err, DbError::ClusterExists);
}

#[rstest]
fn connections_share_one_store() {
    let conn = Conn::new();
    let other = conn.clone();
    insert_sized(&conn, "m4.large");

    assert_eq!(other.machines().expect("select").len(), 1);
}
