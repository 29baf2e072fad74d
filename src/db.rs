//! In-process relational store backing the reconciliation loop.
//!
//! The store holds the singleton [`Cluster`] row and the [`Machine`] table.
//! All access goes through closure-scoped transactions on a [`Conn`]: the
//! closure receives a [`Database`] view with insert, select, commit, and
//! remove operations, and its writes become visible only when it returns
//! `Ok`. Locking is the store's concern and opaque to callers; the critical
//! sections are short read-modify-write cycles under a single writer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::machine::Role;
use crate::provider::ProviderKind;

/// Inclusive TCP port range opened to the world.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortRange {
    /// Lowest permitted port.
    pub min: u16,
    /// Highest permitted port.
    pub max: u16,
}

/// Singleton row describing the cluster as a whole.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Cluster {
    row_id: u32,
    /// Operator-chosen string tagging every cloud resource this cluster owns.
    pub namespace: String,
    /// Admin sources granted full access; CIDRs or opaque names.
    pub admin_acls: Vec<String>,
    /// Port ranges opened to the world.
    pub port_ranges: Vec<PortRange>,
}

/// One desired machine, as produced by the policy engine.
///
/// `cloud_id`, `public_ip`, and `role` are observed back from the cloud once
/// the machine is realised; `floating_ip` stays operator-owned.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Machine {
    row_id: u32,
    /// Provider driver that should own this machine.
    pub kind: ProviderKind,
    /// Region the machine should run in.
    pub region: String,
    /// Requested instance size; empty lets the driver choose.
    pub size: String,
    /// Requested root disk in gigabytes; zero means the driver default.
    pub disk_size: u32,
    /// Role the machine should assume.
    pub role: Role,
    /// Whether a reclaimable instance is acceptable.
    pub preemptible: bool,
    /// Provider-assigned identifier, written back after pairing.
    pub cloud_id: String,
    /// Public IP, written back after pairing.
    pub public_ip: String,
    /// Floating IP the machine should hold; empty means none.
    pub floating_ip: String,
    /// SSH public keys granted access.
    pub ssh_keys: Vec<String>,
}

/// Errors raised by the store.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DbError {
    /// Raised when the singleton cluster row does not exist.
    #[error("no cluster row")]
    NoCluster,
    /// Raised when a second cluster row would be inserted.
    #[error("cluster row already exists")]
    ClusterExists,
    /// Raised when committing or removing a row that was never inserted.
    #[error("unknown {table} row {row_id}")]
    UnknownRow {
        /// Table the row belongs to.
        table: &'static str,
        /// Identifier that failed to resolve.
        row_id: u32,
    },
    /// Raised when a previous writer panicked and poisoned the store lock.
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Clone, Debug, Default)]
struct Tables {
    next_row_id: u32,
    cluster: Option<Cluster>,
    machines: BTreeMap<u32, Machine>,
}

impl Tables {
    fn allocate_row_id(&mut self) -> u32 {
        self.next_row_id += 1;
        self.next_row_id
    }
}

/// Cloneable handle to a shared store.
#[derive(Clone, Debug, Default)]
pub struct Conn {
    shared: Arc<Mutex<Tables>>,
}

impl Conn {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `body` as one transaction.
    ///
    /// The body operates on a staged copy of the tables; returning `Err`
    /// discards every staged write, so a failed transaction leaves no
    /// partial state behind.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or [`DbError::Poisoned`] (converted through
    /// `E`) when the store lock is unusable.
    pub fn txn<T, E>(&self, body: impl FnOnce(&mut Database<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let mut tables = self.shared.lock().map_err(|_| E::from(DbError::Poisoned))?;
        let mut staged = tables.clone();
        let value = body(&mut Database {
            tables: &mut staged,
        })?;
        *tables = staged;
        Ok(value)
    }

    /// Reads the cluster row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NoCluster`] when the row has not been inserted.
    pub fn cluster(&self) -> Result<Cluster, DbError> {
        self.txn(|view| view.cluster())
    }

    /// Reads every machine row, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Poisoned`] when the store lock is unusable.
    pub fn machines(&self) -> Result<Vec<Machine>, DbError> {
        self.txn(|view| Ok(view.machines()))
    }
}

/// Mutable view over the tables inside one transaction.
#[derive(Debug)]
pub struct Database<'a> {
    tables: &'a mut Tables,
}

impl Database<'_> {
    /// Inserts a fresh machine row with default attributes and returns it.
    pub fn insert_machine(&mut self) -> Machine {
        let row_id = self.tables.allocate_row_id();
        let row = Machine {
            row_id,
            ..Machine::default()
        };
        self.tables.machines.insert(row_id, row.clone());
        row
    }

    /// Machine rows matching `filter`, in insertion order.
    pub fn select_machines(&self, filter: impl Fn(&Machine) -> bool) -> Vec<Machine> {
        self.tables
            .machines
            .values()
            .filter(|row| filter(row))
            .cloned()
            .collect()
    }

    /// Every machine row, in insertion order.
    #[must_use]
    pub fn machines(&self) -> Vec<Machine> {
        self.select_machines(|_| true)
    }

    /// Writes a previously inserted machine row back.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnknownRow`] when the row was never inserted or
    /// has been removed.
    pub fn commit_machine(&mut self, row: Machine) -> Result<(), DbError> {
        match self.tables.machines.get_mut(&row.row_id) {
            Some(slot) => {
                *slot = row;
                Ok(())
            }
            None => Err(DbError::UnknownRow {
                table: "machine",
                row_id: row.row_id,
            }),
        }
    }

    /// Removes a machine row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnknownRow`] when the row does not exist.
    pub fn remove_machine(&mut self, row: &Machine) -> Result<(), DbError> {
        self.tables
            .machines
            .remove(&row.row_id)
            .map(|_| ())
            .ok_or(DbError::UnknownRow {
                table: "machine",
                row_id: row.row_id,
            })
    }

    /// Inserts the singleton cluster row and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ClusterExists`] when the row already exists.
    pub fn insert_cluster(&mut self) -> Result<Cluster, DbError> {
        if self.tables.cluster.is_some() {
            return Err(DbError::ClusterExists);
        }
        let row = Cluster {
            row_id: self.tables.allocate_row_id(),
            ..Cluster::default()
        };
        self.tables.cluster = Some(row.clone());
        Ok(row)
    }

    /// Reads the singleton cluster row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NoCluster`] when the row has not been inserted.
    pub fn cluster(&self) -> Result<Cluster, DbError> {
        self.tables.cluster.clone().ok_or(DbError::NoCluster)
    }

    /// Writes the cluster row back.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnknownRow`] when the row was never inserted.
    pub fn commit_cluster(&mut self, row: Cluster) -> Result<(), DbError> {
        match &self.tables.cluster {
            Some(existing) if existing.row_id == row.row_id => {
                self.tables.cluster = Some(row);
                Ok(())
            }
            _ => Err(DbError::UnknownRow {
                table: "cluster",
                row_id: row.row_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests;
