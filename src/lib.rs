//! Cluster reconciliation core for a multi-cloud workload orchestrator.
//!
//! The crate continuously drives the virtual machines, security ACLs, and
//! floating-IP assignments at each cloud provider towards the desired state
//! held in an in-process relational store. Concrete drivers plug in behind
//! the [`provider::Provider`] contract; the embedding daemon supplies the
//! [`cluster::Environment`] collaborators and hands the loop to
//! [`cluster::run`].

pub mod acl;
pub mod cloudcfg;
pub mod cluster;
pub mod config;
pub mod db;
pub mod join;
pub mod machine;
pub mod provider;
pub mod test_support;

pub use acl::Acl;
pub use cluster::{
    Cluster, ClusterError, Environment, JoinMachine, LaunchLoc, SyncPlan, run, sync_db,
    update_cluster,
};
pub use config::{ConfigError, ControllerConfig};
pub use db::{Conn, DbError, PortRange};
pub use machine::{Machine, Role};
pub use provider::{Provider, ProviderError, ProviderFuture, ProviderKind};
