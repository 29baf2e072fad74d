//! Reconciliation core: the provider registry, the per-tick loop, and the
//! top-level controller.
//!
//! Each tick reads the desired machines from the store, lists every
//! registered provider concurrently, pairs the two sets per launch
//! location, and dispatches the boot, stop, and floating-IP actions the
//! pairing calls for. Observed attributes are written back into the store
//! so later ticks plan from fresh identities, and the aggregated security
//! rules are replaced on every provider. The controller rebuilds the whole
//! handle, providers included, whenever the cluster row's namespace
//! changes.

mod plan;

pub use plan::{JoinMachine, SyncPlan, sync_db};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::acl::Acl;
use crate::config::ControllerConfig;
use crate::db::{self, Conn, DbError, PortRange};
use crate::machine::{Machine, Role};
use crate::provider::{Provider, ProviderError, ProviderKind};

/// Where a provider instance operates: a driver kind plus one of its
/// regions.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LaunchLoc {
    /// Driver kind.
    pub kind: ProviderKind,
    /// Region; may be empty for drivers without regions.
    pub region: String,
}

impl fmt::Display for LaunchLoc {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.region.is_empty() {
            write!(formatter, "{}", self.kind)
        } else {
            write!(formatter, "{}-{}", self.kind, self.region)
        }
    }
}

/// Collaborators the reconciliation core needs from its embedding.
///
/// Everything behind this trait is replaceable in tests: the driver
/// factory, the region catalogue, the minion registration lookup, and the
/// self-IP resolver.
pub trait Environment: Send + Sync {
    /// Builds a driver for `kind`, scoped to `namespace` and `region`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unsupported`] for a kind with no driver,
    /// which is fatal to the controller, or [`ProviderError::Api`] when
    /// construction fails transiently.
    fn new_provider(
        &self,
        kind: &ProviderKind,
        namespace: &str,
        region: &str,
    ) -> Result<Arc<dyn Provider>, ProviderError>;

    /// Every region `kind` can operate in.
    fn valid_regions(&self, kind: &ProviderKind) -> Vec<String>;

    /// Role the minion agent at `public_ip` registered, or [`Role::None`]
    /// when it has not registered yet.
    fn machine_role(&self, public_ip: &str) -> Role;

    /// Public IP this process is reachable at.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Api`] when discovery fails; the ACL
    /// aggregator then omits the self rule for the tick.
    fn my_ip(&self) -> Result<String, ProviderError>;
}

/// Errors surfaced by the reconciliation loop and controller.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Raised when a provider's machine listing fails; the tick aborts
    /// without writes.
    #[error("list {loc}: {source}")]
    List {
        /// Provider whose listing failed.
        loc: LaunchLoc,
        /// Driver failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when building a provider for a needed launch location fails.
    #[error("build provider {loc}: {source}")]
    Registry {
        /// Location whose driver could not be built.
        loc: LaunchLoc,
        /// Factory failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when a store transaction fails; the tick is skipped.
    #[error(transparent)]
    Db(#[from] DbError),
    /// Raised when the cluster row's namespace no longer matches the
    /// handle mid-tick; the controller rebuilds on its next pass.
    #[error("cluster namespace changed from `{expected}` to `{actual}`")]
    NamespaceChanged {
        /// Namespace the handle was built for.
        expected: String,
        /// Namespace the row holds now.
        actual: String,
    },
}

impl ClusterError {
    /// `true` for configuration errors that must escape the loop rather
    /// than be retried next tick.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Registry {
                source: ProviderError::Unsupported { .. },
                ..
            }
        )
    }
}

/// Desired state read at the start of a tick iteration.
struct Snapshot {
    admin_acls: Vec<String>,
    port_ranges: Vec<PortRange>,
    machines: Vec<db::Machine>,
}

/// What one plan/apply iteration observed and needed.
struct Convergence {
    done: bool,
    needed: BTreeSet<LaunchLoc>,
    admin_acls: Vec<String>,
    port_ranges: Vec<PortRange>,
}

/// Per-provider action batch dispatched after planning.
#[derive(Default)]
struct Actions {
    boot: Vec<Machine>,
    stop: Vec<Machine>,
    update_ips: Vec<Machine>,
}

/// Handle driving one namespace's cloud resources.
///
/// Provider instances are owned by the handle and persist across ticks for
/// as long as the namespace is stable and their launch location stays
/// needed.
pub struct Cluster {
    namespace: String,
    conn: Conn,
    env: Arc<dyn Environment>,
    providers: BTreeMap<LaunchLoc, Arc<dyn Provider>>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Cluster")
            .field("namespace", &self.namespace)
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Creates a handle bound to `namespace` with an empty registry; the
    /// first tick populates it from the desired machine set.
    #[must_use]
    pub fn new(conn: Conn, env: Arc<dyn Environment>, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            conn,
            env,
            providers: BTreeMap::new(),
        }
    }

    /// Namespace this handle was built for.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The provider registered at `loc`, if any. Exposed so tests can
    /// assert instance identity across ticks.
    #[must_use]
    pub fn provider(&self, loc: &LaunchLoc) -> Option<Arc<dyn Provider>> {
        self.providers.get(loc).cloned()
    }

    /// Runs one reconciliation tick.
    ///
    /// A tick converges over at most two plan/apply iterations: applying a
    /// plan changes the cloud (a boot assigns a cloud id), and the second
    /// iteration writes those observations back so the next tick plans
    /// from fresh identities. Afterwards the aggregated security rules are
    /// pushed once to every provider, and launch locations the desired set
    /// no longer needs are retired.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::List`] when any provider listing fails (the
    /// tick aborts with no writes and no ACL push), [`ClusterError::Db`]
    /// when a transaction fails, [`ClusterError::NamespaceChanged`] when
    /// the cluster row moved under the handle, and
    /// [`ClusterError::Registry`] for fatal factory failures.
    pub async fn run_once(&mut self) -> Result<(), ClusterError> {
        let mut outcome = self.converge_once().await?;
        if !outcome.done {
            outcome = self.converge_once().await?;
        }

        let peers = self.conn.machines()?;
        self.sync_acls(&outcome.admin_acls, &outcome.port_ranges, &peers)
            .await;

        self.providers.retain(|loc, _| outcome.needed.contains(loc));
        Ok(())
    }

    /// One plan/apply iteration: read the desired state, list the cloud,
    /// plan, dispatch, and write the observed identities back.
    async fn converge_once(&mut self) -> Result<Convergence, ClusterError> {
        let snapshot = self.read_desired()?;
        let needed = self.needed_locations(&snapshot.machines);
        if let Err(err) = self.ensure_providers(&needed) {
            if err.is_fatal() {
                return Err(err);
            }
            warn!(error = %err, "keeping previous provider registry");
        }

        let cloud = self.list_machines().await?;
        let plan = sync_db(cloud, snapshot.machines);
        let done = plan.is_noop();

        self.apply(&plan).await;
        self.write_back(&plan.pairs)?;
        Ok(Convergence {
            done,
            needed,
            admin_acls: snapshot.admin_acls,
            port_ranges: snapshot.port_ranges,
        })
    }

    /// Replaces every provider's security rules with the aggregate derived
    /// from the admin entries, the declared port ranges, the peers'
    /// public IPs, and this process's own IP.
    pub async fn sync_acls(
        &self,
        admin_acls: &[String],
        port_ranges: &[PortRange],
        machines: &[db::Machine],
    ) {
        let self_ip = match self.env.my_ip() {
            Ok(ip) => Some(ip),
            Err(error) => {
                warn!(%error, "failed to discover own public IP; omitting self rule");
                None
            }
        };
        let acls = aggregate_acls(admin_acls, port_ranges, machines, self_ip.as_deref());

        let mut tasks = JoinSet::new();
        for (loc, provider) in &self.providers {
            let loc = loc.clone();
            let provider = Arc::clone(provider);
            let acls = acls.clone();
            tasks.spawn(async move {
                if let Err(error) = provider.set_acls(acls).await {
                    warn!(
                        kind = %loc.kind,
                        region = %loc.region,
                        operation = "set_acls",
                        %error,
                        "provider call failed",
                    );
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    fn read_desired(&self) -> Result<Snapshot, ClusterError> {
        self.conn.txn(|view| {
            let cluster = view.cluster()?;
            if cluster.namespace != self.namespace {
                return Err(ClusterError::NamespaceChanged {
                    expected: self.namespace.clone(),
                    actual: cluster.namespace,
                });
            }
            Ok(Snapshot {
                admin_acls: cluster.admin_acls,
                port_ranges: cluster.port_ranges,
                machines: view.machines(),
            })
        })
    }

    /// Launch locations the desired set requires: every `(kind, region)`
    /// pair in use, plus every valid region of each kind in use so ACLs
    /// cover regions without a machine currently scheduled there.
    fn needed_locations(&self, desired: &[db::Machine]) -> BTreeSet<LaunchLoc> {
        let mut needed = BTreeSet::new();
        for row in desired {
            needed.insert(LaunchLoc {
                kind: row.kind.clone(),
                region: row.region.clone(),
            });
            for region in self.env.valid_regions(&row.kind) {
                needed.insert(LaunchLoc {
                    kind: row.kind.clone(),
                    region,
                });
            }
        }
        needed
    }

    /// Instantiates missing providers, all or nothing: on any factory
    /// failure the existing registry is left untouched.
    fn ensure_providers(&mut self, needed: &BTreeSet<LaunchLoc>) -> Result<(), ClusterError> {
        let mut created = Vec::new();
        for loc in needed {
            if self.providers.contains_key(loc) {
                continue;
            }
            match self
                .env
                .new_provider(&loc.kind, &self.namespace, &loc.region)
            {
                Ok(provider) => created.push((loc.clone(), provider)),
                Err(source) => {
                    return Err(ClusterError::Registry {
                        loc: loc.clone(),
                        source,
                    });
                }
            }
        }
        for (loc, provider) in created {
            info!(namespace = %self.namespace, location = %loc, "registered provider");
            self.providers.insert(loc, provider);
        }
        Ok(())
    }

    /// Lists every registered provider concurrently and recovers roles
    /// through the minion registration lookup.
    async fn list_machines(&self) -> Result<Vec<JoinMachine>, ClusterError> {
        let mut handles = Vec::new();
        for (loc, provider) in &self.providers {
            let provider = Arc::clone(provider);
            handles.push((
                loc.clone(),
                tokio::spawn(async move { provider.list().await }),
            ));
        }

        let mut machines = Vec::new();
        for (loc, handle) in handles {
            let listed = match handle.await {
                Ok(listed) => listed,
                Err(_) => Err(ProviderError::api("listing task aborted")),
            };
            let listed = listed.map_err(|source| ClusterError::List {
                loc: loc.clone(),
                source,
            })?;
            for machine in listed {
                let role = self.env.machine_role(&machine.public_ip);
                machines.push(JoinMachine {
                    kind: loc.kind.clone(),
                    region: loc.region.clone(),
                    role,
                    machine,
                });
            }
        }
        Ok(machines)
    }

    /// Dispatches the planned actions, one task per provider. Within a
    /// provider the order is boot, then stop, then floating-IP updates.
    /// Failures are logged and replanned next tick.
    async fn apply(&self, plan: &SyncPlan) {
        let mut by_loc: BTreeMap<LaunchLoc, Actions> = BTreeMap::new();
        for machine in &plan.boot {
            by_loc
                .entry(machine.location())
                .or_default()
                .boot
                .push(machine.machine.clone());
        }
        for machine in &plan.stop {
            by_loc
                .entry(machine.location())
                .or_default()
                .stop
                .push(machine.machine.clone());
        }
        for machine in &plan.update_ips {
            by_loc
                .entry(machine.location())
                .or_default()
                .update_ips
                .push(machine.machine.clone());
        }

        let mut tasks = JoinSet::new();
        for (loc, actions) in by_loc {
            let Some(provider) = self.providers.get(&loc).map(Arc::clone) else {
                warn!(location = %loc, "no provider registered for planned actions");
                continue;
            };
            tasks.spawn(async move {
                dispatch(&loc, provider.as_ref(), actions).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Copies observed identities back into the paired desired rows: cloud
    /// id, public IP, and the role once the minion has registered. The
    /// floating IP is not copied; the desired value stays operator-owned
    /// until the provider converges on it.
    fn write_back(&self, pairs: &[(db::Machine, JoinMachine)]) -> Result<(), ClusterError> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.conn.txn(|view| {
            for (row, observed) in pairs {
                let mut row = row.clone();
                row.cloud_id = observed.machine.cloud_id.clone();
                row.public_ip = observed.machine.public_ip.clone();
                if observed.role != Role::None {
                    row.role = observed.role;
                }
                view.commit_machine(row)?;
            }
            Ok(())
        })
    }
}

async fn dispatch(loc: &LaunchLoc, provider: &dyn Provider, actions: Actions) {
    if !actions.boot.is_empty() {
        info!(kind = %loc.kind, region = %loc.region, count = actions.boot.len(), "booting machines");
        if let Err(error) = provider.boot(actions.boot).await {
            warn!(kind = %loc.kind, region = %loc.region, operation = "boot", %error, "provider call failed");
        }
    }
    if !actions.stop.is_empty() {
        info!(kind = %loc.kind, region = %loc.region, count = actions.stop.len(), "stopping machines");
        if let Err(error) = provider.stop(actions.stop).await {
            warn!(kind = %loc.kind, region = %loc.region, operation = "stop", %error, "provider call failed");
        }
    }
    if !actions.update_ips.is_empty() {
        info!(kind = %loc.kind, region = %loc.region, count = actions.update_ips.len(), "updating floating IPs");
        if let Err(error) = provider.update_floating_ips(actions.update_ips).await {
            warn!(kind = %loc.kind, region = %loc.region, operation = "update_floating_ips", %error, "provider call failed");
        }
    }
}

/// De-duplicated rule set, in stable order: admin entries, the self rule,
/// the world-open port ranges, then one rule per peer public IP.
fn aggregate_acls(
    admin_acls: &[String],
    port_ranges: &[PortRange],
    machines: &[db::Machine],
    self_ip: Option<&str>,
) -> Vec<Acl> {
    let mut rules: Vec<Acl> = Vec::new();
    for cidr in admin_acls {
        push_unique(&mut rules, Acl::all_ports(cidr.clone()));
    }
    if let Some(ip) = self_ip {
        push_unique(&mut rules, Acl::all_ports(format!("{ip}/32")));
    }
    for range in port_ranges {
        push_unique(
            &mut rules,
            Acl {
                cidr: String::from("0.0.0.0/0"),
                min_port: range.min,
                max_port: range.max,
            },
        );
    }
    for machine in machines {
        if !machine.public_ip.is_empty() {
            push_unique(&mut rules, Acl::all_ports(format!("{}/32", machine.public_ip)));
        }
    }
    rules
}

fn push_unique(rules: &mut Vec<Acl>, rule: Acl) {
    if !rules.contains(&rule) {
        rules.push(rule);
    }
}

/// Reconciles the handle with the current cluster row and runs one tick.
///
/// A missing cluster row yields no handle. A namespace change drops the old
/// handle, its providers with it, and builds a fresh one; otherwise the
/// existing handle (and its provider instances) is reused unchanged.
///
/// # Errors
///
/// Returns fatal configuration errors. Transient tick failures are logged
/// and the handle is still returned for the next pass.
pub async fn update_cluster(
    conn: &Conn,
    env: &Arc<dyn Environment>,
    current: Option<Cluster>,
) -> Result<Option<Cluster>, ClusterError> {
    let row = match conn.cluster() {
        Ok(row) => row,
        Err(DbError::NoCluster) => return Ok(None),
        Err(err) => return Err(ClusterError::Db(err)),
    };

    let mut cluster = match current {
        Some(cluster) if cluster.namespace() == row.namespace => cluster,
        _ => {
            info!(namespace = %row.namespace, "building cluster handle");
            Cluster::new(conn.clone(), Arc::clone(env), row.namespace)
        }
    };

    match cluster.run_once().await {
        Ok(()) => {}
        Err(err) if err.is_fatal() => return Err(err),
        Err(error) => warn!(%error, "reconciliation tick failed"),
    }
    Ok(Some(cluster))
}

/// Long-lived controller worker.
///
/// Invokes [`update_cluster`] once per tick and sleeps the configured
/// interval in between. Shutdown is cooperative: when `stop` flips to
/// `true` (or its sender is dropped) the loop finishes the current tick
/// and returns.
///
/// # Errors
///
/// Propagates fatal configuration errors from [`update_cluster`].
pub async fn run(
    conn: Conn,
    config: ControllerConfig,
    env: Arc<dyn Environment>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ClusterError> {
    let mut handle = None;
    loop {
        handle = update_cluster(&conn, &env, handle).await?;
        if *stop.borrow() {
            return Ok(());
        }
        tokio::select! {
            () = sleep(config.poll_interval()) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return Ok(());
                }
            }
        }
    }
}
