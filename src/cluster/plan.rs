//! Per-tick planning: pair desired rows with observed machines and derive
//! the boot, stop, and floating-IP actions.

use std::collections::BTreeMap;

use crate::cloudcfg;
use crate::db;
use crate::join;
use crate::machine::{Machine, Role};
use crate::provider::ProviderKind;

use super::LaunchLoc;

/// Unified tuple the planner scores on: the provider identity plus every
/// attribute of either side. Observed listings have `cloud_id` set and the
/// role recovered from the registration lookup; boot entries have neither.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JoinMachine {
    /// Driver the machine belongs to.
    pub kind: ProviderKind,
    /// Region the machine runs in.
    pub region: String,
    /// Recovered role; [`Role::None`] until the minion registers.
    pub role: Role,
    /// Provider-side attributes.
    pub machine: Machine,
}

impl JoinMachine {
    /// Launch location this machine belongs to.
    #[must_use]
    pub fn location(&self) -> LaunchLoc {
        LaunchLoc {
            kind: self.kind.clone(),
            region: self.region.clone(),
        }
    }
}

/// Actions required to drive the cloud towards the database, plus the
/// matched pairs the loop writes back.
#[derive(Clone, Debug, Default)]
pub struct SyncPlan {
    /// Unmatched desired rows, ready to boot.
    pub boot: Vec<JoinMachine>,
    /// Observed machines no desired row claims.
    pub stop: Vec<JoinMachine>,
    /// Floating-IP corrections: the observed machine carrying the desired
    /// address.
    pub update_ips: Vec<JoinMachine>,
    /// Matched (desired row, observed machine) pairs.
    pub pairs: Vec<(db::Machine, JoinMachine)>,
}

impl SyncPlan {
    /// `true` when the tick has no cloud work left.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.boot.is_empty() && self.stop.is_empty() && self.update_ips.is_empty()
    }
}

/// Mismatch flags compared lexicographically; lower is better. Cloud-id
/// identity outranks a public-IP match, which outranks size and role
/// agreement, which outrank the floating IP.
type Score = (u8, u8, u8, u8, u8);

fn score(desired: &db::Machine, observed: &JoinMachine) -> Option<Score> {
    let machine = &observed.machine;
    if desired.kind != observed.kind || desired.region != observed.region {
        return None;
    }
    if desired.preemptible != machine.preemptible || desired.disk_size != machine.disk_size {
        return None;
    }
    if !desired.size.is_empty() && !machine.size.is_empty() && desired.size != machine.size {
        return None;
    }
    if desired.role != Role::None && observed.role != Role::None && desired.role != observed.role {
        return None;
    }

    let cloud_id = u8::from(!desired.cloud_id.is_empty() && desired.cloud_id != machine.cloud_id);
    let public_ip =
        u8::from(!desired.public_ip.is_empty() && desired.public_ip != machine.public_ip);
    let size = u8::from(desired.size != machine.size);
    let role = u8::from(!(desired.role != Role::None && desired.role == observed.role));
    let floating_ip = u8::from(desired.floating_ip != machine.floating_ip);
    Some((cloud_id, public_ip, size, role, floating_ip))
}

/// Plans one tick.
///
/// Both sides are partitioned by `(kind, region)` and joined per group, so
/// machines can never pair across providers or regions. Groups are visited
/// in first-appearance order (desired rows first) to keep action ordering
/// deterministic.
///
/// A floating-IP update is only emitted for a pair whose desired row
/// already carries a cloud id: a freshly booted machine has not had its id
/// written back yet, and asking the provider to attach an address to it
/// would race the boot. The update is picked up one pass later instead.
#[must_use]
pub fn sync_db(cloud: Vec<JoinMachine>, desired: Vec<db::Machine>) -> SyncPlan {
    let mut order: Vec<LaunchLoc> = Vec::new();
    let mut groups: BTreeMap<LaunchLoc, (Vec<db::Machine>, Vec<JoinMachine>)> = BTreeMap::new();

    for row in desired {
        let loc = LaunchLoc {
            kind: row.kind.clone(),
            region: row.region.clone(),
        };
        if !groups.contains_key(&loc) {
            order.push(loc.clone());
        }
        groups.entry(loc).or_default().0.push(row);
    }
    for machine in cloud {
        let loc = machine.location();
        if !groups.contains_key(&loc) {
            order.push(loc.clone());
        }
        groups.entry(loc).or_default().1.push(machine);
    }

    let mut plan = SyncPlan::default();
    for loc in order {
        if let Some((rows, machines)) = groups.remove(&loc) {
            plan_group(rows, machines, &mut plan);
        }
    }
    plan
}

fn plan_group(desired: Vec<db::Machine>, observed: Vec<JoinMachine>, plan: &mut SyncPlan) {
    let result = join::join(desired, observed, score);

    for pair in &result.pairs {
        let row = &pair.left;
        let machine = &pair.right;
        if !row.cloud_id.is_empty() && row.floating_ip != machine.machine.floating_ip {
            let mut update = machine.clone();
            update.machine.floating_ip = row.floating_ip.clone();
            plan.update_ips.push(update);
        }
    }

    for row in result.only_left {
        plan.boot.push(boot_machine(&row));
    }
    plan.stop.extend(result.only_right);
    plan.pairs.extend(result.pairs.into_iter().map(|pair| {
        assert!(
            pair.left.kind == pair.right.kind && pair.left.region == pair.right.region,
            "paired machines disagree on launch location"
        );
        (pair.left, pair.right)
    }));
}

fn boot_machine(row: &db::Machine) -> JoinMachine {
    JoinMachine {
        kind: row.kind.clone(),
        region: row.region.clone(),
        role: Role::None,
        machine: Machine {
            size: row.size.clone(),
            disk_size: row.disk_size,
            preemptible: row.preemptible,
            ssh_keys: row.ssh_keys.clone(),
            cloudcfg: cloudcfg::Options::new(row.role, row.ssh_keys.clone()),
            ..Machine::default()
        },
    }
}
