//! Machine records exchanged with cloud provider drivers.

use std::fmt;

use crate::cloudcfg;

/// Cluster role a machine assumes once its minion agent registers.
///
/// Providers do not report roles; a freshly listed machine is [`Role::None`]
/// until the role is recovered through the registration lookup.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Role {
    /// The role is not yet known.
    #[default]
    None,
    /// Runs the cluster control plane.
    Master,
    /// Runs workloads.
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Master => "master",
            Self::Worker => "worker",
        };
        formatter.write_str(name)
    }
}

/// A virtual machine as a provider driver sees it.
///
/// Listings populate `cloud_id` and whatever networking the provider knows
/// about; boot requests leave `cloud_id` empty and carry the desired shape
/// plus the [`cloudcfg::Options`] the driver renders into user data. Empty
/// strings mean "unset" throughout.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Machine {
    /// Provider-assigned identifier, stable for the machine's lifetime.
    pub cloud_id: String,
    /// Public IPv4 address, when assigned.
    pub public_ip: String,
    /// Reassignable floating IP currently attached, when any.
    pub floating_ip: String,
    /// Provider-specific instance size (for example `m4.large`).
    pub size: String,
    /// Root disk size in gigabytes; zero means the provider default.
    pub disk_size: u32,
    /// Whether the machine may be reclaimed by the provider.
    pub preemptible: bool,
    /// SSH public keys granted access.
    pub ssh_keys: Vec<String>,
    /// Options the driver renders into the boot-time cloud-config.
    pub cloudcfg: cloudcfg::Options,
}
