//! Cloud-config options attached to machine boots.
//!
//! The core never renders cloud-config text itself. Each driver combines
//! these options with its own template and treats the result as immutable
//! for the machine's lifetime.

use crate::machine::Role;

/// Inputs a driver needs to render the cloud-config for one machine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Options {
    /// Role the minion agent assumes once it registers.
    pub role: Role,
    /// SSH public keys installed for the admin user.
    pub ssh_keys: Vec<String>,
}

impl Options {
    /// Builds options for the given role and key set.
    #[must_use]
    pub const fn new(role: Role, ssh_keys: Vec<String>) -> Self {
        Self { role, ssh_keys }
    }
}
