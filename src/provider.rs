//! Capability contract implemented by every cloud provider driver.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::acl::Acl;
use crate::machine::Machine;

/// Opaque identifier naming a provider driver (for example `Amazon`).
///
/// The core only ever compares kinds for equality; everything a kind means
/// lives in the driver the factory resolves it to.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProviderKind(String);

impl ProviderKind {
    /// Wraps a driver name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The underlying name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for ProviderKind {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

/// Errors raised by drivers and the driver factory.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised by the factory for a kind no driver implements.
    #[error("unsupported provider kind `{kind}`")]
    Unsupported {
        /// The unresolvable kind.
        kind: ProviderKind,
    },
    /// Raised when a driver API call fails.
    #[error("{message}")]
    Api {
        /// Driver-supplied description of the failure.
        message: String,
    },
}

impl ProviderError {
    /// API failure with the given message.
    #[must_use]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Uniform capability surface every driver implements.
///
/// An instance is scoped to one namespace and one region. All methods may
/// block on network I/O. Distinct instances may be driven concurrently from
/// distinct tasks; a single instance is only ever driven by one task at a
/// time.
pub trait Provider: Send + Sync {
    /// Lists every machine tagged with the configured namespace in this
    /// instance's region. Listed machines carry a non-empty cloud id; roles
    /// are not reported.
    fn list(&self) -> ProviderFuture<'_, Vec<Machine>>;

    /// Boots every machine in the set, attaching each machine's cloud-config
    /// options. Best-effort and idempotent; an error reports batch failure.
    fn boot(&self, machines: Vec<Machine>) -> ProviderFuture<'_, ()>;

    /// Stops machines by cloud id. Unknown ids are not an error.
    fn stop(&self, machines: Vec<Machine>) -> ProviderFuture<'_, ()>;

    /// Replaces the security rule set for this namespace and region.
    fn set_acls(&self, acls: Vec<Acl>) -> ProviderFuture<'_, ()>;

    /// Sets or clears each machine's floating IP to the supplied value,
    /// keyed by cloud id.
    fn update_floating_ips(&self, machines: Vec<Machine>) -> ProviderFuture<'_, ()>;
}
