//! Test support utilities shared across unit and integration tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::acl::Acl;
use crate::cluster::Environment;
use crate::machine::{Machine, Role};
use crate::provider::{Provider, ProviderError, ProviderFuture, ProviderKind};

/// Minion role registrations shared between fake providers and the fake
/// environment, keyed by public IP.
type SharedRoles = Arc<Mutex<BTreeMap<String, Role>>>;

/// Boot request recorded by [`FakeProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootRequest {
    /// Size of the booted machine.
    pub size: String,
    /// Cloud-config text the fake driver would have attached.
    pub cloud_config: String,
}

/// Floating-IP update recorded by [`FakeProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IpRequest {
    /// Size of the updated machine.
    pub size: String,
    /// Cloud-config text the fake driver would have attached.
    pub cloud_config: String,
    /// Address assigned, or empty when cleared.
    pub ip: String,
}

#[derive(Debug, Default)]
struct FakeProviderState {
    machines: BTreeMap<String, Machine>,
    id_counter: u32,
    boot_requests: Vec<BootRequest>,
    stop_requests: Vec<String>,
    ip_requests: Vec<IpRequest>,
    acl_requests: Vec<Acl>,
    list_error: Option<ProviderError>,
}

/// In-memory provider that records every request.
///
/// Boots assign sequential cloud ids and reuse the id as the public IP. The
/// booted role is registered in the shared role map but never reported by
/// `list`, simulating a role that only becomes visible once the machine's
/// minion agent registers.
#[derive(Clone, Debug)]
pub struct FakeProvider {
    namespace: String,
    cloud_config: String,
    roles: SharedRoles,
    state: Arc<Mutex<FakeProviderState>>,
}

impl FakeProvider {
    fn new(namespace: &str, cloud_config: String, roles: SharedRoles) -> Self {
        Self {
            namespace: namespace.to_owned(),
            cloud_config,
            roles,
            state: Arc::new(Mutex::new(FakeProviderState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeProviderState> {
        self.state.lock().expect("fake provider state lock")
    }

    /// Namespace the provider was built for.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Machines the fake currently believes exist.
    #[must_use]
    pub fn machines(&self) -> Vec<Machine> {
        self.lock().machines.values().cloned().collect()
    }

    /// Boot requests recorded since the last [`Self::clear_logs`].
    #[must_use]
    pub fn boot_requests(&self) -> Vec<BootRequest> {
        self.lock().boot_requests.clone()
    }

    /// Cloud ids stopped since the last [`Self::clear_logs`].
    #[must_use]
    pub fn stop_requests(&self) -> Vec<String> {
        self.lock().stop_requests.clone()
    }

    /// Floating-IP updates recorded since the last [`Self::clear_logs`].
    #[must_use]
    pub fn ip_requests(&self) -> Vec<IpRequest> {
        self.lock().ip_requests.clone()
    }

    /// Rule set most recently pushed through `set_acls`.
    #[must_use]
    pub fn acl_requests(&self) -> Vec<Acl> {
        self.lock().acl_requests.clone()
    }

    /// Forgets every recorded request.
    pub fn clear_logs(&self) {
        let mut state = self.lock();
        state.boot_requests.clear();
        state.stop_requests.clear();
        state.ip_requests.clear();
        state.acl_requests.clear();
    }

    /// Makes subsequent `list` calls fail with `error`, or succeed again
    /// when `None`.
    pub fn set_list_error(&self, error: Option<ProviderError>) {
        self.lock().list_error = error;
    }

    fn boot_sync(&self, machines: Vec<Machine>) {
        let mut state = self.lock();
        for mut machine in machines {
            state.id_counter += 1;
            let id = state.id_counter.to_string();
            machine.cloud_id = id.clone();
            machine.public_ip = id.clone();

            self.roles
                .lock()
                .expect("role registration lock")
                .insert(machine.public_ip.clone(), machine.cloudcfg.role);
            machine.cloudcfg.role = Role::None;

            state.boot_requests.push(BootRequest {
                size: machine.size.clone(),
                cloud_config: self.cloud_config.clone(),
            });
            state.machines.insert(id, machine);
        }
    }
}

impl Provider for FakeProvider {
    fn list(&self) -> ProviderFuture<'_, Vec<Machine>> {
        Box::pin(async move {
            let state = self.lock();
            if let Some(error) = &state.list_error {
                return Err(error.clone());
            }
            Ok(state.machines.values().cloned().collect())
        })
    }

    fn boot(&self, machines: Vec<Machine>) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            self.boot_sync(machines);
            Ok(())
        })
    }

    fn stop(&self, machines: Vec<Machine>) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            for machine in machines {
                state.machines.remove(&machine.cloud_id);
                state.stop_requests.push(machine.cloud_id);
            }
            Ok(())
        })
    }

    fn set_acls(&self, acls: Vec<Acl>) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            self.lock().acl_requests = acls;
            Ok(())
        })
    }

    fn update_floating_ips(&self, machines: Vec<Machine>) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            for machine in machines {
                state.ip_requests.push(IpRequest {
                    size: machine.size.clone(),
                    cloud_config: self.cloud_config.clone(),
                    ip: machine.floating_ip.clone(),
                });
                state.machines.insert(machine.cloud_id.clone(), machine);
            }
            Ok(())
        })
    }
}

/// Environment fake wiring [`FakeProvider`]s into the controller.
///
/// Knows a fixed set of driver kinds, each with the cloud-config text its
/// fake would attach; any other kind is unsupported. Every instantiated
/// provider is retained for inspection.
#[derive(Clone, Debug)]
pub struct FakeEnvironment {
    kinds: BTreeMap<ProviderKind, String>,
    regions: Vec<String>,
    self_ip: Option<String>,
    roles: SharedRoles,
    providers: Arc<Mutex<Vec<FakeProvider>>>,
    factory_error: Arc<Mutex<Option<ProviderError>>>,
}

impl FakeEnvironment {
    /// Creates an environment supporting the given `(kind, cloud config)`
    /// pairs, with a single valid region shared by every kind.
    #[must_use]
    pub fn new(kinds: &[(&str, &str)], region: &str) -> Self {
        Self {
            kinds: kinds
                .iter()
                .map(|(kind, config)| (ProviderKind::new(*kind), (*config).to_owned()))
                .collect(),
            regions: vec![region.to_owned()],
            self_ip: None,
            roles: Arc::new(Mutex::new(BTreeMap::new())),
            providers: Arc::new(Mutex::new(Vec::new())),
            factory_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Replaces the valid-region catalogue shared by every kind.
    #[must_use]
    pub fn with_regions(mut self, regions: &[&str]) -> Self {
        self.regions = regions.iter().map(|region| (*region).to_owned()).collect();
        self
    }

    /// Makes `my_ip` resolve to `ip` instead of failing.
    #[must_use]
    pub fn with_self_ip(mut self, ip: &str) -> Self {
        self.self_ip = Some(ip.to_owned());
        self
    }

    /// Every provider instantiated so far, oldest first.
    #[must_use]
    pub fn providers(&self) -> Vec<FakeProvider> {
        self.providers.lock().expect("provider list lock").clone()
    }

    /// How many providers the factory has built.
    #[must_use]
    pub fn provider_count(&self) -> usize {
        self.providers.lock().expect("provider list lock").len()
    }

    /// Makes the factory fail with `error` until cleared.
    pub fn set_factory_error(&self, error: Option<ProviderError>) {
        *self.factory_error.lock().expect("factory error lock") = error;
    }
}

impl Environment for FakeEnvironment {
    fn new_provider(
        &self,
        kind: &ProviderKind,
        namespace: &str,
        _region: &str,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        if let Some(error) = self.factory_error.lock().expect("factory error lock").clone() {
            return Err(error);
        }
        let Some(cloud_config) = self.kinds.get(kind) else {
            return Err(ProviderError::Unsupported { kind: kind.clone() });
        };
        let provider = FakeProvider::new(namespace, cloud_config.clone(), Arc::clone(&self.roles));
        self.providers
            .lock()
            .expect("provider list lock")
            .push(provider.clone());
        Ok(Arc::new(provider))
    }

    fn valid_regions(&self, _kind: &ProviderKind) -> Vec<String> {
        self.regions.clone()
    }

    fn machine_role(&self, public_ip: &str) -> Role {
        self.roles
            .lock()
            .expect("role registration lock")
            .get(public_ip)
            .copied()
            .unwrap_or(Role::None)
    }

    fn my_ip(&self) -> Result<String, ProviderError> {
        self.self_ip
            .clone()
            .ok_or_else(|| ProviderError::api("self IP unavailable"))
    }
}
