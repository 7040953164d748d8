//! Lease registry: allocation, lookup, renewal and reclamation of hosts
//!
//! The name map and the port set are one structure behind one `RwLock`, so a
//! port is reserved exactly while some live host holds it. Lookups take the
//! read side; create, remove and sweep take the write side. The lock is never
//! held across I/O.
//!
//! Lookups do not check expiry. A host that has lapsed but not yet been swept
//! keeps resolving until the next sweep, so the grace window is bounded by one
//! sweep interval.

use crate::config::HostsConfig;
use crate::error::RegistryError;
use crate::host::{is_valid_name, Host};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Alphabet for generated host names
const NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random draws before falling back to a sequential name scan
const RANDOM_NAME_ATTEMPTS: usize = 128;

/// Random draws before falling back to a linear port scan
const RANDOM_PORT_ATTEMPTS: usize = 32;

#[derive(Default)]
struct RegistryState {
    hosts: HashMap<String, Arc<Host>>,
    ports: HashSet<u16>,
}

impl RegistryState {
    fn insert(&mut self, host: Arc<Host>) {
        self.ports.insert(host.port());
        self.hosts.insert(host.name().to_string(), host);
    }

    fn release(&mut self, name: &str) -> Option<Arc<Host>> {
        let host = self.hosts.remove(name)?;
        self.ports.remove(&host.port());
        Some(host)
    }
}

/// Owns every live lease.
///
/// Like the other long-lived services it is shared behind an `Arc`;
/// [`new`](HostRegistry::new) returns one directly.
pub struct HostRegistry {
    settings: HostsConfig,
    state: RwLock<RegistryState>,
}

impl HostRegistry {
    pub fn new(settings: HostsConfig) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state: RwLock::new(RegistryState::default()),
        })
    }

    pub fn settings(&self) -> &HostsConfig {
        &self.settings
    }

    /// Virtual hostname for a lease: prefix + name + suffix
    pub fn domain_name(&self, host: &Host) -> String {
        self.settings.domain_name(host.name())
    }

    /// Recover a bare host name from a virtual hostname (without port).
    ///
    /// Matching is case-insensitive; the result is lowercase.
    pub fn name_from_domain(&self, domain_name: &str) -> Option<String> {
        let domain = domain_name.to_ascii_lowercase();
        let prefix = self.settings.domain_prefix.to_ascii_lowercase();
        let suffix = self.settings.domain_suffix.to_ascii_lowercase();

        if domain.len() <= prefix.len() + suffix.len() {
            return None;
        }

        domain
            .strip_prefix(prefix.as_str())?
            .strip_suffix(suffix.as_str())
            .map(String::from)
    }

    /// Resolve a `Host` header value (optionally carrying `:port`) to a lease
    pub fn resolve(&self, domain_name: &str) -> Option<Arc<Host>> {
        let name = self.name_from_domain(strip_port(domain_name.trim()))?;
        self.state.read().hosts.get(&name).cloned()
    }

    /// Look up a lease by bare name. Names are stored lowercase.
    pub fn get(&self, name: &str) -> Option<Arc<Host>> {
        self.state.read().hosts.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Lease a randomly named host on a random free port
    pub fn create(&self) -> Result<Arc<Host>, RegistryError> {
        let mut state = self.state.write();
        let name = self.allocate_name(&state)?;
        self.lease(&mut state, name)
    }

    /// Lease a host under a caller-chosen name. Never replaces an existing lease.
    pub fn create_named(&self, name: &str) -> Result<Arc<Host>, RegistryError> {
        if !is_valid_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        let name = name.to_ascii_lowercase();

        let mut state = self.state.write();
        if state.hosts.contains_key(&name) {
            return Err(RegistryError::NameTaken(name));
        }

        self.lease(&mut state, name)
    }

    fn lease(&self, state: &mut RegistryState, name: String) -> Result<Arc<Host>, RegistryError> {
        let port = self.allocate_port(state)?;
        let host = Arc::new(Host::new(name, port, self.settings.timeout()));
        state.insert(Arc::clone(&host));

        debug!(name = host.name(), port, "Host leased");
        Ok(host)
    }

    /// Random draws first, then the name space in order. The scan stops at the
    /// first free name, which is at most `hosts.len()` steps in.
    fn allocate_name(&self, state: &RegistryState) -> Result<String, RegistryError> {
        let length = self.settings.name_length;

        let mut rng = rand::thread_rng();
        if let Some(name) = (0..RANDOM_NAME_ATTEMPTS)
            .map(|_| random_name(&mut rng, length))
            .find(|name| !state.hosts.contains_key(name))
        {
            return Ok(name);
        }

        (0..name_space(length))
            .map(|index| sequential_name(index, length))
            .find(|name| !state.hosts.contains_key(name))
            .ok_or(RegistryError::NamesExhausted(length))
    }

    fn allocate_port(&self, state: &RegistryState) -> Result<u16, RegistryError> {
        let start = self.settings.port_range_start;
        let end = self.settings.port_range_end;

        if state.ports.len() >= self.settings.port_capacity() {
            return Err(RegistryError::PortsExhausted { start, end });
        }

        let mut rng = rand::thread_rng();
        (0..RANDOM_PORT_ATTEMPTS)
            .map(|_| rng.gen_range(start..end))
            .find(|port| !state.ports.contains(port))
            .or_else(|| (start..end).find(|port| !state.ports.contains(port)))
            .ok_or(RegistryError::PortsExhausted { start, end })
    }

    /// Release a lease and its port.
    ///
    /// Only removes the entry if it is still this very lease, so a stale handle
    /// cannot drop a newer host that reused the name.
    pub fn remove(&self, host: &Host) -> bool {
        let mut state = self.state.write();
        let is_current = state
            .hosts
            .get(host.name())
            .is_some_and(|current| std::ptr::eq(current.as_ref(), host));

        if is_current {
            state.release(host.name());
            debug!(name = host.name(), port = host.port(), "Host removed");
        }
        is_current
    }

    /// Snapshot of all leases, oldest first
    pub fn list(&self) -> Vec<Arc<Host>> {
        let mut hosts: Vec<Arc<Host>> = self.state.read().hosts.values().cloned().collect();
        hosts.sort_by(|a, b| {
            a.create_time()
                .cmp(&b.create_time())
                .then_with(|| a.name().cmp(b.name()))
        });
        hosts
    }

    pub fn len(&self) -> usize {
        self.state.read().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of reserved ports (always equal to `len()`)
    pub fn reserved_ports(&self) -> usize {
        self.state.read().ports.len()
    }

    /// Reclaim every expired lease. Returns the names removed.
    ///
    /// The clock is read once the write lock is held, so a renewal that loses
    /// the race sees a time no earlier than the one the sweep judged by.
    pub fn sweep(&self) -> Vec<String> {
        let mut state = self.state.write();
        Self::sweep_locked(&mut state, Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.state.write();
        Self::sweep_locked(&mut state, now)
    }

    fn sweep_locked(state: &mut RegistryState, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = state
            .hosts
            .values()
            .filter(|host| host.is_expired_at(now))
            .map(|host| host.name().to_string())
            .collect();

        for name in &expired {
            state.release(name);
        }
        expired
    }
}

/// Periodically sweep expired leases until shutdown
pub async fn sweep_loop(registry: Arc<HostRegistry>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(registry.settings().sweep_interval());
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reclaimed = registry.sweep();
                if !reclaimed.is_empty() {
                    info!(count = reclaimed.len(), hosts = ?reclaimed, "Reclaimed expired hosts");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Sweep loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Drop a trailing `:port` from a Host header value
fn strip_port(domain_name: &str) -> &str {
    match domain_name.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => domain_name,
    }
}

fn random_name<R: Rng>(rng: &mut R, length: usize) -> String {
    (0..length)
        .map(|_| char::from(NAME_CHARSET[rng.gen_range(0..NAME_CHARSET.len())]))
        .collect()
}

/// Number of distinct generated names, saturating at `u64::MAX`
fn name_space(length: usize) -> u64 {
    let base = NAME_CHARSET.len() as u64;
    u32::try_from(length)
        .ok()
        .and_then(|exp| base.checked_pow(exp))
        .unwrap_or(u64::MAX)
}

/// `index` written in base 36 over `NAME_CHARSET`, left-padded to `length`
fn sequential_name(mut index: u64, length: usize) -> String {
    let base = NAME_CHARSET.len() as u64;
    let mut name = vec![NAME_CHARSET[0]; length];
    for slot in name.iter_mut().rev() {
        *slot = NAME_CHARSET[(index % base) as usize];
        index /= base;
    }
    name.into_iter().map(char::from).collect()
}
