//! Deployment topology.
//!
//! The topology is the sole owner of server entries, keyed by address:
//! each entry couples that server's connection pool with its monitor.
//! Monitors and dispatchers hold only address handles and look entries up
//! here, so no reference cycle forms between topology, server and pool.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock, Weak},
};

use tokio::sync::watch;

use crate::{
    config::{Address, Config},
    pool::Pool,
    session::ClusterClock,
};

pub mod description;
mod monitor;
pub mod select;

use description::{ServerDescription, ServerKind, TopologyDescription};

/// Handle to the shared topology state.
#[derive(Clone, Debug)]
pub struct Topology {
    shared: Arc<Shared>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    config: Arc<Config>,
    clock: Arc<ClusterClock>,
    inner: RwLock<Inner>,
    /// Bumped on every applied change; selection waits on this.
    changed: watch::Sender<u64>,
}

#[derive(Debug)]
struct Inner {
    description: TopologyDescription,
    entries: HashMap<Address, ServerEntry>,
    version: u64,
}

/// Pool and monitor of one known server.
#[derive(Debug)]
struct ServerEntry {
    pool: Pool,
    monitor: monitor::MonitorHandle,
}

impl Drop for ServerEntry {
    fn drop(&mut self) {
        self.monitor.stop();
    }
}

impl Topology {
    /// Seed the topology and start monitoring.
    pub(crate) fn new(config: Arc<Config>, clock: Arc<ClusterClock>) -> Topology {
        let description = TopologyDescription::new(&config);
        let (changed, _) = watch::channel(0);
        let topology = Topology {
            shared: Arc::new(Shared {
                config,
                clock,
                inner: RwLock::new(Inner {
                    description,
                    entries: HashMap::new(),
                    version: 0,
                }),
                changed,
            }),
        };
        {
            let mut inner = topology.shared.inner.write().unwrap();
            topology.reconcile(&mut inner);
        }
        topology
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Topology {
        Topology { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn config(&self) -> Arc<Config> {
        self.shared.config.clone()
    }

    pub(crate) fn clock(&self) -> &ClusterClock {
        &self.shared.clock
    }

    /// Snapshot of the current description.
    pub fn description(&self) -> TopologyDescription {
        self.shared.inner.read().unwrap().description.clone()
    }

    /// Pool handle of a known server.
    pub(crate) fn pool(&self, address: &Address) -> Option<Pool> {
        let inner = self.shared.inner.read().unwrap();
        inner.entries.get(address).map(|entry| entry.pool.clone())
    }

    /// Subscribe to change notifications.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.changed.subscribe()
    }

    /// Ask every monitor to check now instead of at its next heartbeat.
    pub(crate) fn request_check(&self) {
        let inner = self.shared.inner.read().unwrap();
        for entry in inner.entries.values() {
            entry.monitor.request_check();
        }
    }

    /// Apply one check result and reconcile server entries.
    pub(crate) fn apply(&self, desc: ServerDescription) {
        let address = desc.address.clone();
        let clear = desc.kind == ServerKind::Unknown;

        let mut inner = self.shared.inner.write().unwrap();
        if !inner.description.apply(desc) {
            return;
        }
        if clear {
            if let Some(entry) = inner.entries.get(&address) {
                entry.pool.clear();
            }
        }
        self.reconcile(&mut inner);
        inner.version += 1;
        let version = inner.version;
        drop(inner);

        let _ = self.shared.changed.send(version);
    }

    /// Dispatch or monitor failure path: the server becomes unknown and
    /// its pool generation is bumped.
    pub(crate) fn mark_unknown(&self, address: Address, error: impl Into<String>) {
        self.apply(ServerDescription::unknown_with_error(address, error));
    }

    /// Sync entries with the description's server set.
    fn reconcile(&self, inner: &mut Inner) {
        let known = inner.description.servers.keys().cloned().collect::<Vec<_>>();

        inner.entries.retain(|address, _| known.contains(address));

        for address in known {
            if inner.entries.contains_key(&address) {
                continue;
            }
            let pool = Pool::new(address.clone(), self.shared.config.clone());
            let monitor = monitor::spawn(address.clone(), self.shared.config.clone(), self.downgrade());
            inner.entries.insert(address, ServerEntry { pool, monitor });
        }
    }

    /// Advertised session support of the deployment.
    pub(crate) fn session_timeout_minutes(&self) -> Option<i64> {
        self.shared.inner.read().unwrap().description.session_timeout_minutes
    }

    pub(crate) fn supports_sessions(&self) -> bool {
        self.session_timeout_minutes().is_some()
    }

    /// Stop monitors and drop every entry.
    pub(crate) fn close(&self) {
        let mut inner = self.shared.inner.write().unwrap();
        inner.entries.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn seeds_spawn_entries() {
        let config = Arc::new(Config::parse("mongodb://a:27017,b:27018/?replicaSet=rs0").unwrap());
        let topology = Topology::new(config, Arc::new(ClusterClock::new()));
        let desc = topology.description();
        assert_eq!(desc.servers.len(), 2);
        assert!(topology.pool(&Address::parse("a:27017").unwrap()).is_some());
        assert!(topology.pool(&Address::parse("b:27018").unwrap()).is_some());
        topology.close();
    }

    #[tokio::test]
    async fn change_notification_fires() {
        let config = Arc::new(Config::parse("mongodb://a:27017/?replicaSet=rs0").unwrap());
        let topology = Topology::new(config, Arc::new(ClusterClock::new()));
        let mut changed = topology.subscribe();

        topology.mark_unknown(Address::parse("a:27017").unwrap(), "test");
        changed.changed().await.unwrap();
        assert!(*changed.borrow() >= 1);
        topology.close();
    }
}
