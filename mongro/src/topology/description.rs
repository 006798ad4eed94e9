//! Server and topology descriptions, with the discovery transition rules.
use std::{collections::HashMap, time::Duration, time::Instant};

use crate::{
    bson::{DateTime, Document, ObjectId},
    config::{Address, Config},
    connection::HelloResponse,
};

/// Wire versions this driver can speak.
pub const DRIVER_MIN_WIRE_VERSION: i32 = 6;
pub const DRIVER_MAX_WIRE_VERSION: i32 = 21;

/// Smoothing factor for the round trip time moving average.
const RTT_ALPHA: f64 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerKind {
    Unknown,
    Standalone,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    RsOther,
    RsGhost,
    Mongos,
    LoadBalancer,
}

impl ServerKind {
    /// Whether the server holds data and serves reads.
    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self,
            Self::Standalone | Self::RsPrimary | Self::RsSecondary | Self::Mongos | Self::LoadBalancer,
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyKind {
    Unknown,
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    LoadBalanced,
}

/// Inclusive wire version range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionRange {
    pub min: i32,
    pub max: i32,
}

impl VersionRange {
    /// Whether the driver's supported range overlaps this one.
    pub fn overlaps_driver(&self) -> bool {
        self.min <= DRIVER_MAX_WIRE_VERSION && self.max >= DRIVER_MIN_WIRE_VERSION
    }
}

/// The driver's view of one server.
#[derive(Clone, Debug)]
pub struct ServerDescription {
    pub address: Address,
    pub kind: ServerKind,
    pub tags: Vec<(String, String)>,
    pub wire_version: Option<VersionRange>,
    pub average_rtt: Option<Duration>,
    pub last_update_time: Instant,
    pub last_write_date: Option<DateTime>,
    pub election_id: Option<ObjectId>,
    pub set_version: Option<i64>,
    pub set_name: Option<String>,
    pub session_timeout_minutes: Option<i64>,
    pub topology_version: Option<Document>,
    pub hosts: Vec<Address>,
    pub passives: Vec<Address>,
    pub arbiters: Vec<Address>,
    pub primary: Option<Address>,
    /// Why the server is unknown, when it is.
    pub error: Option<String>,
}

impl ServerDescription {
    /// An unseen or unreachable server carries nothing.
    pub fn unknown(address: Address) -> ServerDescription {
        ServerDescription {
            address,
            kind: ServerKind::Unknown,
            tags: Vec::new(),
            wire_version: None,
            average_rtt: None,
            last_update_time: Instant::now(),
            last_write_date: None,
            election_id: None,
            set_version: None,
            set_name: None,
            session_timeout_minutes: None,
            topology_version: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            primary: None,
            error: None,
        }
    }

    pub fn unknown_with_error(address: Address, error: impl Into<String>) -> ServerDescription {
        let mut desc = Self::unknown(address);
        desc.error = Some(error.into());
        desc
    }

    /// Build a description from a `hello` reply.
    ///
    /// `previous_rtt` feeds the moving average; `rtt` is this check's
    /// sample.
    pub fn from_hello(
        address: Address,
        hello: &HelloResponse,
        rtt: Duration,
        previous_rtt: Option<Duration>,
    ) -> ServerDescription {
        let mut desc = Self::unknown(address);
        if !hello.ok {
            desc.error = Some("hello returned ok: 0".into());
            return desc;
        }

        desc.kind = if hello.msg.as_deref() == Some("isdbgrid") {
            ServerKind::Mongos
        } else if hello.is_replica_set_ghost {
            ServerKind::RsGhost
        } else if hello.set_name.is_some() {
            if hello.is_writable_primary {
                ServerKind::RsPrimary
            } else if hello.secondary && !hello.hidden {
                ServerKind::RsSecondary
            } else if hello.arbiter_only {
                ServerKind::RsArbiter
            } else {
                ServerKind::RsOther
            }
        } else if hello.service_id.is_some() {
            ServerKind::LoadBalancer
        } else {
            ServerKind::Standalone
        };

        desc.tags = hello.tags.clone();
        desc.wire_version = Some(VersionRange {
            min: hello.min_wire_version,
            max: hello.max_wire_version,
        });
        desc.average_rtt = Some(match previous_rtt {
            Some(previous) => ewma(rtt, previous),
            None => rtt,
        });
        desc.last_write_date = hello.last_write_date;
        desc.election_id = hello.election_id;
        desc.set_version = hello.set_version;
        desc.set_name = hello.set_name.clone();
        desc.session_timeout_minutes = hello.logical_session_timeout_minutes;
        desc.topology_version = hello.topology_version.clone();
        desc.hosts = hello.hosts.clone();
        desc.passives = hello.passives.clone();
        desc.arbiters = hello.arbiters.clone();
        desc.primary = hello.primary.clone();
        desc
    }

    /// Member addresses this server believes are in the set.
    pub fn known_peers(&self) -> impl Iterator<Item = &Address> {
        self.hosts.iter().chain(&self.passives).chain(&self.arbiters)
    }
}

/// Exponentially weighted moving average of round trip samples.
fn ewma(sample: Duration, previous: Duration) -> Duration {
    Duration::from_secs_f64(
        RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * previous.as_secs_f64(),
    )
}

/// The driver's view of the deployment.
#[derive(Clone, Debug)]
pub struct TopologyDescription {
    pub kind: TopologyKind,
    pub set_name: Option<String>,
    pub max_election_id: Option<ObjectId>,
    pub max_set_version: Option<i64>,
    pub servers: HashMap<Address, ServerDescription>,
    /// Min over all data-bearing servers; `None` when any lacks it.
    pub session_timeout_minutes: Option<i64>,
    /// Set when any server's wire range misses the driver's.
    pub compatibility_error: Option<String>,
}

impl TopologyDescription {
    /// Initial description from the seed list.
    pub fn new(config: &Config) -> TopologyDescription {
        let kind = if config.direct_connection {
            TopologyKind::Single
        } else if config.replica_set.is_some() {
            TopologyKind::ReplicaSetNoPrimary
        } else {
            TopologyKind::Unknown
        };
        let servers = config
            .hosts
            .iter()
            .map(|addr| (addr.clone(), ServerDescription::unknown(addr.clone())))
            .collect();
        TopologyDescription {
            kind,
            set_name: config.replica_set.clone(),
            max_election_id: None,
            max_set_version: None,
            servers,
            session_timeout_minutes: None,
            compatibility_error: None,
        }
    }

    /// Apply one check result, running the discovery transition rules.
    ///
    /// Returns `true` when anything changed. A description for an address
    /// no longer in the map is stale and ignored.
    pub fn apply(&mut self, desc: ServerDescription) -> bool {
        if !self.servers.contains_key(&desc.address) {
            return false;
        }

        match self.kind {
            TopologyKind::Single | TopologyKind::LoadBalanced => {
                self.servers.insert(desc.address.clone(), desc);
            }
            TopologyKind::Sharded => self.apply_to_sharded(desc),
            TopologyKind::Unknown => self.apply_to_unknown(desc),
            TopologyKind::ReplicaSetNoPrimary | TopologyKind::ReplicaSetWithPrimary => {
                self.apply_to_replica_set(desc)
            }
        }

        self.recompute();
        true
    }

    fn apply_to_unknown(&mut self, desc: ServerDescription) {
        match desc.kind {
            ServerKind::Standalone => {
                if self.servers.len() == 1 {
                    self.kind = TopologyKind::Single;
                    self.servers.insert(desc.address.clone(), desc);
                } else {
                    // standalone seeded among many cannot participate
                    self.servers.remove(&desc.address);
                }
            }
            ServerKind::Mongos => {
                self.kind = TopologyKind::Sharded;
                self.apply_to_sharded(desc);
            }
            ServerKind::RsPrimary
            | ServerKind::RsSecondary
            | ServerKind::RsArbiter
            | ServerKind::RsOther => {
                self.kind = TopologyKind::ReplicaSetNoPrimary;
                self.apply_to_replica_set(desc);
            }
            ServerKind::LoadBalancer => {
                self.kind = TopologyKind::LoadBalanced;
                self.servers.insert(desc.address.clone(), desc);
            }
            // ghosts and unknowns leave the topology undecided
            ServerKind::RsGhost | ServerKind::Unknown => {
                self.servers.insert(desc.address.clone(), desc);
            }
        }
    }

    fn apply_to_sharded(&mut self, desc: ServerDescription) {
        match desc.kind {
            ServerKind::Mongos | ServerKind::Unknown => {
                self.servers.insert(desc.address.clone(), desc);
            }
            // anything else does not belong behind a router list
            _ => {
                self.servers.remove(&desc.address);
            }
        }
    }

    fn apply_to_replica_set(&mut self, desc: ServerDescription) {
        match desc.kind {
            ServerKind::RsPrimary => self.apply_primary(desc),
            ServerKind::RsSecondary | ServerKind::RsArbiter | ServerKind::RsOther => {
                if self.set_name_disagrees(&desc) {
                    self.servers.remove(&desc.address);
                } else {
                    if self.set_name.is_none() {
                        self.set_name = desc.set_name.clone();
                    }
                    // secondaries only add peers, the primary prunes
                    for peer in desc.known_peers().cloned().collect::<Vec<_>>() {
                        self.servers
                            .entry(peer.clone())
                            .or_insert_with(|| ServerDescription::unknown(peer));
                    }
                    self.servers.insert(desc.address.clone(), desc);
                }
            }
            ServerKind::Unknown | ServerKind::RsGhost => {
                self.servers.insert(desc.address.clone(), desc);
            }
            // standalones and routers do not belong in a replica set
            _ => {
                self.servers.remove(&desc.address);
            }
        }

        self.kind = match self
            .servers
            .values()
            .any(|s| s.kind == ServerKind::RsPrimary)
        {
            true => TopologyKind::ReplicaSetWithPrimary,
            false => TopologyKind::ReplicaSetNoPrimary,
        };
    }

    fn apply_primary(&mut self, desc: ServerDescription) {
        if self.set_name_disagrees(&desc) {
            self.servers.remove(&desc.address);
            return;
        }
        if self.set_name.is_none() {
            self.set_name = desc.set_name.clone();
        }

        // an election the cluster has moved past demotes the claimant
        if stale_claim(
            (desc.set_version, desc.election_id),
            (self.max_set_version, self.max_election_id),
        ) {
            let unknown = ServerDescription::unknown(desc.address.clone());
            self.servers.insert(desc.address.clone(), unknown);
            return;
        }
        if desc.set_version.is_some() || desc.election_id.is_some() {
            self.max_set_version = desc.set_version.or(self.max_set_version);
            self.max_election_id = desc.election_id.or(self.max_election_id);
        }

        // a new primary invalidates any prior one pending its own re-check
        let previous = self
            .servers
            .iter()
            .filter(|(addr, s)| s.kind == ServerKind::RsPrimary && **addr != desc.address)
            .map(|(addr, _)| addr.clone())
            .collect::<Vec<_>>();
        for addr in previous {
            let unknown = ServerDescription::unknown(addr.clone());
            self.servers.insert(addr, unknown);
        }

        // the primary's member list is authoritative
        let peers = desc.known_peers().cloned().collect::<Vec<_>>();
        for peer in &peers {
            self.servers
                .entry(peer.clone())
                .or_insert_with(|| ServerDescription::unknown(peer.clone()));
        }
        let address = desc.address.clone();
        self.servers
            .retain(|addr, _| *addr == address || peers.contains(addr));

        self.servers.insert(desc.address.clone(), desc);
    }

    fn set_name_disagrees(&self, desc: &ServerDescription) -> bool {
        match (&self.set_name, &desc.set_name) {
            (Some(ours), Some(theirs)) => ours != theirs,
            _ => false,
        }
    }

    fn recompute(&mut self) {
        let data_bearing = self
            .servers
            .values()
            .filter(|s| s.kind.is_data_bearing())
            .collect::<Vec<_>>();
        self.session_timeout_minutes = match data_bearing.is_empty() {
            true => None,
            false => data_bearing
                .iter()
                .map(|s| s.session_timeout_minutes)
                .min()
                .flatten(),
        };

        self.compatibility_error = self.servers.values().find_map(|s| {
            let range = s.wire_version?;
            (!range.overlaps_driver()).then(|| {
                format!(
                    "server {} wire versions {}..={} do not overlap driver {}..={}",
                    s.address, range.min, range.max, DRIVER_MIN_WIRE_VERSION, DRIVER_MAX_WIRE_VERSION,
                )
            })
        });
    }

    /// The current primary, if known.
    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers.values().find(|s| s.kind == ServerKind::RsPrimary)
    }
}

/// Whether a primary claim `(setVersion, electionId)` is older than the
/// maximum already observed, lexicographically.
fn stale_claim(
    claim: (Option<i64>, Option<ObjectId>),
    max: (Option<i64>, Option<ObjectId>),
) -> bool {
    match (claim.0, max.0) {
        (Some(claim_version), Some(max_version)) => {
            if claim_version != max_version {
                return claim_version < max_version;
            }
            matches!((claim.1, max.1), (Some(c), Some(m)) if c < m)
        }
        _ => matches!((claim.1, max.1), (Some(c), Some(m)) if c < m),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    fn address(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn rs_config() -> Config {
        Config::parse("mongodb://a:27017,b:27017,c:27017/?replicaSet=rs0").unwrap()
    }

    fn member(addr: &str, primary: bool) -> ServerDescription {
        let hello = HelloResponse {
            ok: true,
            is_writable_primary: primary,
            secondary: !primary,
            set_name: Some("rs0".into()),
            hosts: vec![address("a:27017"), address("b:27017"), address("c:27017")],
            min_wire_version: 6,
            max_wire_version: 17,
            logical_session_timeout_minutes: Some(30),
            ..HelloResponse::default()
        };
        ServerDescription::from_hello(address(addr), &hello, Duration::from_millis(5), None)
    }

    #[test]
    fn at_most_one_primary() {
        let mut topo = TopologyDescription::new(&rs_config());
        topo.apply(member("a:27017", true));
        assert_eq!(topo.kind, TopologyKind::ReplicaSetWithPrimary);

        topo.apply(member("b:27017", true));
        let primaries = topo
            .servers
            .values()
            .filter(|s| s.kind == ServerKind::RsPrimary)
            .count();
        assert_eq!(primaries, 1);
        assert_eq!(topo.primary().unwrap().address, address("b:27017"));
        // the old primary awaits its own re-check
        assert_eq!(topo.servers[&address("a:27017")].kind, ServerKind::Unknown);
    }

    #[test]
    fn wrong_set_name_never_admitted() {
        let mut topo = TopologyDescription::new(&rs_config());
        let mut stranger = member("b:27017", false);
        stranger.set_name = Some("other".into());
        topo.apply(stranger);
        assert!(!topo.servers.contains_key(&address("b:27017")));
    }

    #[test]
    fn stale_election_demoted() {
        let mut topo = TopologyDescription::new(&rs_config());

        let mut new_primary = member("a:27017", true);
        new_primary.set_version = Some(2);
        new_primary.election_id = Some(ObjectId::from_bytes([2; 12]));
        topo.apply(new_primary);

        let mut old_primary = member("b:27017", true);
        old_primary.set_version = Some(1);
        old_primary.election_id = Some(ObjectId::from_bytes([1; 12]));
        topo.apply(old_primary);

        // the stale claimant is unknown, the real primary stands
        assert_eq!(topo.servers[&address("b:27017")].kind, ServerKind::Unknown);
        assert_eq!(topo.primary().unwrap().address, address("a:27017"));
    }

    #[test]
    fn primary_member_list_prunes() {
        let mut topo = TopologyDescription::new(&rs_config());
        let mut primary = member("a:27017", true);
        primary.hosts = vec![address("a:27017"), address("b:27017")];
        topo.apply(primary);
        // c dropped, a and b remain
        assert!(!topo.servers.contains_key(&address("c:27017")));
        assert_eq!(topo.servers.len(), 2);
    }

    #[test]
    fn all_unknown_is_no_primary() {
        let mut topo = TopologyDescription::new(&rs_config());
        topo.apply(member("a:27017", true));
        topo.apply(ServerDescription::unknown_with_error(address("a:27017"), "refused"));
        assert_eq!(topo.kind, TopologyKind::ReplicaSetNoPrimary);
    }

    #[test]
    fn session_timeout_is_min_over_data_bearing() {
        let mut topo = TopologyDescription::new(&rs_config());
        let mut a = member("a:27017", true);
        a.session_timeout_minutes = Some(30);
        let mut b = member("b:27017", false);
        b.session_timeout_minutes = Some(10);
        topo.apply(a);
        topo.apply(b);
        assert_eq!(topo.session_timeout_minutes, Some(10));

        let mut c = member("c:27017", false);
        c.session_timeout_minutes = None;
        topo.apply(c);
        assert_eq!(topo.session_timeout_minutes, None);
    }

    #[test]
    fn incompatible_wire_range() {
        let mut topo = TopologyDescription::new(&rs_config());
        let mut ancient = member("a:27017", false);
        ancient.wire_version = Some(VersionRange { min: 0, max: 3 });
        topo.apply(ancient);
        assert!(topo.compatibility_error.is_some());
    }

    #[test]
    fn random_hello_order_holds_invariants() {
        use rand::seq::SliceRandom;
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut events = vec![
                member("a:27017", true),
                member("b:27017", true),
                member("c:27017", false),
                ServerDescription::unknown_with_error(address("a:27017"), "io"),
                member("b:27017", false),
                member("a:27017", true),
            ];
            events.shuffle(&mut rng);

            let mut topo = TopologyDescription::new(&rs_config());
            for event in events {
                topo.apply(event);
                let primaries = topo
                    .servers
                    .values()
                    .filter(|s| s.kind == ServerKind::RsPrimary)
                    .count();
                assert!(primaries <= 1);
                assert!(topo.servers.values().all(|s| {
                    s.set_name.as_deref().is_none_or(|name| name == "rs0")
                }));
                match topo.kind {
                    TopologyKind::ReplicaSetWithPrimary => assert_eq!(primaries, 1),
                    TopologyKind::ReplicaSetNoPrimary => assert_eq!(primaries, 0),
                    kind => panic!("left replica set topology: {kind:?}"),
                }
            }
        }
    }

    #[test]
    fn standalone_discovery() {
        let config = Config::parse("mongodb://solo:27017").unwrap();
        let mut topo = TopologyDescription::new(&config);
        let hello = HelloResponse {
            ok: true,
            is_writable_primary: true,
            min_wire_version: 6,
            max_wire_version: 17,
            ..HelloResponse::default()
        };
        topo.apply(ServerDescription::from_hello(
            address("solo:27017"),
            &hello,
            Duration::from_millis(1),
            None,
        ));
        assert_eq!(topo.kind, TopologyKind::Single);
    }

    #[test]
    fn ewma_smoothing() {
        let first = Duration::from_millis(10);
        let hello = HelloResponse { ok: true, ..HelloResponse::default() };
        let desc = ServerDescription::from_hello(
            address("a:1"),
            &hello,
            Duration::from_millis(30),
            Some(first),
        );
        // 0.2 * 30 + 0.8 * 10
        assert_eq!(desc.average_rtt.unwrap().as_millis(), 14);
    }

    #[test]
    fn hello_parse_feeds_description() {
        let doc = doc! {
            "ok": 1.0f64,
            "msg": "isdbgrid",
            "minWireVersion": 6,
            "maxWireVersion": 17,
        };
        let hello = HelloResponse::parse(&doc);
        let desc =
            ServerDescription::from_hello(address("r:27017"), &hello, Duration::from_millis(2), None);
        assert_eq!(desc.kind, ServerKind::Mongos);
    }
}
