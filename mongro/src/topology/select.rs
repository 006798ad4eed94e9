//! Server selection.
use std::time::{Duration, Instant};

use rand::Rng;

use crate::{
    Error, Result,
    config::Address,
};

use super::{
    Topology,
    description::{ServerDescription, ServerKind, TopologyDescription, TopologyKind},
};

/// Floor between repeated checks while a selection waits.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// One `key: value` constraint set; empty matches every server.
pub type TagSet = Vec<(String, String)>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadMode {
    pub fn from_name(name: &str) -> Option<ReadMode> {
        Some(match name {
            "primary" => Self::Primary,
            "primaryPreferred" => Self::PrimaryPreferred,
            "secondary" => Self::Secondary,
            "secondaryPreferred" => Self::SecondaryPreferred,
            "nearest" => Self::Nearest,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        }
    }
}

/// Which servers an operation may read from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadPreference {
    pub mode: ReadMode,
    /// First set with a non-empty intersection wins.
    pub tag_sets: Vec<TagSet>,
    pub max_staleness: Option<Duration>,
}

impl ReadPreference {
    pub fn primary() -> ReadPreference {
        ReadPreference::default()
    }

    pub fn mode(mode: ReadMode) -> ReadPreference {
        ReadPreference { mode, ..Default::default() }
    }

    /// Whether this preference must be attached to the command.
    pub(crate) fn is_default(&self) -> bool {
        self.mode == ReadMode::Primary
    }
}

/// What an operation demands from its server.
#[derive(Clone, Debug)]
pub(crate) enum Criteria {
    /// Writes and commands that must run on a primary-eligible server.
    Write,
    /// Reads honoring a preference.
    Read(ReadPreference),
}

impl Criteria {
    fn read_preference(&self) -> ReadPreference {
        match self {
            Criteria::Write => ReadPreference::primary(),
            Criteria::Read(pref) => pref.clone(),
        }
    }
}

/// Servers eligible under `criteria`, before the random pick.
///
/// Steps: mode filter, tag sets, max staleness, latency window.
pub(crate) fn suitable_servers(
    desc: &TopologyDescription,
    criteria: &Criteria,
    heartbeat_frequency: Duration,
    local_threshold: Duration,
) -> Vec<Address> {
    let pref = criteria.read_preference();

    let candidates: Vec<&ServerDescription> = match desc.kind {
        TopologyKind::Unknown => Vec::new(),
        // a direct or balanced deployment serves everything
        TopologyKind::Single | TopologyKind::LoadBalanced => desc
            .servers
            .values()
            .filter(|s| s.kind != ServerKind::Unknown)
            .collect(),
        TopologyKind::Sharded => desc
            .servers
            .values()
            .filter(|s| s.kind == ServerKind::Mongos)
            .collect(),
        TopologyKind::ReplicaSetNoPrimary | TopologyKind::ReplicaSetWithPrimary => {
            let primary = || {
                desc.servers
                    .values()
                    .filter(|s| s.kind == ServerKind::RsPrimary)
                    .collect::<Vec<_>>()
            };
            let secondaries = || {
                let tagged = filter_by_tags(
                    desc.servers
                        .values()
                        .filter(|s| s.kind == ServerKind::RsSecondary)
                        .collect(),
                    &pref.tag_sets,
                );
                tagged
                    .into_iter()
                    .filter(|s| within_staleness(s, desc, &pref, heartbeat_frequency))
                    .collect::<Vec<_>>()
            };
            match pref.mode {
                _ if matches!(criteria, Criteria::Write) => primary(),
                ReadMode::Primary => primary(),
                ReadMode::Secondary => secondaries(),
                ReadMode::PrimaryPreferred => {
                    let p = primary();
                    if p.is_empty() { secondaries() } else { p }
                }
                ReadMode::SecondaryPreferred => {
                    let s = secondaries();
                    if s.is_empty() { primary() } else { s }
                }
                ReadMode::Nearest => {
                    let mut all = primary();
                    all.extend(secondaries());
                    all
                }
            }
        }
    };

    latency_window(candidates, local_threshold)
        .into_iter()
        .map(|s| s.address.clone())
        .collect()
}

/// The first tag set matching at least one server wins; later sets are
/// only consulted when earlier ones match nobody.
fn filter_by_tags<'a>(
    servers: Vec<&'a ServerDescription>,
    tag_sets: &[TagSet],
) -> Vec<&'a ServerDescription> {
    if tag_sets.is_empty() {
        return servers;
    }
    for set in tag_sets {
        let matched = servers
            .iter()
            .copied()
            .filter(|server| {
                set.iter().all(|(key, value)| {
                    server.tags.iter().any(|(k, v)| k == key && v == value)
                })
            })
            .collect::<Vec<_>>();
        if !matched.is_empty() {
            return matched;
        }
    }
    Vec::new()
}

/// Max staleness filter.
///
/// Estimated lag of a secondary against the primary:
/// `primary.lastWriteDate − secondary.lastWriteDate
///  + (now − secondary.lastUpdateTime) − (now − primary.lastUpdateTime)`.
/// Without a primary, the freshest secondary stands in. Eligible iff
/// lag ≤ maxStalenessSeconds − heartbeatFrequency.
fn within_staleness(
    server: &ServerDescription,
    desc: &TopologyDescription,
    pref: &ReadPreference,
    heartbeat_frequency: Duration,
) -> bool {
    let Some(max_staleness) = pref.max_staleness else {
        return true;
    };
    let Some(write_date) = server.last_write_date else {
        return true;
    };
    let budget = max_staleness.saturating_sub(heartbeat_frequency);

    let lag_ms = match desc.primary() {
        Some(primary) => {
            let Some(primary_write) = primary.last_write_date else {
                return true;
            };
            (primary_write.0 - write_date.0)
                + server.last_update_time.elapsed().as_millis() as i64
                - primary.last_update_time.elapsed().as_millis() as i64
        }
        None => {
            let freshest = desc
                .servers
                .values()
                .filter(|s| s.kind == ServerKind::RsSecondary)
                .filter_map(|s| s.last_write_date)
                .max()
                .unwrap_or(write_date);
            (freshest.0 - write_date.0) + heartbeat_frequency.as_millis() as i64
        }
    };

    lag_ms.max(0) as u128 <= budget.as_millis()
}

/// Keep servers within `local_threshold` of the fastest.
fn latency_window<'a>(
    candidates: Vec<&'a ServerDescription>,
    local_threshold: Duration,
) -> Vec<&'a ServerDescription> {
    let Some(min) = candidates.iter().filter_map(|s| s.average_rtt).min() else {
        // no samples yet, everything stands
        return candidates;
    };
    let window = min + local_threshold;
    candidates
        .into_iter()
        .filter(|s| s.average_rtt.is_none_or(|rtt| rtt <= window))
        .collect()
}

/// Pick one eligible server, waiting out topology changes.
///
/// Reruns the filter on every topology change notification, backing off
/// `MIN_HEARTBEAT_FREQUENCY` between forced checks, until
/// `serverSelectionTimeout` expires.
pub(crate) async fn select_server(topology: &Topology, criteria: &Criteria) -> Result<Address> {
    let config = topology.config();
    let deadline = Instant::now() + config.server_selection_timeout;
    let mut changed = topology.subscribe();

    loop {
        let desc = topology.description();
        if let Some(why) = &desc.compatibility_error {
            return Err(Error::incompatible(why.clone()));
        }

        let eligible = suitable_servers(
            &desc,
            criteria,
            config.heartbeat_frequency,
            config.local_threshold,
        );
        if !eligible.is_empty() {
            // ties break by rng so idle clients do not stampede one server
            let at = rand::thread_rng().gen_range(0..eligible.len());
            return Ok(eligible[at].clone());
        }

        topology.request_check();

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wait = remaining.min(MIN_HEARTBEAT_FREQUENCY);
        let _ = tokio::time::timeout(wait, changed.changed()).await;
    }

    Err(Error::selection_timeout(format!(
        "no eligible server after {:?} ({:?})",
        config.server_selection_timeout, criteria,
    )))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::connection::HelloResponse;

    fn address(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn secondary(addr: &str, rtt_ms: u64, tags: &[(&str, &str)]) -> ServerDescription {
        let hello = HelloResponse {
            ok: true,
            secondary: true,
            set_name: Some("rs0".into()),
            hosts: vec![address("a:1"), address("b:1"), address("c:1"), address("p:1")],
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            min_wire_version: 6,
            max_wire_version: 17,
            ..HelloResponse::default()
        };
        ServerDescription::from_hello(address(addr), &hello, Duration::from_millis(rtt_ms), None)
    }

    fn primary(addr: &str) -> ServerDescription {
        let hello = HelloResponse {
            ok: true,
            is_writable_primary: true,
            set_name: Some("rs0".into()),
            hosts: vec![address("a:1"), address("b:1"), address("c:1"), address("p:1")],
            min_wire_version: 6,
            max_wire_version: 17,
            ..HelloResponse::default()
        };
        ServerDescription::from_hello(address(addr), &hello, Duration::from_millis(1), None)
    }

    fn three_secondary_topology() -> TopologyDescription {
        let config = Config::parse("mongodb://a:1,b:1,c:1,p:1/?replicaSet=rs0").unwrap();
        let mut topo = TopologyDescription::new(&config);
        topo.apply(primary("p:1"));
        topo.apply(secondary("a:1", 5, &[("dc", "ny")]));
        topo.apply(secondary("b:1", 7, &[("dc", "sf")]));
        topo.apply(secondary("c:1", 6, &[("dc", "ny")]));
        topo
    }

    #[test]
    fn writes_need_primary() {
        let topo = three_secondary_topology();
        let picked = suitable_servers(
            &topo,
            &Criteria::Write,
            Duration::from_secs(10),
            Duration::from_millis(15),
        );
        assert_eq!(picked, [address("p:1")]);
    }

    #[test]
    fn tag_sets_first_match_wins() {
        let topo = three_secondary_topology();
        let pref = ReadPreference {
            mode: ReadMode::Secondary,
            tag_sets: vec![
                vec![("dc".into(), "tokyo".into())],
                vec![("dc".into(), "sf".into())],
            ],
            max_staleness: None,
        };
        let picked = suitable_servers(
            &topo,
            &Criteria::Read(pref),
            Duration::from_secs(10),
            Duration::from_millis(15),
        );
        assert_eq!(picked, [address("b:1")]);
    }

    #[test]
    fn empty_tag_set_matches_all() {
        let topo = three_secondary_topology();
        let pref = ReadPreference {
            mode: ReadMode::Secondary,
            tag_sets: vec![Vec::new()],
            max_staleness: None,
        };
        let picked = suitable_servers(
            &topo,
            &Criteria::Read(pref),
            Duration::from_secs(10),
            Duration::from_millis(15),
        );
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn latency_window_filters() {
        let topo = three_secondary_topology();
        let pref = ReadPreference::mode(ReadMode::Secondary);
        // fastest secondary is 5ms; a 1ms threshold admits 5 and 6
        let picked = suitable_servers(
            &topo,
            &Criteria::Read(pref),
            Duration::from_secs(10),
            Duration::from_millis(1),
        );
        assert_eq!(picked.len(), 2);
        assert!(!picked.contains(&address("b:1")));
    }

    #[test]
    fn secondary_preferred_falls_back() {
        let config = Config::parse("mongodb://p:1/?replicaSet=rs0").unwrap();
        let mut topo = TopologyDescription::new(&config);
        topo.apply(primary("p:1"));
        let pref = ReadPreference::mode(ReadMode::SecondaryPreferred);
        let picked = suitable_servers(
            &topo,
            &Criteria::Read(pref),
            Duration::from_secs(10),
            Duration::from_millis(15),
        );
        assert_eq!(picked, [address("p:1")]);
    }

    #[test]
    fn selection_is_fair() {
        let topo = three_secondary_topology();
        let pref = ReadPreference::mode(ReadMode::Secondary);

        let mut counts = std::collections::HashMap::<Address, u32>::new();
        let total = 10_000;
        for _ in 0..total {
            let eligible = suitable_servers(
                &topo,
                &Criteria::Read(pref.clone()),
                Duration::from_secs(10),
                Duration::from_millis(15),
            );
            let at = rand::thread_rng().gen_range(0..eligible.len());
            *counts.entry(eligible[at].clone()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        let expected = total / 3;
        for (addr, count) in counts {
            let deviation = (count as i64 - expected as i64).abs() as f64 / expected as f64;
            assert!(deviation < 0.05, "{addr}: {count} deviates {deviation}");
        }
    }

    #[test]
    fn staleness_filters_lagging_secondary() {
        use crate::bson::DateTime;
        let config = Config::parse("mongodb://a:1,b:1,p:1/?replicaSet=rs0").unwrap();
        let mut topo = TopologyDescription::new(&config);

        let mut p = primary("p:1");
        p.last_write_date = Some(DateTime(100_000));
        topo.apply(p);
        let mut fresh = secondary("a:1", 5, &[]);
        fresh.last_write_date = Some(DateTime(99_000));
        topo.apply(fresh);
        let mut stale = secondary("b:1", 5, &[]);
        stale.last_write_date = Some(DateTime(10_000));
        topo.apply(stale);

        let pref = ReadPreference {
            mode: ReadMode::Secondary,
            tag_sets: Vec::new(),
            max_staleness: Some(Duration::from_secs(30)),
        };
        let picked = suitable_servers(
            &topo,
            &Criteria::Read(pref),
            Duration::from_secs(10),
            Duration::from_millis(15),
        );
        assert_eq!(picked, [address("a:1")]);
    }
}
