//! Cluster topology: who the leader is, who else is out there, and in which
//! order requests should visit them.
//!
//! A [`ClusterTopology`] is immutable. Discovery builds a new one and the
//! connection swaps it in whole, so readers never observe a half-updated peer
//! set. Discovery payloads are parsed through two explicit schemas, one for
//! the status endpoint and one for the node-list endpoint.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Port assumed when an address does not carry one.
pub const DEFAULT_PORT: u16 = 4001;

/// One node's externally reachable API address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    host: String,
    port: u16,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host[:port]`, falling back to [`DEFAULT_PORT`].
    ///
    /// Bracketed IPv6 literals (`[::1]:4001`) are accepted.
    pub fn parse(authority: &str) -> Result<Self> {
        let authority = authority.trim();
        if authority.is_empty() {
            return Err(Error::InvalidUrl("empty peer address".into()));
        }

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                Error::InvalidUrl(format!("unterminated ipv6 host: {authority}"))
            })?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(Error::InvalidUrl(format!("bad peer address: {authority}"))),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(Error::InvalidUrl(format!("missing host in {authority}")));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| Error::InvalidUrl(format!("bad port in {authority}")))?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }

    /// Parses an address reported by the store, which may carry a scheme and
    /// path (`http://host3:4003`), or be a bare `host:port`.
    pub fn from_api_addr(addr: &str) -> Result<Self> {
        let without_scheme = addr.split_once("://").map_or(addr, |(_, rest)| rest);
        let authority = without_scheme
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default();
        let authority = authority
            .rsplit_once('@')
            .map_or(authority, |(_, host)| host);
        Self::parse(authority)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Order in which peers are tried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerOrdering {
    /// Leader first, then the other peers in discovery order.
    #[default]
    LeaderFirst,
    /// The seed first, then the leader (when different), then everyone else.
    /// Useful when the seed is a local node that should absorb reads.
    SeedFirst,
}

/// The client's belief about the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    leader: Option<Peer>,
    others: Vec<Peer>,
    seed: Option<Peer>,
    ordering: PeerOrdering,
    peer_list: Vec<Peer>,
}

impl ClusterTopology {
    pub fn new(
        leader: Option<Peer>,
        others: Vec<Peer>,
        seed: Option<Peer>,
        ordering: PeerOrdering,
    ) -> Self {
        let mut topology = Self {
            leader,
            others,
            seed,
            ordering,
            peer_list: Vec::new(),
        };
        topology.peer_list = topology.ordered_peers(ordering);
        topology
    }

    /// Topology before any discovery: the seed is assumed to lead.
    pub fn seeded(seed: Peer, extra: Vec<Peer>, ordering: PeerOrdering) -> Self {
        Self::new(Some(seed.clone()), extra, Some(seed), ordering)
    }

    pub fn leader(&self) -> Option<&Peer> {
        self.leader.as_ref()
    }

    pub fn others(&self) -> &[Peer] {
        &self.others
    }

    pub fn seed(&self) -> Option<&Peer> {
        self.seed.as_ref()
    }

    pub fn ordering(&self) -> PeerOrdering {
        self.ordering
    }

    /// Cached peer list computed with this topology's ordering.
    pub fn peer_list(&self) -> &[Peer] {
        &self.peer_list
    }

    /// Every known peer exactly once, in the order requests should try them.
    pub fn ordered_peers(&self, ordering: PeerOrdering) -> Vec<Peer> {
        let mut list = Vec::with_capacity(self.others.len() + 2);
        match ordering {
            PeerOrdering::LeaderFirst => {
                push_unique(&mut list, self.leader.as_ref());
                for peer in &self.others {
                    push_unique(&mut list, Some(peer));
                }
                // A seed that vanished from discovery is still worth a try.
                push_unique(&mut list, self.seed.as_ref());
            }
            PeerOrdering::SeedFirst => {
                push_unique(&mut list, self.seed.as_ref());
                push_unique(&mut list, self.leader.as_ref());
                for peer in &self.others {
                    push_unique(&mut list, Some(peer));
                }
            }
        }
        list
    }
}

fn push_unique(list: &mut Vec<Peer>, peer: Option<&Peer>) {
    if let Some(peer) = peer {
        if !list.contains(peer) {
            list.push(peer.clone());
        }
    }
}

/// Leader and followers extracted from one discovery payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovered {
    pub leader: Option<Peer>,
    pub others: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    store: StoreSection,
}

#[derive(Debug, Deserialize)]
struct StoreSection {
    #[serde(default)]
    leader: Option<LeaderField>,
    #[serde(default)]
    metadata: HashMap<String, NodeMetadata>,
}

/// Newer stores report `{"node_id": .., "addr": ..}`, older ones a bare string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LeaderField {
    Node {
        node_id: String,
    },
    Address(String),
}

#[derive(Debug, Deserialize)]
struct NodeMetadata {
    #[serde(default)]
    api_addr: String,
}

/// Parses a `/status` payload.
///
/// Returns `Ok(None)` when the payload is well formed but does not let us
/// resolve a leader; the caller then falls back to `/nodes`.
pub fn parse_status(body: &[u8]) -> Result<Option<Discovered>> {
    let status: StatusResponse = serde_json::from_slice(body)
        .map_err(|err| Error::Discovery(format!("could not parse status response: {err}")))?;
    let store = status.store;

    let leader = match &store.leader {
        Some(LeaderField::Node { node_id }) => store
            .metadata
            .get(node_id)
            .filter(|meta| !meta.api_addr.is_empty())
            .map(|meta| Peer::from_api_addr(&meta.api_addr))
            .transpose()?,
        Some(LeaderField::Address(addr)) if addr.is_empty() => None,
        Some(LeaderField::Address(addr)) => match store.metadata.get(addr) {
            Some(meta) if !meta.api_addr.is_empty() => {
                Some(Peer::from_api_addr(&meta.api_addr)?)
            }
            _ => Some(Peer::from_api_addr(addr)?),
        },
        None => None,
    };

    let Some(leader) = leader else {
        return Ok(None);
    };

    let mut ids: Vec<&String> = store.metadata.keys().collect();
    ids.sort();
    let mut others = Vec::new();
    for id in ids {
        let addr = &store.metadata[id].api_addr;
        if addr.is_empty() {
            continue;
        }
        let peer = Peer::from_api_addr(addr)?;
        if peer != leader && !others.contains(&peer) {
            others.push(peer);
        }
    }

    Ok(Some(Discovered {
        leader: Some(leader),
        others,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodesResponse {
    List { nodes: Vec<NodeRecord> },
    Map(BTreeMap<String, NodeRecord>),
}

#[derive(Debug, Deserialize)]
struct NodeRecord {
    #[serde(default)]
    api_addr: String,
    #[serde(default)]
    reachable: bool,
    #[serde(default)]
    leader: bool,
}

/// Parses a `/nodes` payload, discarding unreachable nodes and nodes without
/// an API address.
pub fn parse_nodes(body: &[u8]) -> Result<Discovered> {
    let response: NodesResponse = serde_json::from_slice(body)
        .map_err(|err| Error::Discovery(format!("could not parse nodes response: {err}")))?;
    let records: Vec<NodeRecord> = match response {
        NodesResponse::List { nodes } => nodes,
        NodesResponse::Map(map) => map.into_values().collect(),
    };

    let mut discovered = Discovered::default();
    for record in records {
        if !record.reachable || record.api_addr.is_empty() {
            continue;
        }
        let peer = Peer::from_api_addr(&record.api_addr)?;
        if record.leader {
            discovered.leader = Some(peer);
        } else if !discovered.others.contains(&peer) {
            discovered.others.push(peer);
        }
    }
    if let Some(leader) = &discovered.leader {
        discovered.others.retain(|peer| peer != leader);
    }
    Ok(discovered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(host: &str) -> Peer {
        Peer::new(host, DEFAULT_PORT)
    }

    #[test]
    fn test_peer_parse() {
        assert_eq!(Peer::parse("host1:4002").unwrap(), Peer::new("host1", 4002));
        assert_eq!(Peer::parse("host1").unwrap(), Peer::new("host1", 4001));
        assert_eq!(Peer::parse("[::1]:4005").unwrap(), Peer::new("::1", 4005));
        assert_eq!(Peer::parse("[::1]:4005").unwrap().to_string(), "[::1]:4005");
        assert!(Peer::parse("").is_err());
        assert!(Peer::parse("host:notaport").is_err());
        assert!(Peer::parse(":4001").is_err());
    }

    #[test]
    fn test_peer_from_api_addr() {
        assert_eq!(
            Peer::from_api_addr("http://host3:4003").unwrap(),
            Peer::new("host3", 4003)
        );
        assert_eq!(
            Peer::from_api_addr("https://host3/db").unwrap(),
            Peer::new("host3", 4001)
        );
        assert_eq!(Peer::from_api_addr("host9:7000").unwrap(), Peer::new("host9", 7000));
    }

    #[test]
    fn test_leader_first_ordering() {
        let leader = peer("10.0.0.1");
        let others = vec![peer("10.0.0.2"), peer("10.0.0.3")];
        let topology =
            ClusterTopology::new(Some(leader.clone()), others, None, PeerOrdering::LeaderFirst);

        let list = topology.peer_list();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0], leader);
        assert_eq!(list[1], peer("10.0.0.2"));
        assert_eq!(list[2], peer("10.0.0.3"));
    }

    #[test]
    fn test_no_leader_keeps_others() {
        let topology = ClusterTopology::new(
            None,
            vec![peer("a"), peer("b")],
            None,
            PeerOrdering::LeaderFirst,
        );
        assert_eq!(topology.peer_list(), &[peer("a"), peer("b")]);
    }

    #[test]
    fn test_seed_first_with_seed_among_others() {
        let seed = peer("127.0.0.1");
        let leader = peer("10.100.1.1");
        let topology = ClusterTopology::new(
            Some(leader.clone()),
            vec![peer("10.100.2.1"), peer("10.100.3.1"), seed.clone(), peer("10.100.4.1")],
            Some(seed.clone()),
            PeerOrdering::SeedFirst,
        );

        let favored = topology.ordered_peers(PeerOrdering::SeedFirst);
        assert_eq!(favored.len(), 5);
        assert_eq!(favored[0], seed);
        assert_eq!(favored[1], leader);
        assert_eq!(&favored[2..], &[peer("10.100.2.1"), peer("10.100.3.1"), peer("10.100.4.1")]);

        let natural = topology.ordered_peers(PeerOrdering::LeaderFirst);
        assert_eq!(natural.len(), 5);
        assert_eq!(natural[0], leader);
        assert_eq!(natural[3], seed);
    }

    #[test]
    fn test_seed_equal_to_leader_is_listed_once() {
        let seed = peer("127.0.0.1");
        let other = peer("10.100.1.1");
        let topology = ClusterTopology::new(
            Some(seed.clone()),
            vec![peer("10.100.2.1"), peer("10.100.3.1"), other.clone(), peer("10.100.5.1")],
            Some(seed.clone()),
            PeerOrdering::SeedFirst,
        );

        for ordering in [PeerOrdering::SeedFirst, PeerOrdering::LeaderFirst] {
            let list = topology.ordered_peers(ordering);
            assert_eq!(list.len(), 5);
            assert_eq!(list[0], seed);
            assert_eq!(list[3], other);
        }
    }

    #[test]
    fn test_orderings_are_permutations() {
        let seed = peer("s");
        let leader = peer("l");
        let cases = vec![
            (Some(leader.clone()), vec![], Some(seed.clone())),
            (Some(leader.clone()), vec![peer("x"), seed.clone()], Some(seed.clone())),
            (Some(seed.clone()), vec![peer("x"), peer("y")], Some(seed.clone())),
            (None, vec![peer("x"), seed.clone()], Some(seed.clone())),
            (Some(leader.clone()), vec![peer("x"), leader.clone()], None),
        ];

        for (leader, others, seed) in cases {
            let mut known: Vec<Peer> = others.clone();
            known.extend(leader.clone());
            known.extend(seed.clone());
            known.sort_by_key(|p| p.to_string());
            known.dedup();

            let topology = ClusterTopology::new(
                leader.clone(),
                others,
                seed.clone(),
                PeerOrdering::LeaderFirst,
            );
            for ordering in [PeerOrdering::LeaderFirst, PeerOrdering::SeedFirst] {
                let list = topology.ordered_peers(ordering);
                let mut sorted = list.clone();
                sorted.sort_by_key(|p| p.to_string());
                assert_eq!(sorted, known, "{ordering:?} must list every peer once");

                match ordering {
                    PeerOrdering::LeaderFirst if leader.is_some() => {
                        assert_eq!(list.first(), leader.as_ref());
                    }
                    PeerOrdering::SeedFirst if seed.is_some() => {
                        assert_eq!(list.first(), seed.as_ref());
                        if leader.is_some() && leader != seed {
                            assert_eq!(list.get(1), leader.as_ref());
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn test_parse_nodes_map() {
        let body = br#"{
          "1": {"api_addr": "http://host1:4001", "addr": "host2:4002", "reachable": true, "leader": false, "time": 9.114e-06},
          "2": {"api_addr": "http://host3:4003", "addr": "host3:4004", "reachable": true, "leader": true, "time": 0.000127793},
          "3": {"addr": "host6:4006", "reachable": false, "leader": false, "error": "connection refused"}
        }"#;

        let discovered = parse_nodes(body).unwrap();
        assert_eq!(discovered.leader, Some(Peer::new("host3", 4003)));
        assert_eq!(discovered.others, vec![Peer::new("host1", 4001)]);
    }

    #[test]
    fn test_parse_nodes_list_form() {
        let body = br#"{"nodes": [
          {"id": "a", "api_addr": "http://a:4001", "addr": "a:4002", "reachable": true, "leader": true},
          {"id": "b", "api_addr": "", "addr": "b:4002", "reachable": true, "leader": false},
          {"id": "c", "api_addr": "http://c:4001", "addr": "c:4002", "reachable": true, "leader": false}
        ]}"#;

        let discovered = parse_nodes(body).unwrap();
        assert_eq!(discovered.leader, Some(Peer::new("a", 4001)));
        assert_eq!(discovered.others, vec![Peer::new("c", 4001)]);
    }

    #[test]
    fn test_parse_nodes_rejects_garbage() {
        assert!(matches!(parse_nodes(b"[1, 2]"), Err(Error::Discovery(_))));
    }

    #[test]
    fn test_parse_status_with_metadata() {
        let body = br#"{"store": {
            "leader": {"node_id": "node1", "addr": "host1:4002"},
            "metadata": {
                "node1": {"api_addr": "http://host1:4001"},
                "node2": {"api_addr": "http://host2:4001"}
            }
        }}"#;

        let discovered = parse_status(body).unwrap().expect("leader resolved");
        assert_eq!(discovered.leader, Some(Peer::new("host1", 4001)));
        assert_eq!(discovered.others, vec![Peer::new("host2", 4001)]);
    }

    #[test]
    fn test_parse_status_bare_leader_address() {
        let body = br#"{"store": {"leader": "host7:4001"}}"#;
        let discovered = parse_status(body).unwrap().expect("leader resolved");
        assert_eq!(discovered.leader, Some(Peer::new("host7", 4001)));
        assert!(discovered.others.is_empty());
    }

    #[test]
    fn test_parse_status_unresolvable_leader_falls_back() {
        let body = br#"{"store": {"leader": {"node_id": "node1", "addr": "host1:4002"}}}"#;
        assert_eq!(parse_status(body).unwrap(), None);

        let body = br#"{"store": {"leader": ""}}"#;
        assert_eq!(parse_status(body).unwrap(), None);
    }

    #[test]
    fn test_parse_status_without_store_is_an_error() {
        assert!(matches!(parse_status(br#"{"build": {}}"#), Err(Error::Discovery(_))));
    }
}
