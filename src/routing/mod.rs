//! Flood-based route and node-info propagation with loop prevention.
//!
//! Advertisements visit every peer once: each receiver checks the SeenBy
//! set, installs entries with the metric bumped by one hop, appends itself,
//! and forwards to peers not yet in SeenBy. Withdrawals flood under the
//! same rules. A background sweep expires stale entries and floods
//! withdrawals on their behalf. The engine itself is transport-free: every
//! handler returns the flood to forward (if any) and the agent fans it out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

pub mod table;

pub use table::{DomainPattern, Prefix, RouteDest, RouteEntry, RouteTable, SharedRouteTable};

use crate::config::RoutingConfig;
use crate::frame::{AdvertisedRoute, DestAddr, NodeInfo, PeerSummary, RouteFlood};
use crate::identity::AgentId;

/// Outcome of processing an inbound flood: the (possibly rewritten) payload
/// to forward to every peer not yet in its SeenBy set.
pub type Forward<T> = Option<T>;

pub struct RoutingEngine {
    local_id: AgentId,
    local_name: String,
    config: RoutingConfig,
    table: SharedRouteTable,
    /// Destinations this agent serves as an exit, advertised periodically.
    local_routes: Vec<RouteDest>,
    sequence: AtomicU64,
    node_sequence: AtomicU64,
    node_infos: Mutex<HashMap<AgentId, NodeInfo>>,
}

impl RoutingEngine {
    pub fn new(
        local_id: AgentId,
        local_name: String,
        config: RoutingConfig,
        local_routes: Vec<RouteDest>,
    ) -> Self {
        Self {
            local_id,
            local_name,
            config,
            table: SharedRouteTable::new(),
            local_routes,
            sequence: AtomicU64::new(0),
            node_sequence: AtomicU64::new(0),
            node_infos: Mutex::new(HashMap::new()),
        }
    }

    /// Immutable snapshot for next-hop lookups during stream opens.
    pub fn table(&self) -> std::sync::Arc<RouteTable> {
        self.table.load()
    }

    pub fn shared_table(&self) -> SharedRouteTable {
        self.table.clone()
    }

    pub fn local_routes(&self) -> &[RouteDest] {
        &self.local_routes
    }

    /// Whether this agent's own exit route set covers the destination.
    pub fn serves(&self, dest: &DestAddr) -> bool {
        self.local_routes.iter().any(|r| r.covers(dest))
    }

    /// Processes ROUTE_ADVERTISE or ROUTE_WITHDRAW from `sender`.
    ///
    /// Returns the flood to forward, with the local agent appended to path
    /// and SeenBy, or `None` when the announcement is dropped (already seen,
    /// hop limit, malformed, or entirely stale).
    pub fn handle_flood(
        &self,
        sender: AgentId,
        mut flood: RouteFlood,
        withdraw: bool,
    ) -> Forward<RouteFlood> {
        if flood.seen_by.contains(&self.local_id) || flood.path.contains(&self.local_id) {
            return None;
        }
        if flood.path.len() >= self.config.max_hops as usize {
            debug!(
                target: "trellis::route",
                origin = %flood.origin.short(),
                hops = flood.path.len(),
                "dropping flood at hop limit"
            );
            return None;
        }
        if flood.path.first() != Some(&flood.origin) {
            warn!(
                target: "trellis::route",
                origin = %flood.origin.short(),
                from = %sender.short(),
                "malformed flood: path does not start at origin"
            );
            return None;
        }

        // Forwarded metrics carry the cost to reach the origin from the
        // sender; one more hop to get here.
        for route in &mut flood.routes {
            route.metric = route.metric.saturating_add(1);
        }

        let now = Instant::now();
        let route_ttl = self.config.route_ttl();
        let max_hops = self.config.max_hops;
        let fresh = self.table.update(|table| {
            let mut fresh = 0usize;
            for route in &flood.routes {
                let dest = match RouteDest::from_wire(&route.target) {
                    Ok(dest) => dest,
                    Err(err) => {
                        warn!(target: "trellis::route", %err, "skipping malformed route target");
                        continue;
                    }
                };
                if let Some(stored) = table.stored_sequence(&dest, &flood.origin, &sender) {
                    if flood.sequence <= stored {
                        continue;
                    }
                }
                if withdraw {
                    let removed = table.withdraw(&dest, &flood.origin, &sender, flood.sequence);
                    if removed > 0 {
                        debug!(
                            target: "trellis::route",
                            %dest,
                            origin = %flood.origin.short(),
                            "withdrew route"
                        );
                        fresh += 1;
                    }
                } else {
                    let entry = RouteEntry {
                        dest: dest.clone(),
                        origin: flood.origin,
                        via: sender,
                        metric: route.metric,
                        sequence: flood.sequence,
                        expires_at: now + route_ttl,
                        path: flood.path.clone(),
                    };
                    if let Err(err) = entry.validate(max_hops) {
                        warn!(target: "trellis::route", %err, "rejecting route entry");
                        continue;
                    }
                    table.install(entry);
                    fresh += 1;
                }
            }
            fresh
        });

        // Withdrawals still flood when nothing was stored locally; the
        // SeenBy check bounds them. Stale advertisements stop here.
        if fresh == 0 && !withdraw {
            return None;
        }

        flood.path.push(self.local_id);
        flood.seen_by.push(self.local_id);
        Some(flood)
    }

    /// The periodic advertisement of this agent's own exit routes.
    pub fn local_advertisement(&self) -> Option<RouteFlood> {
        if self.local_routes.is_empty() {
            return None;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        Some(RouteFlood {
            origin: self.local_id,
            origin_name: self.local_name.clone(),
            sequence,
            routes: self
                .local_routes
                .iter()
                .map(|dest| AdvertisedRoute {
                    target: dest.to_wire(),
                    // Receivers add the first hop.
                    metric: 0,
                })
                .collect(),
            path: vec![self.local_id],
            seen_by: vec![self.local_id],
        })
    }

    /// Withdrawal flood for routes this agent stops serving.
    pub fn local_withdrawal(&self, routes: &[RouteDest]) -> Option<RouteFlood> {
        if routes.is_empty() {
            return None;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        Some(RouteFlood {
            origin: self.local_id,
            origin_name: self.local_name.clone(),
            sequence,
            routes: routes
                .iter()
                .map(|dest| AdvertisedRoute {
                    target: dest.to_wire(),
                    metric: 0,
                })
                .collect(),
            path: vec![self.local_id],
            seen_by: vec![self.local_id],
        })
    }

    /// Expiry sweep: removes entries past their deadline and emits
    /// withdrawals on the silent origin's behalf.
    pub fn sweep(&self, now: Instant) -> Vec<RouteFlood> {
        let expired = self.table.update(|table| table.expire(now));
        let mut by_origin: HashMap<AgentId, Vec<RouteEntry>> = HashMap::new();
        for entry in expired {
            by_origin.entry(entry.origin).or_default().push(entry);
        }
        by_origin
            .into_iter()
            .map(|(origin, entries)| {
                debug!(
                    target: "trellis::route",
                    origin = %origin.short(),
                    count = entries.len(),
                    "expiring routes"
                );
                RouteFlood {
                    origin,
                    origin_name: String::new(),
                    // One past the expired advert so the withdrawal beats it
                    // wherever it is still installed.
                    sequence: entries.iter().map(|e| e.sequence).max().unwrap_or(0) + 1,
                    routes: entries
                        .iter()
                        .map(|e| AdvertisedRoute {
                            target: e.dest.to_wire(),
                            metric: e.metric,
                        })
                        .collect(),
                    path: vec![origin],
                    seen_by: vec![self.local_id, origin],
                }
            })
            .collect()
    }

    /// Drops every route through a dead peer.
    pub fn peer_lost(&self, peer: &AgentId) -> usize {
        let dropped = self.table.update(|table| table.remove_via(peer));
        if !dropped.is_empty() {
            debug!(
                target: "trellis::route",
                peer = %peer.short(),
                count = dropped.len(),
                "dropped routes via dead peer"
            );
        }
        dropped.len()
    }

    /// Processes NODE_INFO_ADVERTISE: keeps only the latest sequence per
    /// origin, forwards under the same flood rules.
    pub fn handle_node_info(&self, _sender: AgentId, mut info: NodeInfo) -> Forward<NodeInfo> {
        if info.seen_by.contains(&self.local_id) || info.path.contains(&self.local_id) {
            return None;
        }
        if info.path.len() >= self.config.max_hops as usize {
            return None;
        }
        {
            let mut infos = self.node_infos.lock();
            match infos.get(&info.origin) {
                Some(stored) if info.sequence <= stored.sequence => return None,
                _ => {
                    infos.insert(info.origin, info.clone());
                }
            }
        }
        info.path.push(self.local_id);
        info.seen_by.push(self.local_id);
        Some(info)
    }

    /// Latest known info for an origin.
    pub fn node_info(&self, origin: &AgentId) -> Option<NodeInfo> {
        self.node_infos.lock().get(origin).cloned()
    }

    pub fn known_nodes(&self) -> Vec<NodeInfo> {
        self.node_infos.lock().values().cloned().collect()
    }

    /// Builds this agent's own periodic node-info advertisement.
    pub fn local_node_info(
        &self,
        peers: Vec<PeerSummary>,
        addresses: Vec<String>,
        start_time_unix: u64,
        management_key: Vec<u8>,
    ) -> NodeInfo {
        let sequence = self.node_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        NodeInfo {
            origin: self.local_id,
            sequence,
            display_name: self.local_name.clone(),
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time_unix,
            addresses,
            peers,
            management_key,
            path: vec![self.local_id],
            seen_by: vec![self.local_id],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(fill: u8) -> AgentId {
        AgentId::from_bytes([fill; 16])
    }

    fn engine(local: u8, routes: &[&str]) -> RoutingEngine {
        RoutingEngine::new(
            id(local),
            format!("agent-{local}"),
            RoutingConfig::default(),
            routes.iter().map(|r| RouteDest::parse(r).unwrap()).collect(),
        )
    }

    fn flood_for(origin: u8, seq: u64, prefix: &str) -> RouteFlood {
        RouteFlood {
            origin: id(origin),
            origin_name: format!("agent-{origin}"),
            sequence: seq,
            routes: vec![AdvertisedRoute {
                target: RouteDest::parse(prefix).unwrap().to_wire(),
                metric: 0,
            }],
            path: vec![id(origin)],
            seen_by: vec![id(origin)],
        }
    }

    #[test]
    fn install_and_forward_increments_metric_and_path() {
        let eng = engine(2, &[]);
        let forwarded = eng.handle_flood(id(1), flood_for(1, 1, "10.0.0.0/8"), false).unwrap();
        assert_eq!(forwarded.routes[0].metric, 1);
        assert_eq!(forwarded.path, vec![id(1), id(2)]);
        assert_eq!(forwarded.seen_by, vec![id(1), id(2)]);

        let table = eng.table();
        let hit = table.lookup_ip("10.1.1.1".parse().unwrap()).unwrap();
        assert_eq!(hit.via, id(1));
        assert_eq!(hit.metric, 1);
        assert_eq!(hit.path, vec![id(1)]);
    }

    #[test]
    fn second_hop_sees_metric_two() {
        // A <- B <- C: replay B's forwarded flood into A's engine.
        let b = engine(2, &[]);
        let forwarded = b.handle_flood(id(3), flood_for(3, 1, "10.0.0.0/8"), false).unwrap();
        let a = engine(1, &[]);
        let again = a.handle_flood(id(2), forwarded, false).unwrap();
        assert_eq!(again.routes[0].metric, 2);
        let table = a.table();
        let hit = table.lookup_ip("10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(hit.metric, 2);
        assert_eq!(hit.via, id(2));
        assert_eq!(hit.path, vec![id(3), id(2)]);
    }

    #[test]
    fn seen_by_suppresses_reflood() {
        let eng = engine(2, &[]);
        let mut flood = flood_for(1, 1, "10.0.0.0/8");
        flood.seen_by.push(id(2));
        assert!(eng.handle_flood(id(1), flood, false).is_none());
    }

    #[test]
    fn hop_limit_drops() {
        let eng = engine(99, &[]);
        let mut flood = flood_for(1, 1, "10.0.0.0/8");
        for i in 2..=16 {
            flood.path.push(id(i));
        }
        assert!(eng.handle_flood(id(16), flood, false).is_none());
    }

    #[test]
    fn stale_sequence_is_noop() {
        let eng = engine(2, &[]);
        assert!(eng.handle_flood(id(1), flood_for(1, 5, "10.0.0.0/8"), false).is_some());
        // Same sequence again: idempotent, not forwarded.
        assert!(eng.handle_flood(id(1), flood_for(1, 5, "10.0.0.0/8"), false).is_none());
        assert!(eng.handle_flood(id(1), flood_for(1, 4, "10.0.0.0/8"), false).is_none());
        assert_eq!(eng.table().len(), 1);
    }

    #[test]
    fn withdraw_removes_installed_route() {
        let eng = engine(2, &[]);
        eng.handle_flood(id(1), flood_for(1, 1, "10.0.0.0/8"), false);
        assert_eq!(eng.table().len(), 1);
        let forwarded = eng.handle_flood(id(1), flood_for(1, 2, "10.0.0.0/8"), true);
        assert!(forwarded.is_some(), "withdrawals keep flooding");
        assert_eq!(eng.table().len(), 0);
    }

    #[test]
    fn malformed_path_rejected() {
        let eng = engine(2, &[]);
        let mut flood = flood_for(1, 1, "10.0.0.0/8");
        flood.path = vec![id(9)];
        assert!(eng.handle_flood(id(1), flood, false).is_none());
    }

    #[test]
    fn local_advertisement_counts_up() {
        let eng = engine(1, &["10.0.0.0/8", "*.corp.example"]);
        let first = eng.local_advertisement().unwrap();
        let second = eng.local_advertisement().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.routes.len(), 2);
        assert_eq!(first.path, vec![id(1)]);
    }

    #[test]
    fn serves_checks_local_routes() {
        let eng = engine(1, &["127.0.0.0/8", "*.internal.example"]);
        assert!(eng.serves(&DestAddr::Ipv4("127.0.0.1".parse().unwrap())));
        assert!(eng.serves(&DestAddr::Domain("db.internal.example".into())));
        assert!(!eng.serves(&DestAddr::Ipv4("8.8.8.8".parse().unwrap())));
    }

    #[test]
    fn sweep_emits_withdrawals_for_expired() {
        let eng = engine(2, &[]);
        eng.handle_flood(id(1), flood_for(1, 3, "10.0.0.0/8"), false);
        // Nothing expired yet.
        assert!(eng.sweep(Instant::now()).is_empty());
        let later = Instant::now() + RoutingConfig::default().route_ttl() + std::time::Duration::from_secs(1);
        let withdrawals = eng.sweep(later);
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].origin, id(1));
        assert_eq!(withdrawals[0].sequence, 4);
        assert!(withdrawals[0].seen_by.contains(&id(2)));
        assert_eq!(eng.table().len(), 0);
    }

    #[test]
    fn node_info_latest_sequence_wins() {
        let eng = engine(2, &[]);
        let mk = |seq| NodeInfo {
            origin: id(1),
            sequence: seq,
            display_name: "n1".into(),
            hostname: String::new(),
            os: "linux".into(),
            arch: "x86_64".into(),
            version: "1".into(),
            start_time_unix: 0,
            addresses: vec![],
            peers: vec![],
            management_key: vec![],
            path: vec![id(1)],
            seen_by: vec![id(1)],
        };
        assert!(eng.handle_node_info(id(1), mk(2)).is_some());
        assert!(eng.handle_node_info(id(1), mk(1)).is_none());
        assert!(eng.handle_node_info(id(1), mk(3)).is_some());
        assert_eq!(eng.node_info(&id(1)).unwrap().sequence, 3);
    }
}
