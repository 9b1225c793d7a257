//! Route table: CIDR prefixes and domain patterns mapped to next hops.
//!
//! Entries are keyed by (destination, origin) and hold one candidate per
//! via, ranked by (metric asc, sequence desc). IP lookup is longest-prefix
//! with ties broken by lowest metric then lowest origin id; domain lookup
//! prefers an exact match over a single-level wildcard.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::RouteError;
use crate::frame::{DestAddr, RouteTarget};
use crate::identity::AgentId;

/// A CIDR prefix, IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    ip: IpAddr,
    len: u8,
}

impl Prefix {
    pub fn new(ip: IpAddr, len: u8) -> Result<Self, RouteError> {
        let max = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max {
            return Err(RouteError::BadPrefix(format!("{ip}/{len}")));
        }
        Ok(Self {
            ip: mask_ip(ip, len),
            len,
        })
    }

    /// Parses `"10.0.0.0/8"`; a bare address gets a host-length mask.
    pub fn parse(s: &str) -> Result<Self, RouteError> {
        let s = s.trim();
        if let Some((addr, len)) = s.split_once('/') {
            let ip: IpAddr = addr
                .parse()
                .map_err(|_| RouteError::BadPrefix(s.to_string()))?;
            let len: u8 = len
                .parse()
                .map_err(|_| RouteError::BadPrefix(s.to_string()))?;
            Prefix::new(ip, len)
        } else {
            let ip: IpAddr = s.parse().map_err(|_| RouteError::BadPrefix(s.to_string()))?;
            let len = match ip {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Prefix::new(ip, len)
        }
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.ip, ip) {
            (IpAddr::V4(p), IpAddr::V4(a)) => {
                let shift = 32 - self.len as u32;
                if shift == 32 {
                    return true;
                }
                (u32::from(p) >> shift) == (u32::from(a) >> shift)
            }
            (IpAddr::V6(p), IpAddr::V6(a)) => {
                let shift = 128 - self.len as u32;
                if shift == 128 {
                    return true;
                }
                (u128::from(p) >> shift) == (u128::from(a) >> shift)
            }
            _ => false,
        }
    }

    pub fn to_wire(&self) -> RouteTarget {
        match self.ip {
            IpAddr::V4(v4) => RouteTarget::Cidr {
                family: 4,
                prefix_len: self.len,
                bits: v4.octets().to_vec(),
            },
            IpAddr::V6(v6) => RouteTarget::Cidr {
                family: 6,
                prefix_len: self.len,
                bits: v6.octets().to_vec(),
            },
        }
    }
}

fn mask_ip(ip: IpAddr, len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let shift = 32 - len as u32;
            let bits = if shift == 32 {
                0
            } else {
                (u32::from(v4) >> shift) << shift
            };
            IpAddr::V4(Ipv4Addr::from(bits))
        }
        IpAddr::V6(v6) => {
            let shift = 128 - len as u32;
            let bits = if shift == 128 {
                0
            } else {
                (u128::from(v6) >> shift) << shift
            };
            IpAddr::V6(Ipv6Addr::from(bits))
        }
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.len)
    }
}

/// A domain route target: exact name or single-level wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DomainPattern {
    Exact(String),
    /// `*.suffix` — matches exactly one extra label.
    Wildcard(String),
}

impl DomainPattern {
    pub fn parse(s: &str) -> Result<Self, RouteError> {
        let s = s.trim().trim_end_matches('.').to_ascii_lowercase();
        if s.is_empty() {
            return Err(RouteError::BadPrefix(s));
        }
        if let Some(suffix) = s.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err(RouteError::BadPrefix(s));
            }
            Ok(DomainPattern::Wildcard(suffix.to_string()))
        } else if s.contains('*') {
            Err(RouteError::BadPrefix(s))
        } else {
            Ok(DomainPattern::Exact(s))
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        match self {
            DomainPattern::Exact(pattern) => *pattern == name,
            DomainPattern::Wildcard(suffix) => name
                .strip_suffix(suffix.as_str())
                .and_then(|head| head.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty() && !label.contains('.')),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, DomainPattern::Exact(_))
    }
}

impl std::fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainPattern::Exact(name) => write!(f, "{name}"),
            DomainPattern::Wildcard(suffix) => write!(f, "*.{suffix}"),
        }
    }
}

/// A route destination as stored in the table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteDest {
    Cidr(Prefix),
    Domain(DomainPattern),
}

impl RouteDest {
    /// Parses a configured route string: CIDR first, domain pattern second.
    pub fn parse(s: &str) -> Result<Self, RouteError> {
        if let Ok(prefix) = Prefix::parse(s) {
            return Ok(RouteDest::Cidr(prefix));
        }
        DomainPattern::parse(s).map(RouteDest::Domain)
    }

    pub fn from_wire(target: &RouteTarget) -> Result<Self, RouteError> {
        match target {
            RouteTarget::Cidr {
                family: 4,
                prefix_len,
                bits,
            } => {
                let octets: [u8; 4] = bits
                    .as_slice()
                    .try_into()
                    .map_err(|_| RouteError::BadPrefix("ipv4 bits".into()))?;
                Prefix::new(IpAddr::V4(Ipv4Addr::from(octets)), *prefix_len).map(RouteDest::Cidr)
            }
            RouteTarget::Cidr {
                family: 6,
                prefix_len,
                bits,
            } => {
                let octets: [u8; 16] = bits
                    .as_slice()
                    .try_into()
                    .map_err(|_| RouteError::BadPrefix("ipv6 bits".into()))?;
                Prefix::new(IpAddr::V6(Ipv6Addr::from(octets)), *prefix_len).map(RouteDest::Cidr)
            }
            RouteTarget::Cidr { family, .. } => {
                Err(RouteError::BadPrefix(format!("address family {family}")))
            }
            RouteTarget::Domain { pattern } => {
                DomainPattern::parse(pattern).map(RouteDest::Domain)
            }
        }
    }

    pub fn to_wire(&self) -> RouteTarget {
        match self {
            RouteDest::Cidr(prefix) => prefix.to_wire(),
            RouteDest::Domain(pattern) => RouteTarget::Domain {
                pattern: pattern.to_string(),
            },
        }
    }

    /// Whether this destination covers the given open target.
    pub fn covers(&self, dest: &DestAddr) -> bool {
        match (self, dest) {
            (RouteDest::Cidr(prefix), DestAddr::Ipv4(ip)) => prefix.contains(IpAddr::V4(*ip)),
            (RouteDest::Cidr(prefix), DestAddr::Ipv6(ip)) => prefix.contains(IpAddr::V6(*ip)),
            (RouteDest::Domain(pattern), DestAddr::Domain(name)) => pattern.matches(name),
            _ => false,
        }
    }
}

impl std::fmt::Display for RouteDest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteDest::Cidr(prefix) => write!(f, "{prefix}"),
            RouteDest::Domain(pattern) => write!(f, "{pattern}"),
        }
    }
}

/// One learned route.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub dest: RouteDest,
    pub origin: AgentId,
    /// Next hop: the peer the announcement arrived from.
    pub via: AgentId,
    pub metric: u16,
    pub sequence: u64,
    pub expires_at: Instant,
    /// Agents the announcement visited, origin first, receiver last.
    pub path: Vec<AgentId>,
}

impl RouteEntry {
    /// Structural invariants every stored entry satisfies.
    pub fn validate(&self, max_hops: u8) -> Result<(), RouteError> {
        if self.metric == 0 {
            return Err(RouteError::Invalid("metric must be positive"));
        }
        if self.path.len() > max_hops as usize {
            return Err(RouteError::Invalid("path exceeds hop limit"));
        }
        if self.path.first() != Some(&self.origin) {
            return Err(RouteError::Invalid("path must start at origin"));
        }
        for (i, hop) in self.path.iter().enumerate() {
            if self.path[..i].contains(hop) {
                return Err(RouteError::Invalid("path revisits an agent"));
            }
        }
        Ok(())
    }
}

/// Immutable route table; shared via copy-on-write snapshots.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    // (dest, origin) buckets, one entry per via.
    entries: HashMap<RouteDest, HashMap<AgentId, Vec<RouteEntry>>>,
}

impl RouteTable {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|per_origin| per_origin.values())
            .map(|v| v.len())
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries
            .values()
            .flat_map(|per_origin| per_origin.values())
            .flatten()
    }

    /// Highest sequence stored for (dest, origin, via); the flood acceptance
    /// check compares against this.
    pub fn stored_sequence(
        &self,
        dest: &RouteDest,
        origin: &AgentId,
        via: &AgentId,
    ) -> Option<u64> {
        self.entries
            .get(dest)?
            .get(origin)?
            .iter()
            .filter(|e| e.via == *via)
            .map(|e| e.sequence)
            .max()
    }

    /// Installs or replaces the entry for (dest, origin, via). The bucket
    /// stays ranked by (metric asc, sequence desc).
    pub fn install(&mut self, entry: RouteEntry) {
        let bucket = self
            .entries
            .entry(entry.dest.clone())
            .or_default()
            .entry(entry.origin)
            .or_default();
        bucket.retain(|e| e.via != entry.via);
        bucket.push(entry);
        bucket.sort_by(|a, b| a.metric.cmp(&b.metric).then(b.sequence.cmp(&a.sequence)));
    }

    /// Removes entries for (dest, origin) learned via the given sender with
    /// a sequence older than the withdrawal. Returns how many were removed.
    pub fn withdraw(
        &mut self,
        dest: &RouteDest,
        origin: &AgentId,
        via: &AgentId,
        sequence: u64,
    ) -> usize {
        let mut removed = 0;
        if let Some(per_origin) = self.entries.get_mut(dest) {
            if let Some(bucket) = per_origin.get_mut(origin) {
                let before = bucket.len();
                bucket.retain(|e| !(e.via == *via && e.sequence < sequence));
                removed = before - bucket.len();
                if bucket.is_empty() {
                    per_origin.remove(origin);
                }
            }
            if per_origin.is_empty() {
                self.entries.remove(dest);
            }
        }
        removed
    }

    /// Drops every entry whose next hop is the given peer (peer death).
    pub fn remove_via(&mut self, via: &AgentId) -> Vec<RouteEntry> {
        let mut dropped = Vec::new();
        self.entries.retain(|_, per_origin| {
            per_origin.retain(|_, bucket| {
                bucket.retain(|e| {
                    if e.via == *via {
                        dropped.push(e.clone());
                        false
                    } else {
                        true
                    }
                });
                !bucket.is_empty()
            });
            !per_origin.is_empty()
        });
        dropped
    }

    /// Removes entries past their expiry, returning them for withdrawal
    /// flooding.
    pub fn expire(&mut self, now: Instant) -> Vec<RouteEntry> {
        let mut expired = Vec::new();
        self.entries.retain(|_, per_origin| {
            per_origin.retain(|_, bucket| {
                bucket.retain(|e| {
                    if e.expires_at <= now {
                        expired.push(e.clone());
                        false
                    } else {
                        true
                    }
                });
                !bucket.is_empty()
            });
            !per_origin.is_empty()
        });
        expired
    }

    /// Longest-prefix match; ties by lowest metric, then lowest origin id.
    pub fn lookup_ip(&self, ip: IpAddr) -> Option<&RouteEntry> {
        let mut best: Option<(&RouteEntry, u8)> = None;
        for (dest, per_origin) in &self.entries {
            let RouteDest::Cidr(prefix) = dest else {
                continue;
            };
            if !prefix.contains(ip) {
                continue;
            }
            for bucket in per_origin.values() {
                for entry in bucket {
                    let better = match best {
                        None => true,
                        Some((cur, cur_len)) => {
                            (prefix.len(), std::cmp::Reverse(entry.metric), std::cmp::Reverse(entry.origin))
                                > (cur_len, std::cmp::Reverse(cur.metric), std::cmp::Reverse(cur.origin))
                        }
                    };
                    if better {
                        best = Some((entry, prefix.len()));
                    }
                }
            }
        }
        best.map(|(entry, _)| entry)
    }

    /// Exact match beats wildcard; ties by metric then origin.
    pub fn lookup_domain(&self, name: &str) -> Option<&RouteEntry> {
        let mut best: Option<(&RouteEntry, bool)> = None;
        for (dest, per_origin) in &self.entries {
            let RouteDest::Domain(pattern) = dest else {
                continue;
            };
            if !pattern.matches(name) {
                continue;
            }
            let exact = pattern.is_exact();
            for bucket in per_origin.values() {
                for entry in bucket {
                    let better = match best {
                        None => true,
                        Some((cur, cur_exact)) => {
                            (exact, std::cmp::Reverse(entry.metric), std::cmp::Reverse(entry.origin))
                                > (cur_exact, std::cmp::Reverse(cur.metric), std::cmp::Reverse(cur.origin))
                        }
                    };
                    if better {
                        best = Some((entry, exact));
                    }
                }
            }
        }
        best.map(|(entry, _)| entry)
    }

    /// Route lookup for a stream destination.
    pub fn lookup_dest(&self, dest: &DestAddr) -> Option<&RouteEntry> {
        match dest {
            DestAddr::Ipv4(ip) => self.lookup_ip(IpAddr::V4(*ip)),
            DestAddr::Ipv6(ip) => self.lookup_ip(IpAddr::V6(*ip)),
            DestAddr::Domain(name) => self.lookup_domain(name),
        }
    }
}

/// Copy-on-write handle: the routing task is the single writer, lookups
/// read an immutable snapshot without blocking it.
#[derive(Clone, Default)]
pub struct SharedRouteTable {
    inner: Arc<RwLock<Arc<RouteTable>>>,
}

impl SharedRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current immutable snapshot.
    pub fn load(&self) -> Arc<RouteTable> {
        self.inner.read().clone()
    }

    /// Clones, mutates, and swaps the table in one step.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut RouteTable) -> R) -> R {
        let mut guard = self.inner.write();
        let mut table = (**guard).clone();
        let result = mutate(&mut table);
        *guard = Arc::new(table);
        result
    }
}
