//! Destination addressing: direct endpoints, replica groups, and URIs.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::resolver::PartitionResolver;

/// Ports at or below this value mark pure-client processes, which have no
/// listening socket and cannot be the target of unsolicited sends.
pub const MAX_CLIENT_PORT: u16 = 1023;

/// A concrete ipv4 endpoint, 48 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndPoint {
    /// Host address as a big-endian u32.
    pub ip: u32,
    /// TCP/UDP port.
    pub port: u16,
}

impl EndPoint {
    /// The all-zero invalid endpoint.
    pub const INVALID: EndPoint = EndPoint { ip: 0, port: 0 };

    /// Build an endpoint from an ipv4 address and port.
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        EndPoint {
            ip: u32::from(ip),
            port,
        }
    }

    /// Loopback endpoint, used by in-process networks and tests.
    pub fn localhost(port: u16) -> Self {
        EndPoint::new(Ipv4Addr::LOCALHOST, port)
    }

    /// Whether this endpoint is the invalid sentinel.
    pub fn is_invalid(&self) -> bool {
        *self == EndPoint::INVALID
    }

    /// Whether the port lies in the pure-client range.
    pub fn is_pure_client(&self) -> bool {
        self.port <= MAX_CLIENT_PORT
    }

    /// Replace the port, keeping the host.
    pub fn with_port(self, port: u16) -> Self {
        EndPoint { ip: self.ip, port }
    }
}

impl std::fmt::Display for EndPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", Ipv4Addr::from(self.ip), self.port)
    }
}

impl From<SocketAddrV4> for EndPoint {
    fn from(a: SocketAddrV4) -> Self {
        EndPoint::new(*a.ip(), a.port())
    }
}

impl From<EndPoint> for SocketAddr {
    fn from(e: EndPoint) -> Self {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(e.ip), e.port))
    }
}

/// A named replica group with a mutable leader slot.
///
/// The group does not discover membership; callers install members and the
/// engine updates the leader slot as redirects and replies are observed.
pub struct GroupAddress {
    name: String,
    members: RwLock<Vec<EndPoint>>,
    leader_index: RwLock<Option<usize>>,
    update_leader_automatically: bool,
}

impl GroupAddress {
    /// Create a group with the given members. `auto_leader` enables the
    /// engine-side leader updates on redirects and forwarded replies.
    pub fn new(name: impl Into<String>, members: Vec<EndPoint>, auto_leader: bool) -> Arc<Self> {
        Arc::new(GroupAddress {
            name: name.into(),
            members: RwLock::new(members),
            leader_index: RwLock::new(None),
            update_leader_automatically: auto_leader,
        })
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the engine should track the leader automatically.
    pub fn is_update_leader_automatically(&self) -> bool {
        self.update_leader_automatically
    }

    /// The recorded leader, or an arbitrary member when none is recorded.
    ///
    /// Returns `EndPoint::INVALID` for an empty group.
    pub fn possible_leader(&self) -> EndPoint {
        let members = self.members.read().unwrap();
        if members.is_empty() {
            return EndPoint::INVALID;
        }
        let current = *self.leader_index.read().unwrap();
        match current {
            Some(i) if i < members.len() => members[i],
            _ => {
                let i = rand::thread_rng().gen_range(0..members.len());
                *self.leader_index.write().unwrap() = Some(i);
                members[i]
            }
        }
    }

    /// A uniformly random member, or `EndPoint::INVALID` for an empty group.
    pub fn random_member(&self) -> EndPoint {
        let members = self.members.read().unwrap();
        if members.is_empty() {
            return EndPoint::INVALID;
        }
        members[rand::thread_rng().gen_range(0..members.len())]
    }

    /// Record `ep` as the leader, adding it to the member set if absent.
    pub fn set_leader(&self, ep: EndPoint) {
        let mut members = self.members.write().unwrap();
        let idx = match members.iter().position(|m| *m == ep) {
            Some(i) => i,
            None => {
                members.push(ep);
                members.len() - 1
            }
        };
        *self.leader_index.write().unwrap() = Some(idx);
    }

    /// Rotate the leader slot to the next member, used when the recorded
    /// leader stops answering. Returns the new candidate.
    pub fn leader_forward(&self) -> EndPoint {
        let members = self.members.read().unwrap();
        if members.is_empty() {
            return EndPoint::INVALID;
        }
        let mut idx = self.leader_index.write().unwrap();
        let next = match *idx {
            Some(i) => (i + 1) % members.len(),
            None => 0,
        };
        *idx = Some(next);
        members[next]
    }

    /// Current leader, if one is recorded.
    pub fn leader(&self) -> Option<EndPoint> {
        let members = self.members.read().unwrap();
        let idx = self.leader_index.read().unwrap();
        idx.and_then(|i| members.get(i).copied())
    }

    /// Snapshot of the member list.
    pub fn members(&self) -> Vec<EndPoint> {
        self.members.read().unwrap().clone()
    }
}

impl std::fmt::Debug for GroupAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupAddress")
            .field("name", &self.name)
            .field("members", &self.members.read().unwrap().len())
            .finish()
    }
}

/// A named logical service resolved into concrete endpoints via a
/// [`PartitionResolver`].
pub struct UriAddress {
    uri: String,
    resolver: RwLock<Option<Arc<dyn PartitionResolver>>>,
}

impl UriAddress {
    /// Create a URI address with no resolver attached yet.
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Arc::new(UriAddress {
            uri: uri.into(),
            resolver: RwLock::new(None),
        })
    }

    /// The URI string.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Attach the resolver serving this URI.
    pub fn set_resolver(&self, resolver: Arc<dyn PartitionResolver>) {
        *self.resolver.write().unwrap() = Some(resolver);
    }

    /// The attached resolver, if any.
    pub fn resolver(&self) -> Option<Arc<dyn PartitionResolver>> {
        self.resolver.read().unwrap().clone()
    }
}

impl std::fmt::Debug for UriAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UriAddress").field("uri", &self.uri).finish()
    }
}

/// A logical destination: direct endpoint, replica group, or URI.
#[derive(Debug, Clone, Default)]
pub enum HostAddr {
    /// No destination set.
    #[default]
    Invalid,
    /// A single concrete endpoint.
    Ip(EndPoint),
    /// A replica group with leader tracking.
    Group(Arc<GroupAddress>),
    /// A resolver-backed logical service.
    Uri(Arc<UriAddress>),
}

impl HostAddr {
    /// Whether a destination is set.
    pub fn is_invalid(&self) -> bool {
        matches!(self, HostAddr::Invalid)
    }

    /// The group handle, when this is a group destination.
    pub fn group(&self) -> Option<&Arc<GroupAddress>> {
        match self {
            HostAddr::Group(g) => Some(g),
            _ => None,
        }
    }

    /// The URI handle, when this is a URI destination.
    pub fn uri(&self) -> Option<&Arc<UriAddress>> {
        match self {
            HostAddr::Uri(u) => Some(u),
            _ => None,
        }
    }
}

impl From<EndPoint> for HostAddr {
    fn from(e: EndPoint) -> Self {
        HostAddr::Ip(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let ep = EndPoint::new(Ipv4Addr::new(10, 1, 2, 3), 8080);
        assert_eq!(ep.to_string(), "10.1.2.3:8080");
    }

    #[test]
    fn test_endpoint_invalid_and_client_range() {
        assert!(EndPoint::INVALID.is_invalid());
        assert!(EndPoint::localhost(1023).is_pure_client());
        assert!(!EndPoint::localhost(1024).is_pure_client());
    }

    #[test]
    fn test_group_set_leader_known_member() {
        let a = EndPoint::localhost(5001);
        let b = EndPoint::localhost(5002);
        let group = GroupAddress::new("meta", vec![a, b], true);
        group.set_leader(b);
        assert_eq!(group.leader(), Some(b));
        assert_eq!(group.possible_leader(), b);
    }

    #[test]
    fn test_group_set_leader_adds_unknown_member() {
        let a = EndPoint::localhost(5001);
        let c = EndPoint::localhost(5003);
        let group = GroupAddress::new("meta", vec![a], true);
        group.set_leader(c);
        assert_eq!(group.leader(), Some(c));
        assert_eq!(group.members().len(), 2);
    }

    #[test]
    fn test_group_leader_forward_rotates() {
        let a = EndPoint::localhost(5001);
        let b = EndPoint::localhost(5002);
        let group = GroupAddress::new("meta", vec![a, b], true);
        group.set_leader(a);
        assert_eq!(group.leader_forward(), b);
        assert_eq!(group.leader_forward(), a);
    }

    #[test]
    fn test_group_random_member_is_a_member() {
        let members = vec![
            EndPoint::localhost(5001),
            EndPoint::localhost(5002),
            EndPoint::localhost(5003),
        ];
        let group = GroupAddress::new("meta", members.clone(), false);
        for _ in 0..32 {
            assert!(members.contains(&group.random_member()));
        }
    }

    #[test]
    fn test_empty_group_yields_invalid() {
        let group = GroupAddress::new("empty", vec![], true);
        assert!(group.possible_leader().is_invalid());
        assert!(group.random_member().is_invalid());
        assert!(group.leader_forward().is_invalid());
    }

    #[test]
    fn test_uri_resolver_slot() {
        let uri = UriAddress::new("strand://orders");
        assert!(uri.resolver().is_none());
        assert_eq!(uri.uri(), "strand://orders");
    }

    #[test]
    fn test_host_addr_accessors() {
        let ep = EndPoint::localhost(9000);
        let addr = HostAddr::from(ep);
        assert!(!addr.is_invalid());
        assert!(addr.group().is_none());
        assert!(HostAddr::Invalid.is_invalid());
    }
}
