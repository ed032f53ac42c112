//! Logical network state: the tagged sum over physical, virtual, local,
//! unreachable and dummy variants, plus the bookkeeping they share.
//!
//! Operations that mutate kernel state go through the route controller;
//! callers (the registry) hold the write lock for the duration.

use std::collections::{BTreeMap, BTreeSet};

use crate::net::error::{NetError, NetResult};
use crate::net::physical::{PhysicalNetwork, PhysicalNetworkDelegate};
use crate::net::routes::RouteController;
use crate::net::uid_ranges::{UidRanges, SUB_PRIORITY_HIGHEST, SUB_PRIORITY_NO_DEFAULT};
use crate::net::vpn::VirtualNetwork;
use crate::net::{NetId, Uid};

/// The one interface the dummy network owns for its whole lifetime.
pub const DUMMY_INTERFACE: &str = "dummy0";

/// State shared by every network variant.
#[derive(Debug)]
pub(crate) struct NetBase {
    pub(crate) net_id: NetId,
    pub(crate) interfaces: BTreeSet<String>,
    /// Uid ranges keyed by subsidiary priority; iteration order is the
    /// priority order, smallest (= strongest) first.
    pub(crate) uid_ranges: BTreeMap<i32, UidRanges>,
    /// Empty means every uid is allowed.
    pub(crate) allowed_uids: UidRanges,
}

impl NetBase {
    pub(crate) fn new(net_id: NetId) -> NetBase {
        NetBase {
            net_id,
            interfaces: BTreeSet::new(),
            uid_ranges: BTreeMap::new(),
            allowed_uids: UidRanges::default(),
        }
    }

    pub(crate) fn has_interface(&self, interface: &str) -> bool {
        self.interfaces.contains(interface)
    }

    /// The strongest (numerically smallest) subPriority whose ranges
    /// contain `uid`, if any.
    pub(crate) fn applies_to_user(&self, uid: Uid) -> Option<i32> {
        self.uid_ranges
            .iter()
            .find(|(_, ranges)| ranges.has_uid(uid))
            .map(|(sub_priority, _)| *sub_priority)
    }

    pub(crate) fn add_uid_ranges(&mut self, ranges: &UidRanges, sub_priority: i32) {
        self.uid_ranges.entry(sub_priority).or_default().add(ranges);
    }

    pub(crate) fn remove_uid_ranges(&mut self, ranges: &UidRanges, sub_priority: i32) -> NetResult<()> {
        let Some(existing) = self.uid_ranges.get_mut(&sub_priority) else {
            return Err(NetError::NoSuchEntry(format!(
                "no uid ranges at subPriority {} on netId {}",
                sub_priority, self.net_id
            )));
        };
        existing.remove(ranges);
        if existing.is_empty() {
            self.uid_ranges.remove(&sub_priority);
        }
        Ok(())
    }

    pub(crate) fn is_uid_allowed(&self, uid: Uid) -> bool {
        self.allowed_uids.is_empty() || self.allowed_uids.has_uid(uid)
    }

    pub(crate) fn uid_ranges_summary(&self) -> String {
        self.uid_ranges
            .iter()
            .map(|(sub_priority, ranges)| format!("{}: {}", sub_priority, ranges))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn is_valid_sub_priority(sub_priority: i32) -> bool {
    (SUB_PRIORITY_HIGHEST..=SUB_PRIORITY_NO_DEFAULT).contains(&sub_priority)
}

// ── Small variants ────────────────────────────────────────────────────

/// The LAN/tethering pseudo-network. Singleton, cannot carry users.
#[derive(Debug)]
pub struct LocalNetwork {
    pub(crate) base: NetBase,
}

impl LocalNetwork {
    pub fn new(net_id: NetId) -> LocalNetwork {
        LocalNetwork { base: NetBase::new(net_id) }
    }
}

/// Sentinel absorbing traffic of uids declared to have no default network.
/// Carries uid ranges but never interfaces.
#[derive(Debug)]
pub struct UnreachableNetwork {
    pub(crate) base: NetBase,
}

impl UnreachableNetwork {
    pub fn new(net_id: NetId) -> UnreachableNetwork {
        UnreachableNetwork { base: NetBase::new(net_id) }
    }
}

/// Placeholder network owning the fixed `dummy0` interface.
#[derive(Debug)]
pub struct DummyNetwork {
    pub(crate) base: NetBase,
}

impl DummyNetwork {
    pub fn new(net_id: NetId) -> DummyNetwork {
        let mut base = NetBase::new(net_id);
        base.interfaces.insert(DUMMY_INTERFACE.to_string());
        DummyNetwork { base }
    }
}

// ── The sum type ──────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Network {
    Physical(PhysicalNetwork),
    Virtual(VirtualNetwork),
    Local(LocalNetwork),
    Unreachable(UnreachableNetwork),
    Dummy(DummyNetwork),
}

impl Network {
    pub(crate) fn base(&self) -> &NetBase {
        match self {
            Network::Physical(n) => &n.base,
            Network::Virtual(n) => &n.base,
            Network::Local(n) => &n.base,
            Network::Unreachable(n) => &n.base,
            Network::Dummy(n) => &n.base,
        }
    }

    pub(crate) fn base_mut(&mut self) -> &mut NetBase {
        match self {
            Network::Physical(n) => &mut n.base,
            Network::Virtual(n) => &mut n.base,
            Network::Local(n) => &mut n.base,
            Network::Unreachable(n) => &mut n.base,
            Network::Dummy(n) => &mut n.base,
        }
    }

    pub fn net_id(&self) -> NetId {
        self.base().net_id
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Network::Physical(_) => "PHYSICAL",
            Network::Virtual(_) => "VIRTUAL",
            Network::Local(_) => "LOCAL",
            Network::Unreachable(_) => "UNREACHABLE",
            Network::Dummy(_) => "DUMMY",
        }
    }

    pub fn is_physical(&self) -> bool {
        matches!(self, Network::Physical(_))
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Network::Virtual(_))
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Network::Unreachable(_))
    }

    pub fn as_physical(&self) -> Option<&PhysicalNetwork> {
        match self {
            Network::Physical(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_physical_mut(&mut self) -> Option<&mut PhysicalNetwork> {
        match self {
            Network::Physical(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_virtual(&self) -> Option<&VirtualNetwork> {
        match self {
            Network::Virtual(n) => Some(n),
            _ => None,
        }
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.base().has_interface(interface)
    }

    pub fn interfaces(&self) -> &BTreeSet<String> {
        &self.base().interfaces
    }

    pub fn can_add_users(&self) -> bool {
        matches!(
            self,
            Network::Physical(_) | Network::Virtual(_) | Network::Unreachable(_)
        )
    }

    /// The strongest subPriority that applies to `uid`, if any.
    pub fn applies_to_user(&self, uid: Uid) -> Option<i32> {
        self.base().applies_to_user(uid)
    }

    pub fn add_interface(
        &mut self,
        interface: &str,
        route: &dyn RouteController,
        delegate: &dyn PhysicalNetworkDelegate,
    ) -> NetResult<()> {
        match self {
            Network::Physical(n) => n.add_interface(interface, route, delegate),
            Network::Virtual(n) => n.add_interface(interface, route),
            Network::Local(n) => {
                if n.base.has_interface(interface) {
                    return Ok(());
                }
                route.add_interface_to_local_network(n.base.net_id, interface)?;
                n.base.interfaces.insert(interface.to_string());
                Ok(())
            }
            Network::Unreachable(_) | Network::Dummy(_) => Err(NetError::WrongVariant {
                net_id: self.net_id(),
                kind: self.kind(),
            }),
        }
    }

    pub fn remove_interface(
        &mut self,
        interface: &str,
        route: &dyn RouteController,
        delegate: &dyn PhysicalNetworkDelegate,
    ) -> NetResult<()> {
        match self {
            Network::Physical(n) => n.remove_interface(interface, route, delegate),
            Network::Virtual(n) => n.remove_interface(interface, route),
            Network::Local(n) => {
                if !n.base.has_interface(interface) {
                    return Ok(());
                }
                route.remove_interface_from_local_network(n.base.net_id, interface)?;
                n.base.interfaces.remove(interface);
                Ok(())
            }
            Network::Unreachable(_) | Network::Dummy(_) => Err(NetError::WrongVariant {
                net_id: self.net_id(),
                kind: self.kind(),
            }),
        }
    }

    /// Removes every interface, pressing on past failures so destruction
    /// always clears the bookkeeping. Returns the first error seen.
    pub fn clear_interfaces(
        &mut self,
        route: &dyn RouteController,
        delegate: &dyn PhysicalNetworkDelegate,
    ) -> NetResult<()> {
        let interfaces: Vec<String> = self.base().interfaces.iter().cloned().collect();
        let mut first_err = None;
        for interface in interfaces {
            if let Err(e) = self.remove_interface(&interface, route, delegate) {
                tracing::error!(net_id = self.net_id(), interface = %interface,
                    "failed to remove interface during teardown: {}", e);
                first_err.get_or_insert(e);
                self.base_mut().interfaces.remove(&interface);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    pub fn add_users(
        &mut self,
        ranges: &UidRanges,
        sub_priority: i32,
        route: &dyn RouteController,
    ) -> NetResult<()> {
        match self {
            Network::Physical(n) => {
                if !is_valid_sub_priority(sub_priority) {
                    return Err(NetError::InvalidArgument(format!(
                        "bad subPriority {}",
                        sub_priority
                    )));
                }
                for interface in &n.base.interfaces {
                    route.add_users_to_physical_network(
                        n.base.net_id,
                        interface,
                        ranges,
                        sub_priority,
                    )?;
                }
                n.base.add_uid_ranges(ranges, sub_priority);
                Ok(())
            }
            Network::Virtual(n) => {
                if sub_priority != SUB_PRIORITY_HIGHEST {
                    return Err(NetError::InvalidArgument(format!(
                        "VPNs only take subPriority {}, got {}",
                        SUB_PRIORITY_HIGHEST, sub_priority
                    )));
                }
                for interface in &n.base.interfaces {
                    route.add_users_to_virtual_network(
                        n.base.net_id,
                        interface,
                        n.is_secure(),
                        ranges,
                    )?;
                }
                n.base.add_uid_ranges(ranges, sub_priority);
                Ok(())
            }
            Network::Unreachable(n) => {
                if !is_valid_sub_priority(sub_priority) {
                    return Err(NetError::InvalidArgument(format!(
                        "bad subPriority {}",
                        sub_priority
                    )));
                }
                route.add_users_to_unreachable_network(ranges, sub_priority)?;
                n.base.add_uid_ranges(ranges, sub_priority);
                Ok(())
            }
            Network::Local(_) | Network::Dummy(_) => Err(NetError::WrongVariant {
                net_id: self.net_id(),
                kind: self.kind(),
            }),
        }
    }

    pub fn remove_users(
        &mut self,
        ranges: &UidRanges,
        sub_priority: i32,
        route: &dyn RouteController,
    ) -> NetResult<()> {
        match self {
            Network::Physical(n) => {
                for interface in &n.base.interfaces {
                    route.remove_users_from_physical_network(
                        n.base.net_id,
                        interface,
                        ranges,
                        sub_priority,
                    )?;
                }
                n.base.remove_uid_ranges(ranges, sub_priority)
            }
            Network::Virtual(n) => {
                for interface in &n.base.interfaces {
                    route.remove_users_from_virtual_network(
                        n.base.net_id,
                        interface,
                        n.is_secure(),
                        ranges,
                    )?;
                }
                n.base.remove_uid_ranges(ranges, sub_priority)
            }
            Network::Unreachable(n) => {
                route.remove_users_from_unreachable_network(ranges, sub_priority)?;
                n.base.remove_uid_ranges(ranges, sub_priority)
            }
            Network::Local(_) | Network::Dummy(_) => Err(NetError::WrongVariant {
                net_id: self.net_id(),
                kind: self.kind(),
            }),
        }
    }

    pub fn set_allowed_uids(&mut self, ranges: UidRanges) {
        self.base_mut().allowed_uids = ranges;
    }

    pub fn clear_allowed_uids(&mut self) {
        self.base_mut().allowed_uids = UidRanges::default();
    }

    /// Empty allowlist means every uid is allowed.
    pub fn is_uid_allowed(&self, uid: Uid) -> bool {
        self.base().is_uid_allowed(uid)
    }

    /// One-line summary for the state dump.
    pub fn describe(&self) -> String {
        let interfaces: Vec<&str> = self.base().interfaces.iter().map(String::as_str).collect();
        format!(
            "netId {} {} interfaces [{}]",
            self.net_id(),
            self.kind(),
            interfaces.join(", ")
        )
    }

    pub fn uid_ranges_summary(&self) -> String {
        self.base().uid_ranges_summary()
    }

    pub fn allowed_uids_summary(&self) -> String {
        if self.base().allowed_uids.is_empty() {
            String::new()
        } else {
            self.base().allowed_uids.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::uid_ranges::UidRange;

    #[test]
    fn test_applies_to_user_picks_strongest_sub_priority() {
        let mut base = NetBase::new(100);
        base.add_uid_ranges(&UidRanges::new(vec![UidRange::new(10000, 10999)]), 5);
        base.add_uid_ranges(&UidRanges::new(vec![UidRange::new(10500, 10600)]), 2);
        assert_eq!(base.applies_to_user(10550), Some(2));
        assert_eq!(base.applies_to_user(10000), Some(5));
        assert_eq!(base.applies_to_user(20000), None);
    }

    #[test]
    fn test_remove_uid_ranges_missing_sub_priority() {
        let mut base = NetBase::new(100);
        let ranges = UidRanges::new(vec![UidRange::single(10000)]);
        assert!(base.remove_uid_ranges(&ranges, 3).is_err());
        base.add_uid_ranges(&ranges, 3);
        assert!(base.remove_uid_ranges(&ranges, 3).is_ok());
        // The emptied priority level is gone entirely.
        assert!(base.uid_ranges.is_empty());
    }

    #[test]
    fn test_empty_allowlist_allows_everyone() {
        let base = NetBase::new(100);
        assert!(base.is_uid_allowed(0));
        assert!(base.is_uid_allowed(99999));
    }

    #[test]
    fn test_dummy_network_owns_fixed_interface() {
        let dummy = Network::Dummy(DummyNetwork::new(51));
        assert!(dummy.has_interface(DUMMY_INTERFACE));
        assert!(!dummy.can_add_users());
    }

    #[test]
    fn test_variant_probes() {
        let physical = Network::Physical(PhysicalNetwork::new(100, false));
        assert!(physical.is_physical() && !physical.is_virtual());
        assert!(physical.can_add_users());
        let unreachable = Network::Unreachable(UnreachableNetwork::new(52));
        assert!(unreachable.is_unreachable());
        assert!(unreachable.can_add_users());
        let local = Network::Local(LocalNetwork::new(99));
        assert!(!local.can_add_users());
    }
}
