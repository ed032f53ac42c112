//! The network controller registry.
//!
//! Thread-safety: methods here are called concurrently from every request
//! handler in the daemon. All shared state lives behind one reader-writer
//! lock, acquired at the public-method boundary. `*_locked` helpers assume
//! the lock is held and never re-enter the public API.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::net::error::{NetError, NetResult};
use crate::net::fwmark::{Fwmark, MARK_UNSET};
use crate::net::network::{DummyNetwork, LocalNetwork, Network, UnreachableNetwork};
use crate::net::permission::Permission;
use crate::net::physical::{FallthroughSnapshot, PhysicalNetwork};
use crate::net::routes::{RouteController, TableType};
use crate::net::uid_ranges::UidRanges;
use crate::net::vpn::{VirtualNetwork, VpnType};
use crate::net::{
    NetId, Uid, DUMMY_NET_ID, FIRST_APPLICATION_UID, INVALID_UID, LOCAL_NET_ID, MAX_NET_ID,
    MAX_OEM_ID, MIN_NET_ID, MIN_OEM_ID, NETID_UNSET, UNREACHABLE_NET_ID, VPN_UID,
};

// ── Collaborator contracts ────────────────────────────────────────────

/// Clears stale classifier qdiscs at registry construction.
pub trait TrafficController: Send + Sync {
    fn qdisc_del_dev_clsact(&self, interface: &str) -> NetResult<()>;
}

/// The external TCP-socket monitor. Polling is pointless without at least
/// one real physical network, so the registry toggles it on lifecycle
/// events.
pub trait TcpSocketMonitor: Send + Sync {
    fn resume_polling(&self);
    fn suspend_polling(&self);
}

/// Read-only view into the DNS resolver's per-network server configuration.
pub trait ResolverCtl: Send + Sync {
    fn has_nameservers(&self, net_id: NetId) -> bool;
}

/// Answer to "which network and mark does this app's traffic use".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkContext {
    pub app_net_id: NetId,
    pub app_mark: u32,
    pub dns_net_id: NetId,
    pub dns_mark: u32,
    pub uid: Uid,
}

// ── Registry state ────────────────────────────────────────────────────

struct State {
    networks: BTreeMap<NetId, Network>,
    users: HashMap<Uid, Permission>,
    /// `(uid, UNSET)` authorizes protecting sockets on any network;
    /// `(uid, n)` only on network n.
    protectable: HashSet<(Uid, NetId)>,
    default_net_id: NetId,
    /// Last netId that owned an ifindex. Never contains local-network
    /// interfaces; their addresses are meaningless on other networks.
    ifindex_to_last_net_id: HashMap<u32, NetId>,
    address_to_ifindices: HashMap<String, HashSet<u32>>,
}

impl State {
    fn network(&self, net_id: NetId) -> Option<&Network> {
        self.networks.get(&net_id)
    }

    fn network_mut(&mut self, net_id: NetId) -> Option<&mut Network> {
        self.networks.get_mut(&net_id)
    }

    fn network_for_interface(&self, interface: &str) -> NetId {
        for (net_id, network) in &self.networks {
            if network.has_interface(interface) {
                return *net_id;
            }
        }
        NETID_UNSET
    }

    fn virtual_network_for_user(&self, uid: Uid) -> Option<&Network> {
        self.networks
            .values()
            .find(|n| n.is_virtual() && n.applies_to_user(uid).is_some())
    }

    /// The default network with the strongest subPriority among physical
    /// and unreachable networks applying to `uid`. No-default rules never
    /// win because their subPriority sorts after every nominating rule.
    /// Equal subPriorities are a configuration error; the scan keeps the
    /// lowest netId, deterministically.
    fn physical_or_unreachable_network_for_user(&self, uid: Uid) -> Option<&Network> {
        let mut best: Option<&Network> = None;
        let mut best_sub_priority = crate::net::uid_ranges::SUB_PRIORITY_NO_DEFAULT;
        for network in self.networks.values() {
            if !network.is_physical() && !network.is_unreachable() {
                continue;
            }
            let Some(sub_priority) = network.applies_to_user(uid) else {
                continue;
            };
            if sub_priority == crate::net::uid_ranges::SUB_PRIORITY_NO_DEFAULT {
                continue;
            }
            if sub_priority < best_sub_priority {
                best = Some(network);
                best_sub_priority = sub_priority;
            }
        }
        best
    }

    fn network_for_connect(&self, uid: Uid) -> NetId {
        match self.physical_or_unreachable_network_for_user(uid) {
            Some(network) => network.net_id(),
            None => self.default_net_id,
        }
    }

    fn permission_for_user(&self, uid: Uid) -> Permission {
        if let Some(permission) = self.users.get(&uid) {
            return *permission;
        }
        if uid < FIRST_APPLICATION_UID {
            Permission::SYSTEM
        } else {
            Permission::NONE
        }
    }

    fn is_protectable(&self, uid: Uid, net_id: NetId) -> bool {
        self.protectable.contains(&(uid, NETID_UNSET)) || self.protectable.contains(&(uid, net_id))
    }

    fn can_protect(&self, uid: Uid, net_id: NetId) -> bool {
        self.permission_for_user(uid).is_system() || self.is_protectable(uid, net_id)
    }

    fn check_user_network_access(&self, uid: Uid, net_id: NetId) -> NetResult<()> {
        let Some(network) = self.network(net_id) else {
            return Err(NetError::NoNetwork(net_id));
        };
        // An unidentifiable peer gets nothing, even on a valid network.
        if uid == INVALID_UID {
            return Err(NetError::RemoteIo);
        }
        let user_permission = self.permission_for_user(uid);
        if user_permission.is_system() {
            return Ok(());
        }
        // A VPN is usable iff it applies to the uid.
        if network.is_virtual() {
            return match network.applies_to_user(uid) {
                Some(_) => Ok(()),
                None => Err(NetError::PermissionDenied(uid)),
            };
        }
        // Under a secure VPN a uid may only step outside if it can protect
        // its sockets on the target network.
        if let Some(vpn) = self.virtual_network_for_user(uid) {
            let secure = vpn.as_virtual().map(VirtualNetwork::is_secure).unwrap_or(false);
            if secure && !self.is_protectable(uid, net_id) {
                tracing::warn!(uid, vpn = vpn.net_id(),
                    "uid may not select networks other than its secure VPN");
                return Err(NetError::PermissionDenied(uid));
            }
        }
        // A physical network with a matching uid range is usable regardless
        // of permission bits.
        if network.is_physical() && network.applies_to_user(uid).is_some() {
            return Ok(());
        }
        // Only uids configured as "no default network" may use the
        // unreachable network.
        if network.is_unreachable() {
            return match network.applies_to_user(uid) {
                Some(_) => Ok(()),
                None => Err(NetError::PermissionDenied(uid)),
            };
        }
        if !network.is_uid_allowed(uid) {
            return Err(NetError::AccessDenied(uid));
        }
        let network_permission = network
            .as_physical()
            .map(PhysicalNetwork::permission)
            .unwrap_or(Permission::NONE);
        if user_permission.satisfies(network_permission) {
            Ok(())
        } else {
            Err(NetError::AccessDenied(uid))
        }
    }

    /// Computes the DNS fwmark for `(net_id, uid)`, possibly rewriting the
    /// requested netId.
    fn network_for_dns(&self, net_id: &mut NetId, uid: Uid, resolver: &dyn ResolverCtl) -> u32 {
        let mut fwmark = Fwmark {
            protected_from_vpn: true,
            permission: Permission::SYSTEM,
            ..Default::default()
        };

        let app_default = self.physical_or_unreachable_network_for_user(uid);
        let default_net_id = match app_default {
            Some(network) => network.net_id(),
            None => self.default_net_id,
        };

        // Common case: no VPN applies and the query named no network, so
        // the default can be selected explicitly and everything below is
        // skipped.
        if *net_id == NETID_UNSET && self.virtual_network_for_user(uid).is_none() {
            *net_id = default_net_id;
            fwmark.net_id = *net_id;
            fwmark.explicitly_selected = true;
            return fwmark.encode();
        }

        if self.check_user_network_access(uid, *net_id).is_ok() {
            // The caller named a network it may use: stick to it, except
            // that a VPN without nameservers would make the query fail, so
            // route it through the default instead.
            fwmark.explicitly_selected = true;
            if let Some(network) = self.network(*net_id) {
                if network.is_virtual() && !resolver.has_nameservers(*net_id) {
                    *net_id = default_net_id;
                }
            }
        } else if let Some(vpn) = self.virtual_network_for_user(uid) {
            if resolver.has_nameservers(vpn.net_id()) {
                // Explicitly selecting the VPN here prevents fallthrough.
                fwmark.explicitly_selected = true;
                *net_id = vpn.net_id();
            } else {
                *net_id = default_net_id;
            }
        } else {
            *net_id = default_net_id;
        }
        fwmark.net_id = *net_id;
        fwmark.encode()
    }

    fn vpn_net_ids(&self, excluding: Option<NetId>) -> Vec<NetId> {
        self.networks
            .values()
            .filter(|n| n.is_virtual() && Some(n.net_id()) != excluding)
            .map(Network::net_id)
            .collect()
    }
}

fn keep_first(first: &mut Option<NetError>, result: NetResult<()>) {
    if let Err(e) = result {
        first.get_or_insert(e);
    }
}

// ── The controller ────────────────────────────────────────────────────

pub struct NetworkController {
    state: RwLock<State>,
    route: Arc<dyn RouteController>,
    monitor: Arc<dyn TcpSocketMonitor>,
    resolver: Arc<dyn ResolverCtl>,
}

impl NetworkController {
    pub fn new(
        route: Arc<dyn RouteController>,
        monitor: Arc<dyn TcpSocketMonitor>,
        resolver: Arc<dyn ResolverCtl>,
        traffic: &dyn TrafficController,
        interfaces: &[String],
    ) -> NetworkController {
        let mut networks = BTreeMap::new();
        networks.insert(LOCAL_NET_ID, Network::Local(LocalNetwork::new(LOCAL_NET_ID)));
        networks.insert(DUMMY_NET_ID, Network::Dummy(DummyNetwork::new(DUMMY_NET_ID)));
        networks.insert(
            UNREACHABLE_NET_ID,
            Network::Unreachable(UnreachableNetwork::new(UNREACHABLE_NET_ID)),
        );

        let mut protectable = HashSet::new();
        protectable.insert((VPN_UID, NETID_UNSET));

        // Clear stale clsact classifiers left behind by a previous daemon
        // instance. Most interfaces won't have one.
        for interface in interfaces {
            if let Err(e) = traffic.qdisc_del_dev_clsact(interface) {
                tracing::debug!(interface = %interface, "no clsact to clear: {}", e);
            }
        }

        NetworkController {
            state: RwLock::new(State {
                networks,
                users: HashMap::new(),
                protectable,
                default_net_id: NETID_UNSET,
                ifindex_to_last_net_id: HashMap::new(),
                address_to_ifindices: HashMap::new(),
            }),
            route,
            monitor,
            resolver,
        }
    }

    // ── Default network ───────────────────────────────────────────────

    pub fn get_default_network(&self) -> NetId {
        self.state.read().default_net_id
    }

    pub fn set_default_network(&self, net_id: NetId) -> NetResult<()> {
        let mut state = self.state.write();
        if net_id == state.default_net_id {
            return Ok(());
        }
        let vpn_ids = state.vpn_net_ids(None);
        let route = &*self.route;
        let delegate = FallthroughSnapshot { vpn_net_ids: &vpn_ids, route };

        // Install the new default before dismantling the old one so
        // unmarked traffic always has somewhere to go.
        if net_id != NETID_UNSET {
            let Some(network) = state.network_mut(net_id) else {
                return Err(NetError::NoNetwork(net_id));
            };
            let Some(physical) = network.as_physical_mut() else {
                return Err(NetError::InvalidArgument(format!(
                    "cannot set default to non-physical netId {}",
                    net_id
                )));
            };
            physical.add_as_default(route, &delegate)?;
        }

        let previous = state.default_net_id;
        if previous != NETID_UNSET {
            match state.network_mut(previous).and_then(Network::as_physical_mut) {
                Some(physical) => physical.remove_as_default(route, &delegate)?,
                None => return Err(NetError::DanglingDefault(previous)),
            }
        }

        state.default_net_id = net_id;
        Ok(())
    }

    // ── Network lifecycle ─────────────────────────────────────────────

    pub fn create_physical_network(
        &self,
        net_id: NetId,
        permission: Permission,
        local: bool,
    ) -> NetResult<()> {
        let mut state = self.state.write();
        self.create_physical_network_locked(&mut state, net_id, permission, local)
    }

    /// Allocates the first free id in the OEM range and creates a physical
    /// network there.
    pub fn create_physical_oem_network(&self, permission: Permission) -> NetResult<NetId> {
        let mut state = self.state.write();
        let net_id = (MIN_OEM_ID..=MAX_OEM_ID)
            .find(|net_id| state.network(*net_id).is_none())
            .ok_or(NetError::Exhausted)?;
        self.create_physical_network_locked(&mut state, net_id, permission, false)?;
        Ok(net_id)
    }

    pub fn create_virtual_network(
        &self,
        net_id: NetId,
        secure: bool,
        vpn_type: VpnType,
        exclude_local_routes: bool,
    ) -> NetResult<()> {
        let mut state = self.state.write();
        if !(MIN_NET_ID..=MAX_NET_ID).contains(&net_id) {
            return Err(NetError::InvalidArgument(format!("invalid netId {}", net_id)));
        }
        if state.network(net_id).is_some() {
            return Err(NetError::Duplicate(format!("netId {}", net_id)));
        }
        // The VPN must be reachable through the current default from the
        // moment it exists.
        self.modify_fallthrough_locked(&state, net_id, true)?;
        state.networks.insert(
            net_id,
            Network::Virtual(VirtualNetwork::new(net_id, secure, vpn_type, exclude_local_routes)),
        );
        Ok(())
    }

    /// Tears a network down, pressing on past failures: leaving stale
    /// state behind wedges the whole daemon far worse than a leaked kernel
    /// rule does. Returns the first error encountered.
    pub fn destroy_network(&self, net_id: NetId) -> NetResult<()> {
        let mut state = self.state.write();
        if net_id == LOCAL_NET_ID || net_id == UNREACHABLE_NET_ID {
            return Err(NetError::InvalidArgument(
                "cannot destroy local or unreachable network".to_string(),
            ));
        }
        if state.network(net_id).is_none() {
            return Err(NetError::NoNetwork(net_id));
        }

        let vpn_ids = state.vpn_net_ids(Some(net_id));
        let was_default = state.default_net_id == net_id;
        let mut network = state.networks.remove(&net_id).expect("presence checked above");
        let mut first_err: Option<NetError> = None;

        let route = &*self.route;
        let delegate = FallthroughSnapshot { vpn_net_ids: &vpn_ids, route };
        keep_first(&mut first_err, network.clear_interfaces(route, &delegate));
        if was_default {
            if let Some(physical) = network.as_physical_mut() {
                keep_first(&mut first_err, physical.remove_as_default(route, &delegate));
            }
            state.default_net_id = NETID_UNSET;
        } else if network.is_virtual() {
            keep_first(
                &mut first_err,
                self.modify_fallthrough_locked(&state, net_id, false),
            );
        }

        state.ifindex_to_last_net_id.retain(|_, last| *last != net_id);
        self.update_tcp_socket_monitor_polling(&state);

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // ── Interfaces ────────────────────────────────────────────────────

    pub fn add_interface_to_network(&self, net_id: NetId, interface: &str) -> NetResult<()> {
        let mut state = self.state.write();
        if state.network(net_id).is_none() {
            return Err(NetError::NoNetwork(net_id));
        }
        let existing = state.network_for_interface(interface);
        if existing != NETID_UNSET && existing != net_id {
            return Err(NetError::Busy {
                interface: interface.to_string(),
                net_id: existing,
            });
        }
        let vpn_ids = state.vpn_net_ids(None);
        let route = &*self.route;
        let delegate = FallthroughSnapshot { vpn_net_ids: &vpn_ids, route };
        state
            .network_mut(net_id)
            .expect("presence checked above")
            .add_interface(interface, route, &delegate)?;

        // Track which netId last owned the ifindex, so address removal can
        // tell a VPN handover from a real loss. Local-network interfaces
        // are skipped: their addresses mean nothing elsewhere.
        if net_id != LOCAL_NET_ID {
            let ifindex = self.route.get_if_index(interface);
            if ifindex != 0 {
                state.ifindex_to_last_net_id.insert(ifindex, net_id);
            } else {
                // Cannot happen: attaching the interface above would have
                // failed without an index.
                tracing::error!(interface, "added interface with no index");
            }
        }
        Ok(())
    }

    pub fn remove_interface_from_network(&self, net_id: NetId, interface: &str) -> NetResult<()> {
        let mut state = self.state.write();
        if state.network(net_id).is_none() {
            return Err(NetError::NoNetwork(net_id));
        }
        let vpn_ids = state.vpn_net_ids(None);
        let route = &*self.route;
        let delegate = FallthroughSnapshot { vpn_net_ids: &vpn_ids, route };
        state
            .network_mut(net_id)
            .expect("presence checked above")
            .remove_interface(interface, route, &delegate)
    }

    // ── Routes ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn add_route(
        &self,
        net_id: NetId,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        legacy: bool,
        uid: Uid,
        mtu: i32,
    ) -> NetResult<()> {
        self.modify_route(RouteOp::Add, net_id, interface, destination, nexthop, legacy, uid, mtu)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_route(
        &self,
        net_id: NetId,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        legacy: bool,
        uid: Uid,
        mtu: i32,
    ) -> NetResult<()> {
        self.modify_route(RouteOp::Update, net_id, interface, destination, nexthop, legacy, uid, mtu)
    }

    pub fn remove_route(
        &self,
        net_id: NetId,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        legacy: bool,
        uid: Uid,
    ) -> NetResult<()> {
        self.modify_route(RouteOp::Remove, net_id, interface, destination, nexthop, legacy, uid, 0)
    }

    #[allow(clippy::too_many_arguments)]
    fn modify_route(
        &self,
        op: RouteOp,
        net_id: NetId,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        legacy: bool,
        uid: Uid,
        mtu: i32,
    ) -> NetResult<()> {
        let state = self.state.read();
        if state.network(net_id).is_none() {
            return Err(NetError::NoNetwork(net_id));
        }
        let existing = state.network_for_interface(interface);
        if existing == NETID_UNSET {
            return Err(NetError::NoInterface(interface.to_string()));
        }
        if existing != net_id {
            return Err(NetError::WrongNetwork {
                interface: interface.to_string(),
                actual: existing,
                requested: net_id,
            });
        }

        let table = if net_id == LOCAL_NET_ID {
            TableType::LocalNetwork
        } else if legacy {
            if state.permission_for_user(uid).is_system() {
                TableType::LegacySystem
            } else {
                TableType::LegacyNetwork
            }
        } else {
            TableType::Interface
        };

        match op {
            RouteOp::Add => self
                .route
                .add_route(interface, destination, nexthop, table, mtu, 0),
            RouteOp::Update => self
                .route
                .update_route(interface, destination, nexthop, table, mtu),
            RouteOp::Remove => self
                .route
                .remove_route(interface, destination, nexthop, table, 0),
        }
    }

    // ── Permissions and users ─────────────────────────────────────────

    pub fn get_permission_for_user(&self, uid: Uid) -> Permission {
        self.state.read().permission_for_user(uid)
    }

    pub fn set_permission_for_users(&self, permission: Permission, uids: &[Uid]) {
        let mut state = self.state.write();
        for uid in uids {
            state.users.insert(*uid, permission);
        }
    }

    pub fn set_permission_for_networks(
        &self,
        permission: Permission,
        net_ids: &[NetId],
    ) -> NetResult<()> {
        let mut state = self.state.write();
        let vpn_ids = state.vpn_net_ids(None);
        let route = &*self.route;
        let delegate = FallthroughSnapshot { vpn_net_ids: &vpn_ids, route };
        for net_id in net_ids {
            let Some(network) = state.network_mut(*net_id) else {
                return Err(NetError::NoNetwork(*net_id));
            };
            let kind = network.kind();
            let Some(physical) = network.as_physical_mut() else {
                return Err(NetError::WrongVariant { net_id: *net_id, kind });
            };
            physical.set_permission(permission, route, &delegate)?;
        }
        Ok(())
    }

    pub fn add_users_to_network(
        &self,
        net_id: NetId,
        ranges: &UidRanges,
        sub_priority: i32,
    ) -> NetResult<()> {
        let mut state = self.state.write();
        let Some(network) = state.network_mut(net_id) else {
            return Err(NetError::NoNetwork(net_id));
        };
        if !network.can_add_users() {
            return Err(NetError::WrongVariant { net_id, kind: network.kind() });
        }
        network.add_users(ranges, sub_priority, &*self.route)
    }

    pub fn remove_users_from_network(
        &self,
        net_id: NetId,
        ranges: &UidRanges,
        sub_priority: i32,
    ) -> NetResult<()> {
        let mut state = self.state.write();
        let Some(network) = state.network_mut(net_id) else {
            return Err(NetError::NoNetwork(net_id));
        };
        if !network.can_add_users() {
            return Err(NetError::WrongVariant { net_id, kind: network.kind() });
        }
        network.remove_users(ranges, sub_priority, &*self.route)
    }

    // ── Socket protection ─────────────────────────────────────────────

    pub fn allow_protect(&self, uid: Uid, net_id: NetId) -> NetResult<()> {
        let mut state = self.state.write();
        if state.protectable.insert((uid, net_id)) {
            Ok(())
        } else {
            Err(NetError::Duplicate(format!(
                "protect entry (uid {}, netId {})",
                uid, net_id
            )))
        }
    }

    pub fn deny_protect(&self, uid: Uid, net_id: NetId) -> NetResult<()> {
        let mut state = self.state.write();
        if state.protectable.remove(&(uid, net_id)) {
            Ok(())
        } else {
            Err(NetError::NoSuchEntry(format!(
                "protect entry (uid {}, netId {})",
                uid, net_id
            )))
        }
    }

    pub fn can_protect(&self, uid: Uid, net_id: NetId) -> bool {
        self.state.read().can_protect(uid, net_id)
    }

    // ── Allowlists ────────────────────────────────────────────────────

    /// Atomic replacement: every network not mentioned ends up with an
    /// empty allowlist. Validation happens before any mutation.
    pub fn set_network_allowlist(&self, configs: &[(NetId, UidRanges)]) -> NetResult<()> {
        let mut state = self.state.write();
        for (net_id, _) in configs {
            if state.network(*net_id).is_none() {
                return Err(NetError::NoNetwork(*net_id));
            }
        }
        for network in state.networks.values_mut() {
            network.clear_allowed_uids();
        }
        for (net_id, ranges) in configs {
            state
                .network_mut(*net_id)
                .expect("validated above")
                .set_allowed_uids(ranges.clone());
        }
        Ok(())
    }

    /// `(UNSET, any)` is exempt while no default network exists so that
    /// hosts-file lookups keep working during early boot.
    pub fn is_uid_allowed(&self, net_id: NetId, uid: Uid) -> bool {
        let state = self.state.read();
        if net_id == NETID_UNSET && state.default_net_id == NETID_UNSET {
            return true;
        }
        state
            .network(net_id)
            .map(|network| network.is_uid_allowed(uid))
            .unwrap_or(false)
    }

    // ── Network selection ─────────────────────────────────────────────

    /// The network `uid` would use with nothing explicitly selected: its
    /// VPN if any, else its app default, else the global default.
    pub fn get_network_for_user(&self, uid: Uid) -> NetId {
        let state = self.state.read();
        if let Some(vpn) = state.virtual_network_for_user(uid) {
            return vpn.net_id();
        }
        state.network_for_connect(uid)
    }

    /// The netId stamped on sockets at connect time. VPNs deliberately do
    /// not win here: the socket keeps working across VPN teardown, and a
    /// secure VPN grabs the traffic via its routing rules regardless of
    /// the socket's mark.
    pub fn get_network_for_connect(&self, uid: Uid) -> NetId {
        self.state.read().network_for_connect(uid)
    }

    /// DNS resolution policy; may rewrite `net_id`. Returns the fwmark for
    /// the query's socket.
    pub fn get_network_for_dns(&self, net_id: &mut NetId, uid: Uid) -> u32 {
        self.state
            .read()
            .network_for_dns(net_id, uid, &*self.resolver)
    }

    pub fn get_network_context(&self, net_id: NetId, uid: Uid) -> NetworkContext {
        let state = self.state.read();
        let mut nc = NetworkContext {
            app_net_id: net_id,
            app_mark: MARK_UNSET,
            dns_net_id: net_id,
            dns_mark: MARK_UNSET,
            uid,
        };

        // A nonzero requested netId means the app deliberately bound to a
        // network, whether per-query or process-wide.
        let explicitly_selected = nc.app_net_id != NETID_UNSET;
        if !explicitly_selected {
            nc.app_net_id = state.network_for_connect(uid);
        }

        let fwmark = Fwmark {
            net_id: nc.app_net_id,
            explicitly_selected,
            protected_from_vpn: explicitly_selected && state.can_protect(uid, nc.app_net_id),
            permission: state.permission_for_user(uid),
        };
        nc.app_mark = fwmark.encode();
        nc.dns_mark = state.network_for_dns(&mut nc.dns_net_id, uid, &*self.resolver);

        tracing::debug!(
            app_netid = nc.app_net_id,
            app_mark = format_args!("{:#x}", nc.app_mark),
            dns_netid = nc.dns_net_id,
            dns_mark = format_args!("{:#x}", nc.dns_mark),
            uid,
            "network context"
        );
        nc
    }

    pub fn check_user_network_access(&self, uid: Uid, net_id: NetId) -> NetResult<()> {
        self.state.read().check_user_network_access(uid, net_id)
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn get_network_for_interface(&self, interface: &str) -> NetId {
        self.state.read().network_for_interface(interface)
    }

    pub fn is_virtual_network(&self, net_id: NetId) -> bool {
        self.state
            .read()
            .network(net_id)
            .map(Network::is_virtual)
            .unwrap_or(false)
    }

    // ── Interface addresses ───────────────────────────────────────────

    pub fn add_interface_address(&self, ifindex: u32, address: &str) {
        let mut state = self.state.write();
        if ifindex == 0 {
            tracing::error!(address, "attempting to add address without ifindex");
            return;
        }
        state
            .address_to_ifindices
            .entry(address.to_string())
            .or_default()
            .insert(ifindex);
    }

    /// Returns whether the caller should force-close sockets bound to the
    /// removed address. `false` only for a VPN handover: another interface
    /// in the same VPN still carries the address.
    pub fn remove_interface_address(&self, ifindex: u32, address: &str) -> bool {
        let mut state = self.state.write();
        let Some(ifindices) = state.address_to_ifindices.get_mut(address) else {
            tracing::error!(address, ifindex, "removing unknown address");
            return true;
        };
        if !ifindices.remove(&ifindex) {
            tracing::error!(address, ifindex, "no record of address on interface");
            return true;
        }
        if ifindices.is_empty() {
            // The address is no longer configured anywhere.
            state.address_to_ifindices.remove(address);
            return true;
        }
        let Some(&last_net_id) = state.ifindex_to_last_net_id.get(&ifindex) else {
            tracing::warn!(ifindex, "interface was never in a connected non-local netId");
            return true;
        };
        let remaining = &state.address_to_ifindices[address];
        for other in remaining {
            let Some(&active_net_id) = state.ifindex_to_last_net_id.get(other) else {
                continue;
            };
            let still_virtual = state
                .network(active_net_id)
                .map(Network::is_virtual)
                .unwrap_or(false);
            if active_net_id == last_net_id && still_virtual {
                return false;
            }
        }
        true
    }

    // ── Diagnostics ───────────────────────────────────────────────────

    pub fn dump(&self) -> String {
        use std::fmt::Write as _;

        let state = self.state.read();
        let mut out = String::new();
        let _ = writeln!(out, "NetworkController");
        let _ = writeln!(out, "  Default network: {}", state.default_net_id);
        let _ = writeln!(out, "  Networks:");
        for network in state.networks.values() {
            let _ = writeln!(out, "    {}", network.describe());
            if let Some(physical) = network.as_physical() {
                let _ = writeln!(out, "      Required permission: {}", physical.permission());
                if physical.is_local() {
                    let _ = writeln!(out, "      Local physical network");
                }
            }
            if let Some(vpn) = network.as_virtual() {
                let _ = writeln!(
                    out,
                    "      Secure: {} type {:?} excludes local routes: {}",
                    vpn.is_secure(),
                    vpn.vpn_type(),
                    vpn.excludes_local_routes()
                );
            }
            let ranges = network.uid_ranges_summary();
            if !ranges.is_empty() {
                let _ = writeln!(out, "      Per-app uid ranges: {}", ranges);
            }
            let allowed = network.allowed_uids_summary();
            if !allowed.is_empty() {
                let _ = writeln!(out, "      Allowed uid ranges: {}", allowed);
            }
        }
        let _ = writeln!(out, "  Interface <-> last network map:");
        for (ifindex, net_id) in &state.ifindex_to_last_net_id {
            let _ = writeln!(out, "    ifindex {} netId {}", ifindex, net_id);
        }
        let _ = writeln!(out, "  Interface addresses:");
        for (address, ifindices) in &state.address_to_ifindices {
            let mut indices: Vec<u32> = ifindices.iter().copied().collect();
            indices.sort_unstable();
            let _ = writeln!(out, "    {} on ifindices {:?}", address, indices);
        }
        let _ = writeln!(out, "  Permission of users:");
        for (uid, permission) in &state.users {
            let _ = writeln!(out, "    uid {}: {}", uid, permission);
        }
        let _ = writeln!(out, "  Protectable users:");
        for (uid, net_id) in &state.protectable {
            let _ = writeln!(out, "    uid {} netId {}", uid, net_id);
        }
        out
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn create_physical_network_locked(
        &self,
        state: &mut State,
        net_id: NetId,
        permission: Permission,
        local: bool,
    ) -> NetResult<()> {
        let in_general = (MIN_NET_ID..=MAX_NET_ID).contains(&net_id);
        let in_oem = (MIN_OEM_ID..=MAX_OEM_ID).contains(&net_id);
        if !in_general && !in_oem {
            return Err(NetError::InvalidArgument(format!("invalid netId {}", net_id)));
        }
        if state.network(net_id).is_some() {
            return Err(NetError::Duplicate(format!("netId {}", net_id)));
        }

        let mut physical = PhysicalNetwork::new(net_id, local);
        let vpn_ids = state.vpn_net_ids(None);
        let route = &*self.route;
        let delegate = FallthroughSnapshot { vpn_net_ids: &vpn_ids, route };
        // Cannot fail on a network with no interfaces, but propagate anyway.
        physical.set_permission(permission, route, &delegate)?;

        state.networks.insert(net_id, Network::Physical(physical));
        self.update_tcp_socket_monitor_polling(state);
        Ok(())
    }

    /// Adds or removes `vpn_net_id`'s fallthrough routes on every interface
    /// of the current default network.
    fn modify_fallthrough_locked(&self, state: &State, vpn_net_id: NetId, add: bool) -> NetResult<()> {
        if state.default_net_id == NETID_UNSET {
            return Ok(());
        }
        let Some(network) = state.network(state.default_net_id) else {
            return Err(NetError::DanglingDefault(state.default_net_id));
        };
        let Some(physical) = network.as_physical() else {
            return Err(NetError::InvalidArgument(format!(
                "default network {} is not physical",
                state.default_net_id
            )));
        };
        for interface in network.interfaces() {
            let result = if add {
                self.route
                    .add_virtual_network_fallthrough(vpn_net_id, interface, physical.permission())
            } else {
                self.route.remove_virtual_network_fallthrough(
                    vpn_net_id,
                    interface,
                    physical.permission(),
                )
            };
            result?;
        }
        Ok(())
    }

    /// The monitor only earns its keep while a real (service-assigned or
    /// higher) physical network exists.
    fn update_tcp_socket_monitor_polling(&self, state: &State) {
        let physical_network_exists = state
            .networks
            .values()
            .any(|n| n.is_physical() && n.net_id() >= MIN_NET_ID);
        if physical_network_exists {
            self.monitor.resume_polling();
        } else {
            self.monitor.suspend_polling();
        }
    }
}

enum RouteOp {
    Add,
    Update,
    Remove,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::uid_ranges::{UidRange, SUB_PRIORITY_HIGHEST, SUB_PRIORITY_NO_DEFAULT};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeRoute {
        ops: Mutex<Vec<String>>,
        ifindexes: Mutex<HashMap<String, u32>>,
        next_ifindex: AtomicU32,
    }

    impl FakeRoute {
        fn new() -> Arc<FakeRoute> {
            Arc::new(FakeRoute {
                ops: Mutex::new(Vec::new()),
                ifindexes: Mutex::new(HashMap::new()),
                next_ifindex: AtomicU32::new(10),
            })
        }

        fn record(&self, op: String) {
            self.ops.lock().unwrap().push(op);
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }
    }

    impl RouteController for FakeRoute {
        fn initialize(&self, local_net_id: NetId) -> NetResult<()> {
            self.record(format!("init {}", local_net_id));
            Ok(())
        }

        fn get_if_index(&self, interface: &str) -> u32 {
            *self
                .ifindexes
                .lock()
                .unwrap()
                .entry(interface.to_string())
                .or_insert_with(|| self.next_ifindex.fetch_add(1, Ordering::SeqCst))
        }

        fn add_interface_to_physical_network(
            &self,
            net_id: NetId,
            interface: &str,
            _permission: Permission,
            _local: bool,
        ) -> NetResult<()> {
            self.record(format!("phys+ {} {}", net_id, interface));
            Ok(())
        }

        fn remove_interface_from_physical_network(
            &self,
            net_id: NetId,
            interface: &str,
            _permission: Permission,
            _local: bool,
        ) -> NetResult<()> {
            self.record(format!("phys- {} {}", net_id, interface));
            Ok(())
        }

        fn add_interface_to_virtual_network(
            &self,
            net_id: NetId,
            interface: &str,
            _secure: bool,
            _exclude_local_routes: bool,
        ) -> NetResult<()> {
            self.record(format!("virt+ {} {}", net_id, interface));
            Ok(())
        }

        fn remove_interface_from_virtual_network(
            &self,
            net_id: NetId,
            interface: &str,
            _secure: bool,
            _exclude_local_routes: bool,
        ) -> NetResult<()> {
            self.record(format!("virt- {} {}", net_id, interface));
            Ok(())
        }

        fn add_interface_to_local_network(&self, net_id: NetId, interface: &str) -> NetResult<()> {
            self.record(format!("local+ {} {}", net_id, interface));
            Ok(())
        }

        fn remove_interface_from_local_network(
            &self,
            net_id: NetId,
            interface: &str,
        ) -> NetResult<()> {
            self.record(format!("local- {} {}", net_id, interface));
            Ok(())
        }

        fn add_interface_to_default_network(
            &self,
            interface: &str,
            _permission: Permission,
        ) -> NetResult<()> {
            self.record(format!("default+ {}", interface));
            Ok(())
        }

        fn remove_interface_from_default_network(
            &self,
            interface: &str,
            _permission: Permission,
        ) -> NetResult<()> {
            self.record(format!("default- {}", interface));
            Ok(())
        }

        fn modify_physical_network_permission(
            &self,
            net_id: NetId,
            interface: &str,
            _old_permission: Permission,
            _new_permission: Permission,
        ) -> NetResult<()> {
            self.record(format!("perm {} {}", net_id, interface));
            Ok(())
        }

        fn add_virtual_network_fallthrough(
            &self,
            vpn_net_id: NetId,
            physical_interface: &str,
            _permission: Permission,
        ) -> NetResult<()> {
            self.record(format!("fall+ {} {}", vpn_net_id, physical_interface));
            Ok(())
        }

        fn remove_virtual_network_fallthrough(
            &self,
            vpn_net_id: NetId,
            physical_interface: &str,
            _permission: Permission,
        ) -> NetResult<()> {
            self.record(format!("fall- {} {}", vpn_net_id, physical_interface));
            Ok(())
        }

        fn add_users_to_physical_network(
            &self,
            net_id: NetId,
            interface: &str,
            _ranges: &UidRanges,
            sub_priority: i32,
        ) -> NetResult<()> {
            self.record(format!("pusers+ {} {} {}", net_id, interface, sub_priority));
            Ok(())
        }

        fn remove_users_from_physical_network(
            &self,
            net_id: NetId,
            interface: &str,
            _ranges: &UidRanges,
            sub_priority: i32,
        ) -> NetResult<()> {
            self.record(format!("pusers- {} {} {}", net_id, interface, sub_priority));
            Ok(())
        }

        fn add_users_to_virtual_network(
            &self,
            net_id: NetId,
            interface: &str,
            _secure: bool,
            _ranges: &UidRanges,
        ) -> NetResult<()> {
            self.record(format!("vusers+ {} {}", net_id, interface));
            Ok(())
        }

        fn remove_users_from_virtual_network(
            &self,
            net_id: NetId,
            interface: &str,
            _secure: bool,
            _ranges: &UidRanges,
        ) -> NetResult<()> {
            self.record(format!("vusers- {} {}", net_id, interface));
            Ok(())
        }

        fn add_users_to_unreachable_network(
            &self,
            _ranges: &UidRanges,
            sub_priority: i32,
        ) -> NetResult<()> {
            self.record(format!("uusers+ {}", sub_priority));
            Ok(())
        }

        fn remove_users_from_unreachable_network(
            &self,
            _ranges: &UidRanges,
            sub_priority: i32,
        ) -> NetResult<()> {
            self.record(format!("uusers- {}", sub_priority));
            Ok(())
        }

        fn add_route(
            &self,
            interface: &str,
            destination: &str,
            _nexthop: Option<&str>,
            table: TableType,
            _mtu: i32,
            _priority: i32,
        ) -> NetResult<()> {
            self.record(format!("route+ {} {} {:?}", interface, destination, table));
            Ok(())
        }

        fn update_route(
            &self,
            interface: &str,
            destination: &str,
            _nexthop: Option<&str>,
            table: TableType,
            _mtu: i32,
        ) -> NetResult<()> {
            self.record(format!("route~ {} {} {:?}", interface, destination, table));
            Ok(())
        }

        fn remove_route(
            &self,
            interface: &str,
            destination: &str,
            _nexthop: Option<&str>,
            table: TableType,
            _priority: i32,
        ) -> NetResult<()> {
            self.record(format!("route- {} {} {:?}", interface, destination, table));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMonitor {
        polling: AtomicBool,
    }

    impl TcpSocketMonitor for FakeMonitor {
        fn resume_polling(&self) {
            self.polling.store(true, Ordering::SeqCst);
        }

        fn suspend_polling(&self) {
            self.polling.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeResolver {
        with_nameservers: Mutex<HashSet<NetId>>,
    }

    impl FakeResolver {
        fn set_nameservers(&self, net_id: NetId) {
            self.with_nameservers.lock().unwrap().insert(net_id);
        }
    }

    impl ResolverCtl for FakeResolver {
        fn has_nameservers(&self, net_id: NetId) -> bool {
            self.with_nameservers.lock().unwrap().contains(&net_id)
        }
    }

    struct FakeTraffic;

    impl TrafficController for FakeTraffic {
        fn qdisc_del_dev_clsact(&self, _interface: &str) -> NetResult<()> {
            Ok(())
        }
    }

    fn new_controller() -> (
        NetworkController,
        Arc<FakeRoute>,
        Arc<FakeMonitor>,
        Arc<FakeResolver>,
    ) {
        let route = FakeRoute::new();
        let monitor = Arc::new(FakeMonitor::default());
        let resolver = Arc::new(FakeResolver::default());
        let controller = NetworkController::new(
            route.clone(),
            monitor.clone(),
            resolver.clone(),
            &FakeTraffic,
            &[],
        );
        (controller, route, monitor, resolver)
    }

    fn app_ranges(start: Uid, stop: Uid) -> UidRanges {
        UidRanges::new(vec![UidRange::new(start, stop)])
    }

    #[test]
    fn test_create_destroy_roundtrip() {
        let (ctrl, _route, _, _) = new_controller();
        assert!(ctrl.create_physical_network(100, Permission::NONE, false).is_ok());
        assert!(matches!(
            ctrl.create_physical_network(100, Permission::NONE, false),
            Err(NetError::Duplicate(_))
        ));
        assert!(ctrl.destroy_network(100).is_ok());
        assert!(matches!(ctrl.destroy_network(100), Err(NetError::NoNetwork(100))));
        assert!(matches!(
            ctrl.check_user_network_access(10001, 100),
            Err(NetError::NoNetwork(100))
        ));
    }

    #[test]
    fn test_netid_range_validation() {
        let (ctrl, _, _, _) = new_controller();
        // 99 is the local sentinel, below both assignable ranges.
        assert!(matches!(
            ctrl.create_physical_network(99, Permission::NONE, false),
            Err(NetError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctrl.create_physical_network(NETID_UNSET, Permission::NONE, false),
            Err(NetError::InvalidArgument(_))
        ));
        // OEM ids are valid for physical networks but not for VPNs.
        assert!(ctrl.create_physical_network(MIN_OEM_ID, Permission::NONE, false).is_ok());
        assert!(matches!(
            ctrl.create_virtual_network(MIN_OEM_ID + 1, false, VpnType::Service, false),
            Err(NetError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_destroying_sentinels_is_forbidden() {
        let (ctrl, _, _, _) = new_controller();
        assert!(matches!(
            ctrl.destroy_network(LOCAL_NET_ID),
            Err(NetError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctrl.destroy_network(UNREACHABLE_NET_ID),
            Err(NetError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_interface_belongs_to_one_network() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.create_physical_network(101, Permission::NONE, false).unwrap();
        ctrl.add_interface_to_network(100, "wlan0").unwrap();
        // Re-adding to the same network is a no-op.
        assert!(ctrl.add_interface_to_network(100, "wlan0").is_ok());
        assert!(matches!(
            ctrl.add_interface_to_network(101, "wlan0"),
            Err(NetError::Busy { .. })
        ));
        assert_eq!(ctrl.get_network_for_interface("wlan0"), 100);
        ctrl.remove_interface_from_network(100, "wlan0").unwrap();
        assert_eq!(ctrl.get_network_for_interface("wlan0"), NETID_UNSET);
        assert!(ctrl.add_interface_to_network(101, "wlan0").is_ok());
    }

    #[test]
    fn test_default_network_get_set() {
        let (ctrl, _, _, _) = new_controller();
        assert_eq!(ctrl.get_default_network(), NETID_UNSET);
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_default_network(100).unwrap();
        assert_eq!(ctrl.get_default_network(), 100);
        // Destroying the default clears it.
        ctrl.destroy_network(100).unwrap();
        assert_eq!(ctrl.get_default_network(), NETID_UNSET);
    }

    #[test]
    fn test_local_physical_network_cannot_be_default() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, true).unwrap();
        assert!(matches!(
            ctrl.set_default_network(100),
            Err(NetError::InvalidArgument(_))
        ));
        assert_eq!(ctrl.get_default_network(), NETID_UNSET);
        // A regular physical network is still fine.
        ctrl.create_physical_network(101, Permission::NONE, false).unwrap();
        ctrl.set_default_network(101).unwrap();
        assert_eq!(ctrl.get_default_network(), 101);
    }

    #[test]
    fn test_default_must_be_physical() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_virtual_network(101, false, VpnType::Service, false).unwrap();
        assert!(matches!(
            ctrl.set_default_network(101),
            Err(NetError::InvalidArgument(_))
        ));
        assert!(matches!(ctrl.set_default_network(200), Err(NetError::NoNetwork(200))));
    }

    #[test]
    fn test_context_for_default_network_without_vpn() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_default_network(100).unwrap();

        let nc = ctrl.get_network_context(NETID_UNSET, 10001);
        assert_eq!(nc.app_net_id, 100);
        assert_eq!(nc.dns_net_id, 100);

        let app_mark = Fwmark::decode(nc.app_mark);
        assert_eq!(app_mark.net_id, 100);
        assert!(!app_mark.explicitly_selected);
        assert!(!app_mark.protected_from_vpn);
        assert_eq!(app_mark.permission, Permission::NONE);

        let dns_mark = Fwmark::decode(nc.dns_mark);
        assert_eq!(dns_mark.net_id, 100);
        assert!(dns_mark.explicitly_selected);
        assert!(dns_mark.protected_from_vpn);
        assert_eq!(dns_mark.permission, Permission::SYSTEM);
    }

    #[test]
    fn test_context_explicit_selection_sets_protection() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_default_network(100).unwrap();
        ctrl.allow_protect(10001, NETID_UNSET).unwrap();

        let nc = ctrl.get_network_context(100, 10001);
        let app_mark = Fwmark::decode(nc.app_mark);
        assert!(app_mark.explicitly_selected);
        assert!(app_mark.protected_from_vpn);

        // Without a protect grant the explicit mark is not protected.
        let nc = ctrl.get_network_context(100, 10002);
        assert!(!Fwmark::decode(nc.app_mark).protected_from_vpn);
    }

    #[test]
    fn test_secure_vpn_blocks_other_networks() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_default_network(100).unwrap();
        ctrl.create_virtual_network(101, true, VpnType::Platform, false).unwrap();
        ctrl.add_users_to_network(101, &app_ranges(10001, 10001), SUB_PRIORITY_HIGHEST)
            .unwrap();

        // A uid outside the VPN is unaffected.
        assert!(ctrl.check_user_network_access(10002, 100).is_ok());
        // The covered uid cannot leave the secure VPN...
        assert!(matches!(
            ctrl.check_user_network_access(10001, 100),
            Err(NetError::PermissionDenied(10001))
        ));
        // ...until it is allowed to protect its sockets.
        ctrl.allow_protect(10001, NETID_UNSET).unwrap();
        assert!(ctrl.check_user_network_access(10001, 100).is_ok());
        // And it can always use the VPN itself.
        assert!(ctrl.check_user_network_access(10001, 101).is_ok());
    }

    #[test]
    fn test_system_permission_overrides_everything() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::SYSTEM, false).unwrap();
        // System uids (below FIRST_APPLICATION_UID) pass implicitly.
        assert!(ctrl.check_user_network_access(1000, 100).is_ok());
        // An app uid lacks the bits...
        assert!(matches!(
            ctrl.check_user_network_access(10001, 100),
            Err(NetError::AccessDenied(10001))
        ));
        // ...until granted.
        ctrl.set_permission_for_users(Permission::SYSTEM, &[10001]);
        assert!(ctrl.check_user_network_access(10001, 100).is_ok());
    }

    #[test]
    fn test_permission_bit_dominance() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NETWORK, false).unwrap();
        ctrl.set_permission_for_users(Permission::NETWORK, &[10001]);
        assert!(ctrl.check_user_network_access(10001, 100).is_ok());
        // NETWORK does not satisfy a SYSTEM requirement.
        ctrl.set_permission_for_networks(Permission::SYSTEM, &[100]).unwrap();
        assert!(matches!(
            ctrl.check_user_network_access(10001, 100),
            Err(NetError::AccessDenied(10001))
        ));
    }

    #[test]
    fn test_set_permission_requires_physical() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_virtual_network(101, false, VpnType::Service, false).unwrap();
        assert!(matches!(
            ctrl.set_permission_for_networks(Permission::SYSTEM, &[101]),
            Err(NetError::WrongVariant { net_id: 101, .. })
        ));
    }

    #[test]
    fn test_invalid_uid_is_rejected() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        assert!(matches!(
            ctrl.check_user_network_access(INVALID_UID, 100),
            Err(NetError::RemoteIo)
        ));
    }

    #[test]
    fn test_dns_fallback_for_vpn_without_nameservers() {
        let (ctrl, _, _, resolver) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_default_network(100).unwrap();
        ctrl.create_virtual_network(101, false, VpnType::Service, false).unwrap();
        ctrl.add_users_to_network(101, &app_ranges(10001, 10001), SUB_PRIORITY_HIGHEST)
            .unwrap();

        // VPN has no nameservers: requested netId is rewritten to the
        // default but stays explicitly selected.
        let mut net_id = 101;
        let mark = ctrl.get_network_for_dns(&mut net_id, 10001);
        assert_eq!(net_id, 100);
        assert!(Fwmark::decode(mark).explicitly_selected);

        // Once the VPN has nameservers it keeps the query.
        resolver.set_nameservers(101);
        let mut net_id = 101;
        let mark = ctrl.get_network_for_dns(&mut net_id, 10001);
        assert_eq!(net_id, 101);
        assert!(Fwmark::decode(mark).explicitly_selected);
    }

    #[test]
    fn test_dns_unspecified_query_under_vpn() {
        let (ctrl, _, _, resolver) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_default_network(100).unwrap();
        ctrl.create_virtual_network(101, true, VpnType::Platform, false).unwrap();
        ctrl.add_users_to_network(101, &app_ranges(10001, 10001), SUB_PRIORITY_HIGHEST)
            .unwrap();
        resolver.set_nameservers(101);

        // No netId given: the covered uid's query lands on the VPN.
        let mut net_id = NETID_UNSET;
        let mark = ctrl.get_network_for_dns(&mut net_id, 10001);
        assert_eq!(net_id, 101);
        assert!(Fwmark::decode(mark).explicitly_selected);

        // An uncovered uid gets the default, explicitly selected.
        let mut net_id = NETID_UNSET;
        let mark = ctrl.get_network_for_dns(&mut net_id, 10002);
        assert_eq!(net_id, 100);
        assert!(Fwmark::decode(mark).explicitly_selected);
    }

    #[test]
    fn test_vpn_does_not_win_connect_but_wins_user() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_default_network(100).unwrap();
        ctrl.create_virtual_network(101, false, VpnType::Service, false).unwrap();
        ctrl.add_users_to_network(101, &app_ranges(10001, 10001), SUB_PRIORITY_HIGHEST)
            .unwrap();

        assert_eq!(ctrl.get_network_for_connect(10001), 100);
        assert_eq!(ctrl.get_network_for_user(10001), 101);
        assert_eq!(ctrl.get_network_for_user(10002), 100);
    }

    #[test]
    fn test_per_app_default_priority() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_default_network(100).unwrap();
        ctrl.create_physical_network(101, Permission::NONE, false).unwrap();
        ctrl.create_physical_network(102, Permission::NONE, false).unwrap();
        ctrl.add_users_to_network(101, &app_ranges(10001, 10001), 5).unwrap();
        assert_eq!(ctrl.get_network_for_connect(10001), 101);
        // Numerically smaller subPriority wins.
        ctrl.add_users_to_network(102, &app_ranges(10001, 10001), 2).unwrap();
        assert_eq!(ctrl.get_network_for_connect(10001), 102);
        assert_eq!(ctrl.get_network_for_connect(10002), 100);
    }

    #[test]
    fn test_no_default_rule_does_not_nominate() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_default_network(100).unwrap();
        // A no-default rule on the unreachable network covers the uid but
        // nominates nothing, so connect still lands on the default.
        ctrl.add_users_to_network(
            UNREACHABLE_NET_ID,
            &app_ranges(10001, 10001),
            SUB_PRIORITY_NO_DEFAULT,
        )
        .unwrap();
        assert_eq!(ctrl.get_network_for_connect(10001), 100);
        // A nominating rule sends the uid to the unreachable network.
        ctrl.add_users_to_network(UNREACHABLE_NET_ID, &app_ranges(10001, 10001), 0)
            .unwrap();
        assert_eq!(ctrl.get_network_for_connect(10001), UNREACHABLE_NET_ID);
        assert!(ctrl.check_user_network_access(10001, UNREACHABLE_NET_ID).is_ok());
        assert!(matches!(
            ctrl.check_user_network_access(10002, UNREACHABLE_NET_ID),
            Err(NetError::PermissionDenied(10002))
        ));
    }

    #[test]
    fn test_add_users_variant_and_priority_validation() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_virtual_network(101, false, VpnType::Service, false).unwrap();
        assert!(matches!(
            ctrl.add_users_to_network(LOCAL_NET_ID, &app_ranges(1, 2), 0),
            Err(NetError::WrongVariant { .. })
        ));
        // VPNs only take the highest subPriority.
        assert!(matches!(
            ctrl.add_users_to_network(101, &app_ranges(1, 2), 5),
            Err(NetError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctrl.remove_users_from_network(101, &app_ranges(1, 2), 0),
            Err(NetError::NoSuchEntry(_))
        ));
    }

    #[test]
    fn test_oem_allocator_and_exhaustion() {
        let (ctrl, _, _, _) = new_controller();
        assert_eq!(ctrl.create_physical_oem_network(Permission::NONE).unwrap(), MIN_OEM_ID);
        assert_eq!(
            ctrl.create_physical_oem_network(Permission::NONE).unwrap(),
            MIN_OEM_ID + 1
        );
        for net_id in (MIN_OEM_ID + 2)..=MAX_OEM_ID {
            ctrl.create_physical_network(net_id, Permission::NONE, false).unwrap();
        }
        assert!(matches!(
            ctrl.create_physical_oem_network(Permission::NONE),
            Err(NetError::Exhausted)
        ));
        // Destroying one frees its id for the scan.
        ctrl.destroy_network(MIN_OEM_ID + 3).unwrap();
        assert_eq!(
            ctrl.create_physical_oem_network(Permission::NONE).unwrap(),
            MIN_OEM_ID + 3
        );
    }

    #[test]
    fn test_allowlist_replacement_is_total() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.create_physical_network(101, Permission::NONE, false).unwrap();

        ctrl.set_network_allowlist(&[(100, app_ranges(10001, 10001))]).unwrap();
        assert!(ctrl.is_uid_allowed(100, 10001));
        assert!(!ctrl.is_uid_allowed(100, 10002));
        // 101 was not mentioned: empty allowlist admits everyone.
        assert!(ctrl.is_uid_allowed(101, 10002));

        // Replacement clears 100's list entirely.
        ctrl.set_network_allowlist(&[(101, app_ranges(10002, 10002))]).unwrap();
        assert!(ctrl.is_uid_allowed(100, 10002));
        assert!(!ctrl.is_uid_allowed(101, 10001));

        // Validation precedes mutation: a bad netId leaves state intact.
        assert!(matches!(
            ctrl.set_network_allowlist(&[(101, app_ranges(1, 2)), (999, app_ranges(1, 2))]),
            Err(NetError::NoNetwork(999))
        ));
        assert!(!ctrl.is_uid_allowed(101, 10001));
        assert!(ctrl.is_uid_allowed(101, 10002));
    }

    #[test]
    fn test_allowlist_denies_access() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_network_allowlist(&[(100, app_ranges(10002, 10002))]).unwrap();
        assert!(matches!(
            ctrl.check_user_network_access(10001, 100),
            Err(NetError::AccessDenied(10001))
        ));
        assert!(ctrl.check_user_network_access(10002, 100).is_ok());
    }

    #[test]
    fn test_unset_netid_exempt_until_default_exists() {
        let (ctrl, _, _, _) = new_controller();
        assert!(ctrl.is_uid_allowed(NETID_UNSET, 10001));
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.set_default_network(100).unwrap();
        assert!(!ctrl.is_uid_allowed(NETID_UNSET, 10001));
        assert!(ctrl.is_uid_allowed(100, 10001));
    }

    #[test]
    fn test_fallthrough_follows_default_and_vpn_lifecycle() {
        let (ctrl, route, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.add_interface_to_network(100, "wlan0").unwrap();
        ctrl.set_default_network(100).unwrap();

        ctrl.create_virtual_network(101, true, VpnType::Platform, false).unwrap();
        assert!(route.ops().contains(&"fall+ 101 wlan0".to_string()));

        // Growing the default network extends every VPN's fallthrough.
        ctrl.add_interface_to_network(100, "eth0").unwrap();
        assert!(route.ops().contains(&"fall+ 101 eth0".to_string()));

        ctrl.destroy_network(101).unwrap();
        let ops = route.ops();
        assert!(ops.contains(&"fall- 101 wlan0".to_string()));
        assert!(ops.contains(&"fall- 101 eth0".to_string()));
    }

    #[test]
    fn test_default_switch_adds_before_removing() {
        let (ctrl, route, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.add_interface_to_network(100, "wlan0").unwrap();
        ctrl.create_physical_network(101, Permission::NONE, false).unwrap();
        ctrl.add_interface_to_network(101, "eth0").unwrap();
        ctrl.set_default_network(100).unwrap();

        ctrl.set_default_network(101).unwrap();
        let ops = route.ops();
        let added = ops.iter().position(|op| op == "default+ eth0").unwrap();
        let removed = ops.iter().position(|op| op == "default- wlan0").unwrap();
        assert!(added < removed);
        assert_eq!(ctrl.get_default_network(), 101);
    }

    #[test]
    fn test_vpn_handover_suppresses_socket_close() {
        let (ctrl, route, _, _) = new_controller();
        ctrl.create_virtual_network(101, false, VpnType::Service, false).unwrap();
        ctrl.add_interface_to_network(101, "tun0").unwrap();
        ctrl.add_interface_to_network(101, "tun1").unwrap();
        let if_tun0 = route.get_if_index("tun0");
        let if_tun1 = route.get_if_index("tun1");

        ctrl.add_interface_address(if_tun0, "2001:db8::1");
        ctrl.add_interface_address(if_tun1, "2001:db8::1");

        // Another interface in the same VPN still carries the address.
        assert!(!ctrl.remove_interface_address(if_tun0, "2001:db8::1"));
        // The last carrier goes away: sockets must die.
        assert!(ctrl.remove_interface_address(if_tun1, "2001:db8::1"));
    }

    #[test]
    fn test_address_removal_unknowns_are_fatal() {
        let (ctrl, route, _, _) = new_controller();
        // Unknown address.
        assert!(ctrl.remove_interface_address(7, "192.0.2.1"));
        // Known address, wrong interface.
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.add_interface_to_network(100, "wlan0").unwrap();
        let ifindex = route.get_if_index("wlan0");
        ctrl.add_interface_address(ifindex, "192.0.2.1");
        assert!(ctrl.remove_interface_address(ifindex + 1, "192.0.2.1"));
        // Same-address handover on a physical network still closes sockets.
        ctrl.create_physical_network(101, Permission::NONE, false).unwrap();
        ctrl.add_interface_to_network(101, "eth0").unwrap();
        let other = route.get_if_index("eth0");
        ctrl.add_interface_address(ifindex, "192.0.2.2");
        ctrl.add_interface_address(other, "192.0.2.2");
        assert!(ctrl.remove_interface_address(ifindex, "192.0.2.2"));
    }

    #[test]
    fn test_destroy_purges_ifindex_tracking() {
        let (ctrl, route, _, _) = new_controller();
        ctrl.create_virtual_network(101, false, VpnType::Service, false).unwrap();
        ctrl.add_interface_to_network(101, "tun0").unwrap();
        ctrl.add_interface_to_network(101, "tun1").unwrap();
        let if_tun0 = route.get_if_index("tun0");
        let if_tun1 = route.get_if_index("tun1");
        ctrl.add_interface_address(if_tun0, "2001:db8::1");
        ctrl.add_interface_address(if_tun1, "2001:db8::1");

        ctrl.destroy_network(101).unwrap();
        // Without the last-netId record, removal is always fatal.
        assert!(ctrl.remove_interface_address(if_tun0, "2001:db8::1"));
    }

    #[test]
    fn test_monitor_polling_tracks_physical_networks() {
        let (ctrl, _, monitor, _) = new_controller();
        assert!(!monitor.polling.load(Ordering::SeqCst));
        // OEM ids sit below MIN_NET_ID and do not enable polling.
        let oem = ctrl.create_physical_oem_network(Permission::NONE).unwrap();
        assert!(!monitor.polling.load(Ordering::SeqCst));
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        assert!(monitor.polling.load(Ordering::SeqCst));
        ctrl.destroy_network(100).unwrap();
        assert!(!monitor.polling.load(Ordering::SeqCst));
        ctrl.destroy_network(oem).unwrap();
    }

    #[test]
    fn test_route_table_selection() {
        let (ctrl, route, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NONE, false).unwrap();
        ctrl.add_interface_to_network(100, "wlan0").unwrap();

        ctrl.add_route(100, "wlan0", "192.0.2.0/24", None, false, 10001, 0).unwrap();
        ctrl.add_route(100, "wlan0", "192.0.2.0/24", None, true, 1000, 0).unwrap();
        ctrl.add_route(100, "wlan0", "192.0.2.0/24", None, true, 10001, 0).unwrap();
        let ops = route.ops();
        assert!(ops.contains(&"route+ wlan0 192.0.2.0/24 Interface".to_string()));
        assert!(ops.contains(&"route+ wlan0 192.0.2.0/24 LegacySystem".to_string()));
        assert!(ops.contains(&"route+ wlan0 192.0.2.0/24 LegacyNetwork".to_string()));

        assert!(matches!(
            ctrl.add_route(100, "eth0", "192.0.2.0/24", None, false, 10001, 0),
            Err(NetError::NoInterface(_))
        ));
        ctrl.create_physical_network(101, Permission::NONE, false).unwrap();
        assert!(matches!(
            ctrl.add_route(101, "wlan0", "192.0.2.0/24", None, false, 10001, 0),
            Err(NetError::WrongNetwork { .. })
        ));
    }

    #[test]
    fn test_protect_bookkeeping() {
        let (ctrl, _, _, _) = new_controller();
        // The platform VPN uid is seeded at construction.
        assert!(ctrl.can_protect(VPN_UID, 100));
        assert!(!ctrl.can_protect(10001, 100));
        ctrl.allow_protect(10001, 100).unwrap();
        assert!(ctrl.can_protect(10001, 100));
        assert!(!ctrl.can_protect(10001, 101));
        assert!(matches!(
            ctrl.allow_protect(10001, 100),
            Err(NetError::Duplicate(_))
        ));
        ctrl.deny_protect(10001, 100).unwrap();
        assert!(!ctrl.can_protect(10001, 100));
        assert!(matches!(
            ctrl.deny_protect(10001, 100),
            Err(NetError::NoSuchEntry(_))
        ));
        // System uids can always protect.
        assert!(ctrl.can_protect(1000, 100));
    }

    #[test]
    fn test_dump_mentions_core_state() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_physical_network(100, Permission::NETWORK, false).unwrap();
        ctrl.add_interface_to_network(100, "wlan0").unwrap();
        ctrl.set_default_network(100).unwrap();
        ctrl.create_physical_network(101, Permission::NONE, true).unwrap();
        ctrl.create_virtual_network(102, true, VpnType::Platform, true).unwrap();
        let dump = ctrl.dump();
        assert!(dump.contains("Default network: 100"));
        assert!(dump.contains("netId 100 PHYSICAL interfaces [wlan0]"));
        assert!(dump.contains("Required permission: NETWORK"));
        assert!(dump.contains("Local physical network"));
        assert!(dump.contains("Secure: true type Platform excludes local routes: true"));
        assert!(dump.contains("netId 99 LOCAL"));
        assert!(dump.contains("netId 51 DUMMY interfaces [dummy0]"));
    }

    #[test]
    fn test_at_most_one_vpn_applies() {
        let (ctrl, _, _, _) = new_controller();
        ctrl.create_virtual_network(101, false, VpnType::Service, false).unwrap();
        ctrl.create_virtual_network(102, false, VpnType::Service, false).unwrap();
        ctrl.add_users_to_network(101, &app_ranges(10000, 10499), SUB_PRIORITY_HIGHEST)
            .unwrap();
        ctrl.add_users_to_network(102, &app_ranges(10500, 10999), SUB_PRIORITY_HIGHEST)
            .unwrap();
        // Disjoint ranges: each uid sees exactly one VPN.
        assert_eq!(ctrl.get_network_for_user(10100), 101);
        assert_eq!(ctrl.get_network_for_user(10600), 102);
        // Moving a range keeps the invariant.
        ctrl.remove_users_from_network(101, &app_ranges(10000, 10499), SUB_PRIORITY_HIGHEST)
            .unwrap();
        assert_ne!(ctrl.get_network_for_user(10100), 101);
    }
}
