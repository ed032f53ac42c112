//! Contract between the registry and the kernel routing layer, plus the
//! ip(8)-backed implementation the daemon binary wires in.
//!
//! Every logical network resolves to a per-interface routing table at
//! `ROUTE_TABLE_OFFSET_FROM_INDEX + ifindex`; policy rules select tables by
//! fwmark, uid range, or both. The registry never issues kernel commands
//! itself: it calls this trait while holding its lock, and the calls are
//! synchronous.

use std::process::Command;

use crate::net::error::{NetError, NetResult};
use crate::net::permission::Permission;
use crate::net::uid_ranges::UidRanges;
use crate::net::NetId;

/// Which routing table a route lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableType {
    /// Routes on the local pseudo-network.
    LocalNetwork,
    /// Legacy API routes installed by system apps.
    LegacySystem,
    /// Legacy API routes installed by ordinary apps.
    LegacyNetwork,
    /// Normal per-interface routes.
    Interface,
}

pub const ROUTE_TABLE_LOCAL_NETWORK: u32 = 97;
pub const ROUTE_TABLE_LEGACY_NETWORK: u32 = 98;
pub const ROUTE_TABLE_LEGACY_SYSTEM: u32 = 99;
const ROUTE_TABLE_OFFSET_FROM_INDEX: u32 = 1000;

// Policy rule priorities, smallest first. Relative order is load-bearing:
// secure VPNs must grab uid traffic before per-app defaults, and
// fallthrough must sit below the default-network rule.
const RULE_PRIORITY_SECURE_VPN: u32 = 12000;
const RULE_PRIORITY_EXPLICIT_NETWORK: u32 = 14000;
const RULE_PRIORITY_UID_DEFAULT_NETWORK: u32 = 16000;
const RULE_PRIORITY_UID_DEFAULT_UNREACHABLE: u32 = 18000;
const RULE_PRIORITY_DEFAULT_NETWORK: u32 = 20000;
const RULE_PRIORITY_VPN_FALLTHROUGH: u32 = 21000;
const RULE_PRIORITY_LOCAL_NETWORK: u32 = 22000;

/// The routing operations the registry delegates to the kernel layer.
///
/// Implementations may block on kernel I/O; callers hold the registry lock
/// for the duration of each call.
pub trait RouteController: Send + Sync {
    fn initialize(&self, local_net_id: NetId) -> NetResult<()>;

    /// Kernel interface index for `interface`, or 0 if unknown.
    fn get_if_index(&self, interface: &str) -> u32;

    fn add_interface_to_physical_network(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        local: bool,
    ) -> NetResult<()>;
    fn remove_interface_from_physical_network(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        local: bool,
    ) -> NetResult<()>;

    fn add_interface_to_virtual_network(
        &self,
        net_id: NetId,
        interface: &str,
        secure: bool,
        exclude_local_routes: bool,
    ) -> NetResult<()>;
    fn remove_interface_from_virtual_network(
        &self,
        net_id: NetId,
        interface: &str,
        secure: bool,
        exclude_local_routes: bool,
    ) -> NetResult<()>;

    fn add_interface_to_local_network(&self, net_id: NetId, interface: &str) -> NetResult<()>;
    fn remove_interface_from_local_network(&self, net_id: NetId, interface: &str) -> NetResult<()>;

    /// Unmarked-traffic rules pointing at the default network's interface.
    fn add_interface_to_default_network(
        &self,
        interface: &str,
        permission: Permission,
    ) -> NetResult<()>;
    fn remove_interface_from_default_network(
        &self,
        interface: &str,
        permission: Permission,
    ) -> NetResult<()>;

    fn modify_physical_network_permission(
        &self,
        net_id: NetId,
        interface: &str,
        old_permission: Permission,
        new_permission: Permission,
    ) -> NetResult<()>;

    /// Low-priority rules letting VPN-excluded traffic exit via a physical
    /// interface of the default network.
    fn add_virtual_network_fallthrough(
        &self,
        vpn_net_id: NetId,
        physical_interface: &str,
        permission: Permission,
    ) -> NetResult<()>;
    fn remove_virtual_network_fallthrough(
        &self,
        vpn_net_id: NetId,
        physical_interface: &str,
        permission: Permission,
    ) -> NetResult<()>;

    fn add_users_to_physical_network(
        &self,
        net_id: NetId,
        interface: &str,
        ranges: &UidRanges,
        sub_priority: i32,
    ) -> NetResult<()>;
    fn remove_users_from_physical_network(
        &self,
        net_id: NetId,
        interface: &str,
        ranges: &UidRanges,
        sub_priority: i32,
    ) -> NetResult<()>;

    fn add_users_to_virtual_network(
        &self,
        net_id: NetId,
        interface: &str,
        secure: bool,
        ranges: &UidRanges,
    ) -> NetResult<()>;
    fn remove_users_from_virtual_network(
        &self,
        net_id: NetId,
        interface: &str,
        secure: bool,
        ranges: &UidRanges,
    ) -> NetResult<()>;

    /// Unreachable-network rules have no interface: they blackhole.
    fn add_users_to_unreachable_network(
        &self,
        ranges: &UidRanges,
        sub_priority: i32,
    ) -> NetResult<()>;
    fn remove_users_from_unreachable_network(
        &self,
        ranges: &UidRanges,
        sub_priority: i32,
    ) -> NetResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn add_route(
        &self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table: TableType,
        mtu: i32,
        priority: i32,
    ) -> NetResult<()>;
    fn update_route(
        &self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table: TableType,
        mtu: i32,
    ) -> NetResult<()>;
    fn remove_route(
        &self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table: TableType,
        priority: i32,
    ) -> NetResult<()>;
}

// ── Kernel implementation ─────────────────────────────────────────────

/// ip(8)-backed route controller.
pub struct KernelRouteController;

impl KernelRouteController {
    pub fn new() -> KernelRouteController {
        KernelRouteController
    }

    fn table_for_interface(&self, interface: &str) -> NetResult<u32> {
        let ifindex = self.get_if_index(interface);
        if ifindex == 0 {
            return Err(NetError::NoInterface(interface.to_string()));
        }
        Ok(ROUTE_TABLE_OFFSET_FROM_INDEX + ifindex)
    }

    fn table_number(&self, interface: &str, table: TableType) -> NetResult<u32> {
        match table {
            TableType::LocalNetwork => Ok(ROUTE_TABLE_LOCAL_NETWORK),
            TableType::LegacySystem => Ok(ROUTE_TABLE_LEGACY_SYSTEM),
            TableType::LegacyNetwork => Ok(ROUTE_TABLE_LEGACY_NETWORK),
            TableType::Interface => self.table_for_interface(interface),
        }
    }

    /// Runs one `ip` command for each address family.
    fn ip_both(&self, args: &str) -> NetResult<()> {
        self.ip("-4", args)?;
        self.ip("-6", args)
    }

    fn ip(&self, family: &str, args: &str) -> NetResult<()> {
        let output = Command::new("ip")
            .arg(family)
            .args(args.split_whitespace())
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Command {
                cmd: format!("ip {} {}", family, args),
                stderr: stderr.trim_end().to_string(),
            });
        }
        Ok(())
    }

    fn fwmark_selector(net_id: NetId) -> String {
        format!("fwmark 0x{:x}/0x{:x}", net_id, 0xFFFFu32)
    }

    fn modify_netid_rule(&self, add: bool, priority: u32, net_id: NetId, table: u32) -> NetResult<()> {
        let verb = if add { "add" } else { "del" };
        self.ip_both(&format!(
            "rule {} pref {} {} lookup {}",
            verb,
            priority,
            Self::fwmark_selector(net_id),
            table
        ))
    }

    fn modify_uid_rules(
        &self,
        add: bool,
        priority: u32,
        ranges: &UidRanges,
        action: &str,
    ) -> NetResult<()> {
        let verb = if add { "add" } else { "del" };
        for range in ranges.ranges() {
            self.ip_both(&format!(
                "rule {} pref {} uidrange {}-{} {}",
                verb, priority, range.start, range.stop, action
            ))?;
        }
        Ok(())
    }
}

impl Default for KernelRouteController {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteController for KernelRouteController {
    fn initialize(&self, local_net_id: NetId) -> NetResult<()> {
        // The local network's selector rule is permanent; everything else
        // comes and goes with network lifecycle events.
        self.modify_netid_rule(
            true,
            RULE_PRIORITY_LOCAL_NETWORK,
            local_net_id,
            ROUTE_TABLE_LOCAL_NETWORK,
        )?;
        tracing::info!(local_net_id, "route controller initialized");
        Ok(())
    }

    fn get_if_index(&self, interface: &str) -> u32 {
        nix::net::if_::if_nametoindex(interface).unwrap_or(0)
    }

    fn add_interface_to_physical_network(
        &self,
        net_id: NetId,
        interface: &str,
        _permission: Permission,
        _local: bool,
    ) -> NetResult<()> {
        let table = self.table_for_interface(interface)?;
        self.modify_netid_rule(true, RULE_PRIORITY_EXPLICIT_NETWORK, net_id, table)
    }

    fn remove_interface_from_physical_network(
        &self,
        net_id: NetId,
        interface: &str,
        _permission: Permission,
        _local: bool,
    ) -> NetResult<()> {
        let table = self.table_for_interface(interface)?;
        self.modify_netid_rule(false, RULE_PRIORITY_EXPLICIT_NETWORK, net_id, table)?;
        // Flush the interface table so stale routes cannot leak into the
        // next network this interface joins.
        self.ip_both(&format!("route flush table {}", table))
    }

    fn add_interface_to_virtual_network(
        &self,
        net_id: NetId,
        interface: &str,
        _secure: bool,
        _exclude_local_routes: bool,
    ) -> NetResult<()> {
        let table = self.table_for_interface(interface)?;
        self.modify_netid_rule(true, RULE_PRIORITY_EXPLICIT_NETWORK, net_id, table)
    }

    fn remove_interface_from_virtual_network(
        &self,
        net_id: NetId,
        interface: &str,
        _secure: bool,
        _exclude_local_routes: bool,
    ) -> NetResult<()> {
        let table = self.table_for_interface(interface)?;
        self.modify_netid_rule(false, RULE_PRIORITY_EXPLICIT_NETWORK, net_id, table)?;
        self.ip_both(&format!("route flush table {}", table))
    }

    fn add_interface_to_local_network(&self, net_id: NetId, interface: &str) -> NetResult<()> {
        let _ = net_id;
        let _ = self.table_for_interface(interface)?;
        Ok(())
    }

    fn remove_interface_from_local_network(&self, _net_id: NetId, _interface: &str) -> NetResult<()> {
        Ok(())
    }

    fn add_interface_to_default_network(
        &self,
        interface: &str,
        _permission: Permission,
    ) -> NetResult<()> {
        let table = self.table_for_interface(interface)?;
        // Unmarked traffic looks up the default interface's table.
        self.ip_both(&format!(
            "rule add pref {} fwmark 0x0/0x{:x} lookup {}",
            RULE_PRIORITY_DEFAULT_NETWORK, 0xFFFFu32, table
        ))
    }

    fn remove_interface_from_default_network(
        &self,
        interface: &str,
        _permission: Permission,
    ) -> NetResult<()> {
        let table = self.table_for_interface(interface)?;
        self.ip_both(&format!(
            "rule del pref {} fwmark 0x0/0x{:x} lookup {}",
            RULE_PRIORITY_DEFAULT_NETWORK, 0xFFFFu32, table
        ))
    }

    fn modify_physical_network_permission(
        &self,
        net_id: NetId,
        interface: &str,
        old_permission: Permission,
        new_permission: Permission,
    ) -> NetResult<()> {
        // Permission enforcement lives in the registry and in the mark's
        // permission bits; the selector rules are permission-agnostic.
        tracing::debug!(
            net_id,
            interface,
            old = %old_permission,
            new = %new_permission,
            "physical network permission changed"
        );
        Ok(())
    }

    fn add_virtual_network_fallthrough(
        &self,
        vpn_net_id: NetId,
        physical_interface: &str,
        _permission: Permission,
    ) -> NetResult<()> {
        let table = self.table_for_interface(physical_interface)?;
        self.modify_netid_rule(true, RULE_PRIORITY_VPN_FALLTHROUGH, vpn_net_id, table)
    }

    fn remove_virtual_network_fallthrough(
        &self,
        vpn_net_id: NetId,
        physical_interface: &str,
        _permission: Permission,
    ) -> NetResult<()> {
        let table = self.table_for_interface(physical_interface)?;
        self.modify_netid_rule(false, RULE_PRIORITY_VPN_FALLTHROUGH, vpn_net_id, table)
    }

    fn add_users_to_physical_network(
        &self,
        _net_id: NetId,
        interface: &str,
        ranges: &UidRanges,
        sub_priority: i32,
    ) -> NetResult<()> {
        let table = self.table_for_interface(interface)?;
        let priority = RULE_PRIORITY_UID_DEFAULT_NETWORK + sub_priority as u32;
        self.modify_uid_rules(true, priority, ranges, &format!("lookup {}", table))
    }

    fn remove_users_from_physical_network(
        &self,
        _net_id: NetId,
        interface: &str,
        ranges: &UidRanges,
        sub_priority: i32,
    ) -> NetResult<()> {
        let table = self.table_for_interface(interface)?;
        let priority = RULE_PRIORITY_UID_DEFAULT_NETWORK + sub_priority as u32;
        self.modify_uid_rules(false, priority, ranges, &format!("lookup {}", table))
    }

    fn add_users_to_virtual_network(
        &self,
        net_id: NetId,
        interface: &str,
        secure: bool,
        ranges: &UidRanges,
    ) -> NetResult<()> {
        let table = self.table_for_interface(interface)?;
        let priority = if secure {
            RULE_PRIORITY_SECURE_VPN
        } else {
            RULE_PRIORITY_UID_DEFAULT_NETWORK
        };
        let _ = net_id;
        self.modify_uid_rules(true, priority, ranges, &format!("lookup {}", table))
    }

    fn remove_users_from_virtual_network(
        &self,
        net_id: NetId,
        interface: &str,
        secure: bool,
        ranges: &UidRanges,
    ) -> NetResult<()> {
        let table = self.table_for_interface(interface)?;
        let priority = if secure {
            RULE_PRIORITY_SECURE_VPN
        } else {
            RULE_PRIORITY_UID_DEFAULT_NETWORK
        };
        let _ = net_id;
        self.modify_uid_rules(false, priority, ranges, &format!("lookup {}", table))
    }

    fn add_users_to_unreachable_network(
        &self,
        ranges: &UidRanges,
        sub_priority: i32,
    ) -> NetResult<()> {
        let priority = RULE_PRIORITY_UID_DEFAULT_UNREACHABLE + sub_priority as u32;
        self.modify_uid_rules(true, priority, ranges, "unreachable")
    }

    fn remove_users_from_unreachable_network(
        &self,
        ranges: &UidRanges,
        sub_priority: i32,
    ) -> NetResult<()> {
        let priority = RULE_PRIORITY_UID_DEFAULT_UNREACHABLE + sub_priority as u32;
        self.modify_uid_rules(false, priority, ranges, "unreachable")
    }

    fn add_route(
        &self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table: TableType,
        mtu: i32,
        priority: i32,
    ) -> NetResult<()> {
        let table = self.table_number(interface, table)?;
        let mut args = format!("route add {} dev {} table {}", destination, interface, table);
        if let Some(nexthop) = nexthop {
            args.push_str(&format!(" via {}", nexthop));
        }
        if mtu > 0 {
            args.push_str(&format!(" mtu {}", mtu));
        }
        if priority > 0 {
            args.push_str(&format!(" metric {}", priority));
        }
        self.ip(family_of(destination), &args)
    }

    fn update_route(
        &self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table: TableType,
        mtu: i32,
    ) -> NetResult<()> {
        let table = self.table_number(interface, table)?;
        let mut args = format!(
            "route replace {} dev {} table {}",
            destination, interface, table
        );
        if let Some(nexthop) = nexthop {
            args.push_str(&format!(" via {}", nexthop));
        }
        if mtu > 0 {
            args.push_str(&format!(" mtu {}", mtu));
        }
        self.ip(family_of(destination), &args)
    }

    fn remove_route(
        &self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table: TableType,
        priority: i32,
    ) -> NetResult<()> {
        let table = self.table_number(interface, table)?;
        let mut args = format!("route del {} dev {} table {}", destination, interface, table);
        if let Some(nexthop) = nexthop {
            args.push_str(&format!(" via {}", nexthop));
        }
        if priority > 0 {
            args.push_str(&format!(" metric {}", priority));
        }
        self.ip(family_of(destination), &args)
    }
}

fn family_of(destination: &str) -> &'static str {
    if destination.contains(':') {
        "-6"
    } else {
        "-4"
    }
}

// ── Traffic control ───────────────────────────────────────────────────

/// tc(8)-backed qdisc cleanup, used once at registry construction to clear
/// stale clsact classifiers left behind by a previous daemon instance.
pub struct KernelTrafficControl;

impl crate::net::controller::TrafficController for KernelTrafficControl {
    fn qdisc_del_dev_clsact(&self, interface: &str) -> NetResult<()> {
        let output = Command::new("tc")
            .args(["qdisc", "del", "dev", interface, "clsact"])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Command {
                cmd: format!("tc qdisc del dev {} clsact", interface),
                stderr: stderr.trim_end().to_string(),
            });
        }
        Ok(())
    }
}
