//! Physical networks and the fallthrough delegate.
//!
//! A physical network may become the system default. While it is, every
//! interface change and permission change must be mirrored into the VPN
//! fallthrough routes of all current virtual networks; the network reports
//! those events through the narrow [`PhysicalNetworkDelegate`] capability
//! rather than holding a reference back into the registry.

use crate::net::error::{NetError, NetResult};
use crate::net::network::NetBase;
use crate::net::permission::Permission;
use crate::net::routes::RouteController;
use crate::net::NetId;

/// Capability handed to a physical network by the registry. Callbacks run
/// with the registry write lock held and must not re-enter the registry.
pub trait PhysicalNetworkDelegate {
    fn add_fallthrough(&self, physical_interface: &str, permission: Permission) -> NetResult<()>;
    fn remove_fallthrough(&self, physical_interface: &str, permission: Permission) -> NetResult<()>;
}

/// Delegate implementation over a snapshot of the current virtual netIds,
/// collected by the registry before it hands out a mutable borrow of the
/// physical network being changed.
pub(crate) struct FallthroughSnapshot<'a> {
    pub(crate) vpn_net_ids: &'a [NetId],
    pub(crate) route: &'a dyn RouteController,
}

impl PhysicalNetworkDelegate for FallthroughSnapshot<'_> {
    fn add_fallthrough(&self, physical_interface: &str, permission: Permission) -> NetResult<()> {
        for &vpn_net_id in self.vpn_net_ids {
            if let Err(e) =
                self.route
                    .add_virtual_network_fallthrough(vpn_net_id, physical_interface, permission)
            {
                tracing::error!(vpn_net_id, physical_interface,
                    "failed to add fallthrough: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn remove_fallthrough(&self, physical_interface: &str, permission: Permission) -> NetResult<()> {
        for &vpn_net_id in self.vpn_net_ids {
            if let Err(e) = self.route.remove_virtual_network_fallthrough(
                vpn_net_id,
                physical_interface,
                permission,
            ) {
                tracing::error!(vpn_net_id, physical_interface,
                    "failed to remove fallthrough: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct PhysicalNetwork {
    pub(crate) base: NetBase,
    permission: Permission,
    is_default: bool,
    /// Marks device-local physical networks (e.g. mesh side links); they
    /// never become the system default.
    local: bool,
}

impl PhysicalNetwork {
    pub fn new(net_id: NetId, local: bool) -> PhysicalNetwork {
        PhysicalNetwork {
            base: NetBase::new(net_id),
            permission: Permission::NONE,
            is_default: false,
            local,
        }
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn add_interface(
        &mut self,
        interface: &str,
        route: &dyn RouteController,
        delegate: &dyn PhysicalNetworkDelegate,
    ) -> NetResult<()> {
        if self.base.has_interface(interface) {
            return Ok(());
        }
        route.add_interface_to_physical_network(
            self.base.net_id,
            interface,
            self.permission,
            self.local,
        )?;
        if self.is_default {
            route.add_interface_to_default_network(interface, self.permission)?;
            delegate.add_fallthrough(interface, self.permission)?;
        }
        self.base.interfaces.insert(interface.to_string());
        Ok(())
    }

    pub fn remove_interface(
        &mut self,
        interface: &str,
        route: &dyn RouteController,
        delegate: &dyn PhysicalNetworkDelegate,
    ) -> NetResult<()> {
        if !self.base.has_interface(interface) {
            return Ok(());
        }
        if self.is_default {
            delegate.remove_fallthrough(interface, self.permission)?;
            route.remove_interface_from_default_network(interface, self.permission)?;
        }
        route.remove_interface_from_physical_network(
            self.base.net_id,
            interface,
            self.permission,
            self.local,
        )?;
        self.base.interfaces.remove(interface);
        Ok(())
    }

    pub fn set_permission(
        &mut self,
        permission: Permission,
        route: &dyn RouteController,
        delegate: &dyn PhysicalNetworkDelegate,
    ) -> NetResult<()> {
        if permission == self.permission {
            return Ok(());
        }
        for interface in &self.base.interfaces {
            route.modify_physical_network_permission(
                self.base.net_id,
                interface,
                self.permission,
                permission,
            )?;
        }
        if self.is_default {
            // Add-before-remove so fallthrough coverage never lapses.
            for interface in &self.base.interfaces {
                delegate.add_fallthrough(interface, permission)?;
                delegate.remove_fallthrough(interface, self.permission)?;
            }
        }
        self.permission = permission;
        Ok(())
    }

    pub fn add_as_default(
        &mut self,
        route: &dyn RouteController,
        delegate: &dyn PhysicalNetworkDelegate,
    ) -> NetResult<()> {
        if self.local {
            return Err(NetError::InvalidArgument(format!(
                "local physical network {} cannot be the default",
                self.base.net_id
            )));
        }
        if self.is_default {
            return Ok(());
        }
        for interface in &self.base.interfaces {
            route.add_interface_to_default_network(interface, self.permission)?;
            delegate.add_fallthrough(interface, self.permission)?;
        }
        self.is_default = true;
        Ok(())
    }

    pub fn remove_as_default(
        &mut self,
        route: &dyn RouteController,
        delegate: &dyn PhysicalNetworkDelegate,
    ) -> NetResult<()> {
        if !self.is_default {
            return Ok(());
        }
        for interface in &self.base.interfaces {
            delegate.remove_fallthrough(interface, self.permission)?;
            route.remove_interface_from_default_network(interface, self.permission)?;
        }
        self.is_default = false;
        Ok(())
    }
}
