//! Virtual (VPN) networks.

use crate::net::error::NetResult;
use crate::net::network::NetBase;
use crate::net::routes::RouteController;
use crate::net::NetId;

/// How the VPN was established. Carried for diagnostics; the registry's
/// policy depends only on `secure`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum VpnType {
    Service = 1,
    Platform = 2,
    Legacy = 3,
    Oem = 4,
    OemLegacy = 5,
}

impl VpnType {
    /// Maps the wire value used by the control protocol.
    pub fn from_i32(value: i32) -> Option<VpnType> {
        match value {
            1 => Some(VpnType::Service),
            2 => Some(VpnType::Platform),
            3 => Some(VpnType::Legacy),
            4 => Some(VpnType::Oem),
            5 => Some(VpnType::OemLegacy),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct VirtualNetwork {
    pub(crate) base: NetBase,
    /// Non-bypassable: covered uids cannot select another network unless
    /// they are protectable.
    secure: bool,
    vpn_type: VpnType,
    exclude_local_routes: bool,
}

impl VirtualNetwork {
    pub fn new(
        net_id: NetId,
        secure: bool,
        vpn_type: VpnType,
        exclude_local_routes: bool,
    ) -> VirtualNetwork {
        VirtualNetwork {
            base: NetBase::new(net_id),
            secure,
            vpn_type,
            exclude_local_routes,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn vpn_type(&self) -> VpnType {
        self.vpn_type
    }

    pub fn excludes_local_routes(&self) -> bool {
        self.exclude_local_routes
    }

    pub fn add_interface(&mut self, interface: &str, route: &dyn RouteController) -> NetResult<()> {
        if self.base.has_interface(interface) {
            return Ok(());
        }
        route.add_interface_to_virtual_network(
            self.base.net_id,
            interface,
            self.secure,
            self.exclude_local_routes,
        )?;
        self.base.interfaces.insert(interface.to_string());
        Ok(())
    }

    pub fn remove_interface(
        &mut self,
        interface: &str,
        route: &dyn RouteController,
    ) -> NetResult<()> {
        if !self.base.has_interface(interface) {
            return Ok(());
        }
        route.remove_interface_from_virtual_network(
            self.base.net_id,
            interface,
            self.secure,
            self.exclude_local_routes,
        )?;
        self.base.interfaces.remove(interface);
        Ok(())
    }
}
