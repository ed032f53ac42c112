// Daemon assembly: the controller bundle, its process-wide singleton, and
// the shims binding external collaborator contracts to this process.

pub mod init;

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::filter::executor::IptablesRestore;
use crate::filter::hooks::{
    BandwidthModule, FIREWALL_HOOKS, IDLETIMER_HOOKS, OEM_HOOKS, STRICT_HOOKS, TETHER_HOOKS,
};
use crate::net::controller::{NetworkController, ResolverCtl, TcpSocketMonitor};
use crate::net::error::NetResult;
use crate::net::routes::{KernelRouteController, KernelTrafficControl, RouteController};
use crate::net::{NetId, LOCAL_NET_ID};
use init::{HookInstaller, InitDeps, InitError, RouteInit, XfrmControl};

impl RouteInit for KernelRouteController {
    fn initialize(&self, local_net_id: NetId) -> NetResult<()> {
        RouteController::initialize(self, local_net_id)
    }
}

/// Stand-in for the external TCP-socket monitor process. The registry only
/// needs the polling toggle; the monitor itself lives outside this daemon.
struct SocketMonitorShim;

impl TcpSocketMonitor for SocketMonitorShim {
    fn resume_polling(&self) {
        tracing::debug!("tcp socket monitor polling resumed");
    }

    fn suspend_polling(&self) {
        tracing::debug!("tcp socket monitor polling suspended");
    }
}

/// In-memory view of which networks currently have resolver nameservers
/// configured. The control surface updates it whenever resolver
/// configuration is pushed for a network.
#[derive(Default)]
pub struct ResolverRegistry {
    with_nameservers: RwLock<HashSet<NetId>>,
}

impl ResolverRegistry {
    pub fn set_has_nameservers(&self, net_id: NetId, has: bool) {
        let mut set = self.with_nameservers.write();
        if has {
            set.insert(net_id);
        } else {
            set.remove(&net_id);
        }
    }
}

impl ResolverCtl for ResolverRegistry {
    fn has_nameservers(&self, net_id: NetId) -> bool {
        self.with_nameservers.read().contains(&net_id)
    }
}

/// IPsec transform controller boundary. The controller is external; its
/// startup contract is an initialization handshake only.
struct XfrmShim;

impl XfrmControl for XfrmShim {
    fn initialize(&self) -> NetResult<()> {
        tracing::debug!("transform controller initialized");
        Ok(())
    }
}

/// Everything the daemon owns, assembled once at startup.
pub struct Controllers {
    pub exec: Arc<IptablesRestore>,
    pub route: Arc<KernelRouteController>,
    pub resolver: Arc<ResolverRegistry>,
    pub net_ctrl: NetworkController,
    bandwidth: BandwidthModule,
    xfrm: XfrmShim,
}

impl Controllers {
    pub fn new() -> Controllers {
        let exec = Arc::new(IptablesRestore);
        let route = Arc::new(KernelRouteController::new());
        let resolver = Arc::new(ResolverRegistry::default());
        let interfaces = crate::utils::ifaces::interface_names().unwrap_or_else(|e| {
            tracing::warn!("could not enumerate interfaces: {}", e);
            Vec::new()
        });
        let net_ctrl = NetworkController::new(
            route.clone(),
            Arc::new(SocketMonitorShim),
            resolver.clone(),
            &KernelTrafficControl,
            &interfaces,
        );
        Controllers {
            exec,
            route,
            resolver,
            net_ctrl,
            bandwidth: BandwidthModule,
            xfrm: XfrmShim,
        }
    }

    /// Runs the fixed startup sequence. A failure here must terminate the
    /// process with the error's exit code.
    pub fn init(&self) -> Result<(), InitError> {
        let modules: [&dyn HookInstaller; 6] = [
            &OEM_HOOKS,
            &FIREWALL_HOOKS,
            &TETHER_HOOKS,
            &self.bandwidth,
            &IDLETIMER_HOOKS,
            &STRICT_HOOKS,
        ];
        init::run(&InitDeps {
            exec: &*self.exec,
            modules: &modules,
            bandwidth: &self.bandwidth,
            route: &*self.route,
            xfrm: &self.xfrm,
            local_net_id: LOCAL_NET_ID,
        })
    }
}

impl Default for Controllers {
    fn default() -> Self {
        Self::new()
    }
}

static CONTROLLERS: OnceLock<Arc<Controllers>> = OnceLock::new();

/// Installs the process-wide bundle. First caller wins.
pub fn install_global(controllers: Arc<Controllers>) {
    if CONTROLLERS.set(controllers).is_err() {
        tracing::error!("controller bundle installed twice");
    }
}

pub fn global() -> Option<&'static Arc<Controllers>> {
    CONTROLLERS.get()
}
