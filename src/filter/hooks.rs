//! Boundary shims for the modules that own rules inside the child chains.
//!
//! The chain interiors belong to the modules themselves (bandwidth
//! accounting, firewall, tethering, idle timers, strict-mode detection,
//! OEM extensions); the core only guarantees their chains exist, resets
//! them at startup, and orders their hook installation. Each shim resets
//! its module's chains to a clean baseline.

use std::collections::BTreeMap;

use crate::daemon::init::{BandwidthControl, HookInstaller};
use crate::filter::executor::{Family, IptablesExecutor};
use crate::filter::topology::{
    BANDWIDTH_FORWARD, BANDWIDTH_INPUT, BANDWIDTH_MANGLE_POSTROUTING, BANDWIDTH_OUTPUT,
    BANDWIDTH_RAW_PREROUTING, FIREWALL_FORWARD, FIREWALL_INPUT, FIREWALL_OUTPUT,
    IDLETIMER_MANGLE_POSTROUTING, IDLETIMER_RAW_PREROUTING, OEM_FILTER_FORWARD, OEM_FILTER_INPUT,
    OEM_FILTER_OUTPUT, OEM_MANGLE_POSTROUTING, OEM_NAT_PREROUTING, STRICT_OUTPUT, TETHER_FORWARD,
    TETHER_MANGLE_FORWARD, TETHER_NAT_POSTROUTING, TETHER_RAW_PREROUTING,
};
use crate::net::error::NetResult;

/// A module's owned chains, keyed by address family and table.
pub struct ModuleHooks {
    name: &'static str,
    chains: &'static [(Family, &'static str, &'static str)],
}

impl ModuleHooks {
    pub const fn new(
        name: &'static str,
        chains: &'static [(Family, &'static str, &'static str)],
    ) -> ModuleHooks {
        ModuleHooks { name, chains }
    }
}

impl HookInstaller for ModuleHooks {
    fn name(&self) -> &'static str {
        self.name
    }

    fn install_hooks(&self, exec: &dyn IptablesExecutor) -> NetResult<()> {
        let mut by_target: BTreeMap<(&str, u8), Vec<&str>> = BTreeMap::new();
        let mut families: BTreeMap<u8, Family> = BTreeMap::new();
        for (family, table, chain) in self.chains {
            let key = (*table, family_rank(*family));
            by_target.entry(key).or_default().push(*chain);
            families.insert(family_rank(*family), *family);
        }
        for ((table, family_rank), chains) in by_target {
            let mut command = format!("*{}\n", table);
            for chain in chains {
                command.push_str(&format!(":{} -\n", chain));
            }
            command.push_str("COMMIT\n");
            exec.execute(families[&family_rank], &command)?;
        }
        Ok(())
    }
}

fn family_rank(family: Family) -> u8 {
    match family {
        Family::V4 => 0,
        Family::V6 => 1,
        Family::V4V6 => 2,
    }
}

pub const OEM_HOOKS: ModuleHooks = ModuleHooks::new(
    "oem",
    &[
        (Family::V4V6, "filter", OEM_FILTER_INPUT),
        (Family::V4V6, "filter", OEM_FILTER_FORWARD),
        (Family::V4V6, "filter", OEM_FILTER_OUTPUT),
        (Family::V4V6, "mangle", OEM_MANGLE_POSTROUTING),
        (Family::V4, "nat", OEM_NAT_PREROUTING),
    ],
);

pub const FIREWALL_HOOKS: ModuleHooks = ModuleHooks::new(
    "firewall",
    &[
        (Family::V4V6, "filter", FIREWALL_INPUT),
        (Family::V4V6, "filter", FIREWALL_FORWARD),
        (Family::V4V6, "filter", FIREWALL_OUTPUT),
    ],
);

pub const TETHER_HOOKS: ModuleHooks = ModuleHooks::new(
    "tether",
    &[
        (Family::V4V6, "filter", TETHER_FORWARD),
        (Family::V4V6, "raw", TETHER_RAW_PREROUTING),
        (Family::V4V6, "mangle", TETHER_MANGLE_FORWARD),
        (Family::V4, "nat", TETHER_NAT_POSTROUTING),
    ],
);

pub const IDLETIMER_HOOKS: ModuleHooks = ModuleHooks::new(
    "idletimer",
    &[
        (Family::V4V6, "raw", IDLETIMER_RAW_PREROUTING),
        (Family::V4V6, "mangle", IDLETIMER_MANGLE_POSTROUTING),
    ],
);

pub const STRICT_HOOKS: ModuleHooks =
    ModuleHooks::new("strict", &[(Family::V4V6, "filter", STRICT_OUTPUT)]);

/// Bandwidth accounting owns its hook chains like every other module, but
/// additionally must come up or the whole daemon aborts: without its
/// ruleset, traffic accounting silently stops.
pub struct BandwidthModule;

const BANDWIDTH_CHAINS: &[(Family, &str, &str)] = &[
    (Family::V4V6, "filter", BANDWIDTH_INPUT),
    (Family::V4V6, "filter", BANDWIDTH_FORWARD),
    (Family::V4V6, "filter", BANDWIDTH_OUTPUT),
    (Family::V4V6, "raw", BANDWIDTH_RAW_PREROUTING),
    (Family::V4V6, "mangle", BANDWIDTH_MANGLE_POSTROUTING),
];

const BANDWIDTH_MODULE_HOOKS: ModuleHooks = ModuleHooks::new("bandwidth", BANDWIDTH_CHAINS);

impl HookInstaller for BandwidthModule {
    fn name(&self) -> &'static str {
        "bandwidth"
    }

    fn install_hooks(&self, exec: &dyn IptablesExecutor) -> NetResult<()> {
        BANDWIDTH_MODULE_HOOKS.install_hooks(exec)
    }
}

impl BandwidthControl for BandwidthModule {
    fn enable(&self, exec: &dyn IptablesExecutor) -> NetResult<()> {
        // Terminators double as a liveness probe: if this batch cannot
        // load, accounting is broken and startup must fail.
        exec.execute(
            Family::V4V6,
            &format!(
                "*filter\n-A {input} -j RETURN\n-A {output} -j RETURN\nCOMMIT\n",
                input = BANDWIDTH_INPUT,
                output = BANDWIDTH_OUTPUT,
            ),
        )
    }
}
