//! Child-chain topology under the kernel's built-in packet-filter hooks.
//!
//! Every module owns rules inside its child chains only; this is the one
//! place that touches the top-level chains. A hook is installed either
//! exclusively (flush the parent, recreate everything) or cooperatively
//! (vendor rules coexist in the parent: list what is already linked and
//! only add what is missing, never delete).

use std::collections::BTreeSet;

use crate::filter::connmark::{CONNMARK_MANGLE_INPUT, CONNMARK_MANGLE_OUTPUT};
use crate::filter::executor::{Family, IptablesExecutor};
use crate::net::error::{NetError, NetResult};

// Child chain names. These are kernel-visible: modules and vendor tooling
// reference them by name.
pub const OEM_FILTER_INPUT: &str = "oem_in";
pub const OEM_FILTER_FORWARD: &str = "oem_fwd";
pub const OEM_FILTER_OUTPUT: &str = "oem_out";
pub const OEM_MANGLE_POSTROUTING: &str = "oem_mangle_POSTROUTING";
pub const OEM_NAT_PREROUTING: &str = "oem_nat_pre";

pub const BANDWIDTH_INPUT: &str = "bw_INPUT";
pub const BANDWIDTH_FORWARD: &str = "bw_FORWARD";
pub const BANDWIDTH_OUTPUT: &str = "bw_OUTPUT";
pub const BANDWIDTH_RAW_PREROUTING: &str = "bw_raw_PREROUTING";
pub const BANDWIDTH_MANGLE_POSTROUTING: &str = "bw_mangle_POSTROUTING";

pub const FIREWALL_INPUT: &str = "fw_INPUT";
pub const FIREWALL_FORWARD: &str = "fw_FORWARD";
pub const FIREWALL_OUTPUT: &str = "fw_OUTPUT";

pub const TETHER_FORWARD: &str = "tether_FORWARD";
pub const TETHER_RAW_PREROUTING: &str = "tether_raw_PREROUTING";
pub const TETHER_MANGLE_FORWARD: &str = "tether_mangle_FORWARD";
pub const TETHER_NAT_POSTROUTING: &str = "tether_nat_POSTROUTING";

pub const STRICT_OUTPUT: &str = "st_OUTPUT";

pub const IDLETIMER_RAW_PREROUTING: &str = "idle_raw_PREROUTING";
pub const IDLETIMER_MANGLE_POSTROUTING: &str = "idle_mangle_POSTROUTING";

pub const WAKEUP_MANGLE_INPUT: &str = "wakeup_mangle_INPUT";
pub const ROUTE_MANGLE_INPUT: &str = "route_mangle_INPUT";

// Per-parent child ordering. ORDERING IS LOAD-BEARING and must be
// re-checked with every change: e.g. bandwidth counting must see inbound
// packets before the firewall can drop them.
const FILTER_INPUT: &[&str] = &[OEM_FILTER_INPUT, BANDWIDTH_INPUT, FIREWALL_INPUT];

const FILTER_FORWARD: &[&str] = &[
    OEM_FILTER_FORWARD,
    FIREWALL_FORWARD,
    BANDWIDTH_FORWARD,
    TETHER_FORWARD,
];

const FILTER_OUTPUT: &[&str] = &[
    OEM_FILTER_OUTPUT,
    FIREWALL_OUTPUT,
    STRICT_OUTPUT,
    BANDWIDTH_OUTPUT,
];

const RAW_PREROUTING: &[&str] = &[
    IDLETIMER_RAW_PREROUTING,
    BANDWIDTH_RAW_PREROUTING,
    TETHER_RAW_PREROUTING,
];

const MANGLE_POSTROUTING: &[&str] = &[
    OEM_MANGLE_POSTROUTING,
    BANDWIDTH_MANGLE_POSTROUTING,
    IDLETIMER_MANGLE_POSTROUTING,
];

const MANGLE_INPUT: &[&str] = &[CONNMARK_MANGLE_INPUT, WAKEUP_MANGLE_INPUT, ROUTE_MANGLE_INPUT];

const MANGLE_FORWARD: &[&str] = &[TETHER_MANGLE_FORWARD];

const MANGLE_OUTPUT: &[&str] = &[CONNMARK_MANGLE_OUTPUT];

const NAT_PREROUTING: &[&str] = &[OEM_NAT_PREROUTING];

const NAT_POSTROUTING: &[&str] = &[TETHER_NAT_POSTROUTING];

pub struct ChainTopology<'a> {
    exec: &'a dyn IptablesExecutor,
}

impl<'a> ChainTopology<'a> {
    pub fn new(exec: &'a dyn IptablesExecutor) -> ChainTopology<'a> {
        ChainTopology { exec }
    }

    /// Materializes the whole hierarchy. Idempotent: rerunning against an
    /// already-installed kernel produces the same final state.
    pub fn install_all(&self) -> NetResult<()> {
        self.create_child_chains(Family::V4V6, "filter", "INPUT", FILTER_INPUT, true)?;
        self.create_child_chains(Family::V4V6, "filter", "FORWARD", FILTER_FORWARD, true)?;
        self.create_child_chains(Family::V4V6, "raw", "PREROUTING", RAW_PREROUTING, true)?;
        self.create_child_chains(Family::V4V6, "mangle", "FORWARD", MANGLE_FORWARD, true)?;
        self.create_child_chains(Family::V4V6, "mangle", "INPUT", MANGLE_INPUT, true)?;
        self.create_child_chains(Family::V4V6, "mangle", "OUTPUT", MANGLE_OUTPUT, true)?;
        self.create_child_chains(Family::V4, "nat", "PREROUTING", NAT_PREROUTING, true)?;
        self.create_child_chains(Family::V4, "nat", "POSTROUTING", NAT_POSTROUTING, true)?;

        // Vendor code injects rules directly into filter OUTPUT and mangle
        // POSTROUTING, so those parents are shared, one family at a time.
        self.create_child_chains(Family::V4, "filter", "OUTPUT", FILTER_OUTPUT, false)?;
        self.create_child_chains(Family::V6, "filter", "OUTPUT", FILTER_OUTPUT, false)?;
        self.create_child_chains(Family::V4, "mangle", "POSTROUTING", MANGLE_POSTROUTING, false)?;
        self.create_child_chains(Family::V6, "mangle", "POSTROUTING", MANGLE_POSTROUTING, false)?;
        Ok(())
    }

    fn create_child_chains(
        &self,
        family: Family,
        table: &str,
        parent: &str,
        children: &[&str],
        exclusive: bool,
    ) -> NetResult<()> {
        let mut command = format!("*{}\n", table);

        // Deleting foreign rules is both wrong (our re-added links would
        // move past the vendor rules) and slow (a delete of a missing rule
        // aborts the batch). Cooperative parents are therefore never
        // flushed or deleted from, only extended.
        let existing = if exclusive {
            // ":chain -" only flushes user-defined chains; "-F" covers
            // built-ins. The parent's kind isn't known here, so emit both.
            command.push_str(&format!(":{} -\n", parent));
            command.push_str(&format!("-F {}\n", parent));
            BTreeSet::new()
        } else {
            self.find_existing_child_chains(family, table, parent)?
        };

        for child in children {
            // Always recreate the child chain itself.
            command.push_str(&format!(":{} -\n", child));
            // But only link it if it isn't linked already.
            if !existing.contains(*child) {
                command.push_str(&format!("-A {} -j {}\n", parent, child));
            }
        }
        command.push_str("COMMIT\n");
        self.exec.execute(family, &command)
    }

    fn find_existing_child_chains(
        &self,
        family: Family,
        table: &str,
        parent: &str,
    ) -> NetResult<BTreeSet<String>> {
        if family == Family::V4V6 {
            return Err(NetError::InvalidArgument(
                "chain listing supports one family at a time".to_string(),
            ));
        }
        let command = format!("*{}\n-S {}\nCOMMIT\n", table, parent);
        let output = self.exec.execute_with_output(family, &command)?;

        let mut existing = BTreeSet::new();
        for line in output.lines() {
            if let Some(child) = parse_child_link(line, parent) {
                existing.insert(child);
            }
        }
        Ok(existing)
    }
}

/// Matches exactly `-A <parent> -j <child>`; any trailing text
/// disqualifies the line. This is the only rule shape we install at parent
/// chains, so it is the only one recognized.
fn parse_child_link(line: &str, parent: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "-A" {
        return None;
    }
    if tokens.next()? != parent {
        return None;
    }
    if tokens.next()? != "-j" {
        return None;
    }
    let child = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }
    Some(child.to_string())
}
