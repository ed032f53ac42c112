//! Connmark hooks: persist the network-selection bits of the fwmark into
//! per-connection storage, so return traffic stays on the chosen network
//! even when the socket's own mark is lost.

use crate::filter::executor::{Family, IptablesExecutor};
use crate::net::error::NetResult;

pub const CONNMARK_MANGLE_INPUT: &str = "connmark_mangle_INPUT";
pub const CONNMARK_MANGLE_OUTPUT: &str = "connmark_mangle_OUTPUT";

/// Must spell [`crate::net::fwmark::FWMARK_CONNMARK_MASK`]; the rules below
/// are a kernel-visible contract and tests hold the two in sync.
const CONNMARK_MASK: &str = "0x000FFFFF";

/// Installs the two mark-preserving rules in mangle INPUT/OUTPUT. Runs
/// once at startup, after the chain topology and every module hook.
pub fn install_connmark_hooks(exec: &dyn IptablesExecutor) -> NetResult<()> {
    // CONNMARK --save-mark computes
    //   ctmark = (ctmark & ~ctmask) ^ (nfmark & nfmask)
    // so masking both sides copies exactly the low 20 bits. The connmark
    // match makes the copy first-write-wins for the connection's lifetime.
    let command = format!(
        "*mangle\n\
         -A {input} -m connmark --mark 0/{mask} \
         -j CONNMARK --save-mark --ctmask {mask} --nfmask {mask}\n\
         -A {output} -m connmark --mark 0/{mask} \
         -j CONNMARK --save-mark --ctmask {mask} --nfmask {mask}\n\
         COMMIT\n",
        input = CONNMARK_MANGLE_INPUT,
        output = CONNMARK_MANGLE_OUTPUT,
        mask = CONNMARK_MASK,
    );
    exec.execute(Family::V4V6, &command)
}
