//! Batch submission to the kernel's packet-filter restore facility.
//!
//! Commands are newline-delimited restore-format text
//! (`*<table>\n...\nCOMMIT\n`), piped to the restore binary of each
//! requested address family. `--noflush` keeps tables we don't mention
//! intact; a failing line aborts the whole batch.

use std::io::Write as _;
use std::process::{Command, Stdio};

use crate::net::error::{NetError, NetResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
    /// Both families; forbidden for listing, where output must be
    /// attributable to one family.
    V4V6,
}

pub trait IptablesExecutor: Send + Sync {
    fn execute(&self, family: Family, batch: &str) -> NetResult<()>;
    fn execute_with_output(&self, family: Family, batch: &str) -> NetResult<String>;
}

/// Shells out to `iptables-restore` / `ip6tables-restore`.
pub struct IptablesRestore;

const V4_RESTORE: &str = "iptables-restore";
const V6_RESTORE: &str = "ip6tables-restore";

fn binaries(family: Family) -> &'static [&'static str] {
    match family {
        Family::V4 => &[V4_RESTORE],
        Family::V6 => &[V6_RESTORE],
        Family::V4V6 => &[V4_RESTORE, V6_RESTORE],
    }
}

impl IptablesRestore {
    fn run(&self, binary: &str, batch: &str) -> NetResult<String> {
        let mut child = Command::new(binary)
            .arg("--noflush")
            .arg("-w")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(batch.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(binary, "restore batch failed: {}", stderr.trim_end());
            return Err(NetError::Command {
                cmd: binary.to_string(),
                stderr: stderr.trim_end().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl IptablesExecutor for IptablesRestore {
    fn execute(&self, family: Family, batch: &str) -> NetResult<()> {
        for binary in binaries(family) {
            self.run(binary, batch)?;
        }
        Ok(())
    }

    fn execute_with_output(&self, family: Family, batch: &str) -> NetResult<String> {
        let mut combined = String::new();
        for binary in binaries(family) {
            combined.push_str(&self.run(binary, batch)?);
        }
        Ok(combined)
    }
}
