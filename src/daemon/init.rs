//! Startup sequencing.
//!
//! The order is fixed: chain topology first, then every module's hooks,
//! then the connmark hooks, then bandwidth enablement and the route and
//! transform controllers. Each step is timed, and any failure is fatal to
//! the process with an exit code identifying the step - a daemon that came
//! up without its ruleset would silently mis-account and mis-route
//! everything, and crashing at boot is what triggers image rollback.

use std::time::Instant;

use crate::filter::connmark;
use crate::filter::executor::IptablesExecutor;
use crate::filter::topology::ChainTopology;
use crate::net::error::{NetError, NetResult};
use crate::net::NetId;

/// A module that owns rules inside its child chains. The core only orders
/// installation; chain interiors are the module's business.
pub trait HookInstaller: Send + Sync {
    fn name(&self) -> &'static str;
    fn install_hooks(&self, exec: &dyn IptablesExecutor) -> NetResult<()>;
}

/// Bandwidth accounting is non-optional; see stage `BandwidthEnable`.
pub trait BandwidthControl: Send + Sync {
    fn enable(&self, exec: &dyn IptablesExecutor) -> NetResult<()>;
}

/// IPsec transform controller boundary.
pub trait XfrmControl: Send + Sync {
    fn initialize(&self) -> NetResult<()>;
}

/// The one route-controller call the sequencer makes. The daemon assembly
/// implements this for the kernel route controller; tests fake it.
pub trait RouteInit: Send + Sync {
    fn initialize(&self, local_net_id: NetId) -> NetResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitStage {
    ChainTopology,
    ModuleHooks,
    ConnmarkHooks,
    BandwidthEnable,
    RouteInit,
    XfrmInit,
}

impl InitStage {
    /// Process exit code identifying the failed step.
    pub fn exit_code(self) -> i32 {
        match self {
            InitStage::BandwidthEnable => 1,
            InitStage::RouteInit => 2,
            InitStage::XfrmInit => 3,
            InitStage::ChainTopology => 4,
            InitStage::ModuleHooks => 5,
            InitStage::ConnmarkHooks => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            InitStage::ChainTopology => "chain topology",
            InitStage::ModuleHooks => "module hooks",
            InitStage::ConnmarkHooks => "connmark hooks",
            InitStage::BandwidthEnable => "bandwidth enable",
            InitStage::RouteInit => "route controller init",
            InitStage::XfrmInit => "transform controller init",
        }
    }
}

impl std::fmt::Display for InitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {source}")]
pub struct InitError {
    pub stage: InitStage,
    #[source]
    pub source: NetError,
}

impl InitError {
    pub fn exit_code(&self) -> i32 {
        self.stage.exit_code()
    }
}

pub struct InitDeps<'a> {
    pub exec: &'a dyn IptablesExecutor,
    /// OEM, firewall, tether, bandwidth, idle-timer, strict - in order.
    pub modules: &'a [&'a dyn HookInstaller],
    pub bandwidth: &'a dyn BandwidthControl,
    pub route: &'a dyn RouteInit,
    pub xfrm: &'a dyn XfrmControl,
    pub local_net_id: NetId,
}

pub fn run(deps: &InitDeps<'_>) -> Result<(), InitError> {
    let started = Instant::now();

    timed(InitStage::ChainTopology, "created child chains", || {
        ChainTopology::new(deps.exec).install_all()
    })?;

    for module in deps.modules {
        timed(InitStage::ModuleHooks, module.name(), || {
            module.install_hooks(deps.exec)
        })?;
    }

    timed(InitStage::ConnmarkHooks, "installed connmark hooks", || {
        connmark::install_connmark_hooks(deps.exec)
    })?;

    timed(InitStage::BandwidthEnable, "enabled bandwidth control", || {
        deps.bandwidth.enable(deps.exec)
    })?;

    timed(InitStage::RouteInit, "initialized route controller", || {
        deps.route.initialize(deps.local_net_id)
    })?;

    timed(InitStage::XfrmInit, "initialized transform controller", || {
        deps.xfrm.initialize()
    })?;

    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "startup sequence done");
    Ok(())
}

fn timed(stage: InitStage, what: &str, f: impl FnOnce() -> NetResult<()>) -> Result<(), InitError> {
    let step = Instant::now();
    f().map_err(|source| InitError { stage, source })?;
    tracing::info!(elapsed_us = step.elapsed().as_micros() as u64, "{}", what);
    Ok(())
}
