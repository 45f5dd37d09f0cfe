/// Cgroup module: hierarchy creation, limits, freezer control and the
/// device allow/deny list. v1 and v2 are supported behind a backend trait;
/// detection prefers v2 with a v1 fallback and an explicit override.
pub mod v1;
pub mod v2;

use crate::compartment::Compartment;
use crate::daemon::{Context, DaemonConfig, Freezer};
use crate::lifecycle::module::{CModule, HookOutcome, Phase};
use crate::types::{Error, Result};
use log::{debug, info, warn};
use nix::unistd::Pid;
use std::path::Path;
use std::rc::Rc;

pub trait CgroupBackend {
    fn backend_name(&self) -> &'static str;
    fn create(&self, c: &Compartment) -> Result<()>;
    fn remove(&self, c: &Compartment) -> Result<()>;
    fn attach(&self, c: &Compartment, pid: Pid) -> Result<()>;
    fn set_memory_limit(&self, c: &Compartment, bytes: u64) -> Result<()>;
    fn set_pid_limit(&self, c: &Compartment, limit: u32) -> Result<()>;
    fn freeze(&self, c: &Compartment) -> Result<()>;
    fn thaw(&self, c: &Compartment) -> Result<()>;
    fn is_frozen(&self, c: &Compartment) -> Result<bool>;
    /// `minor` of None allows the whole major.
    fn device_allow(
        &self,
        c: &Compartment,
        kind: char,
        major: u32,
        minor: Option<u32>,
        access: &str,
    ) -> Result<()>;
    fn device_deny(&self, c: &Compartment, kind: char, major: u32, minor: u32) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    V1,
    V2,
}

/// Detect the mounted hierarchy: v2 preferred, v1 fallback.
pub fn detect(root: &Path) -> Option<BackendKind> {
    if root.join("cgroup.controllers").exists() {
        return Some(BackendKind::V2);
    }
    if root.join("memory").exists() || root.join("devices").exists() {
        return Some(BackendKind::V1);
    }
    None
}

/// Build the backend for the configured cgroup root. Backends are cheap
/// path computers; one is constructed per operation.
pub fn backend(cfg: &DaemonConfig) -> Result<Box<dyn CgroupBackend>> {
    let detected = detect(&cfg.cgroup_root);
    if cfg.force_cgroup_v1 {
        return Ok(Box::new(v1::CgroupV1::new(&cfg.cgroup_root)));
    }
    match detected {
        Some(BackendKind::V2) => Ok(Box::new(v2::CgroupV2::new(&cfg.cgroup_root))),
        Some(BackendKind::V1) => Ok(Box::new(v1::CgroupV1::new(&cfg.cgroup_root))),
        None => Err(Error::PreconditionFailed(format!(
            "no cgroup hierarchy under {}",
            cfg.cgroup_root.display()
        ))),
    }
}

/// Device-cgroup entry points used by the hotplug coordinator.
pub fn device_allow(
    ctx: &Rc<Context>,
    c: &Compartment,
    kind: char,
    major: u32,
    minor: u32,
    assign: bool,
) -> Result<()> {
    let backend = backend(&ctx.cfg)?;
    let access = if assign { "rwm" } else { "rw" };
    backend.device_allow(c, kind, major, Some(minor), access)?;
    info!(
        "compartment {}: device {} {}:{} allowed ({})",
        c.name(),
        kind,
        major,
        minor,
        if assign { "assign" } else { "shared" }
    );
    Ok(())
}

pub fn device_deny(ctx: &Rc<Context>, c: &Compartment, kind: char, major: u32, minor: u32) -> Result<()> {
    let backend = backend(&ctx.cfg)?;
    backend.device_deny(c, kind, major, minor)?;
    info!(
        "compartment {}: device {} {}:{} denied",
        c.name(),
        kind,
        major,
        minor
    );
    Ok(())
}

/// Freezer implementation handed to the engine.
pub struct CgroupFreezer {
    cfg: DaemonConfig,
}

impl CgroupFreezer {
    pub fn new(cfg: DaemonConfig) -> CgroupFreezer {
        CgroupFreezer { cfg }
    }
}

impl Freezer for CgroupFreezer {
    fn freeze(&self, c: &Compartment) -> Result<()> {
        backend(&self.cfg)?.freeze(c)
    }

    fn thaw(&self, c: &Compartment) -> Result<()> {
        backend(&self.cfg)?.thaw(c)
    }

    fn is_frozen(&self, c: &Compartment) -> Result<bool> {
        backend(&self.cfg)?.is_frozen(c)
    }
}

/// Marker kept in the module slot while the hierarchy exists.
struct CgroupState {
    created: bool,
}

pub struct CgroupModule;

impl CModule for CgroupModule {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn hook(
        &self,
        phase: Phase,
        ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        slot: usize,
    ) -> Result<HookOutcome> {
        match phase {
            Phase::Precheck => {
                // fail the start before any resource is acquired if no
                // hierarchy is usable
                backend(&ctx.cfg)?;
                Ok(HookOutcome::Done)
            }
            Phase::SetupEarly => {
                let backend = backend(&ctx.cfg)?;
                backend.create(c)?;
                c.set_slot(slot, CgroupState { created: true });
                let config = c.config();
                if let Some(mb) = config.ram_limit_mb {
                    backend.set_memory_limit(c, mb * 1024 * 1024)?;
                }
                if let Some(pids) = config.pid_limit {
                    backend.set_pid_limit(c, pids)?;
                }
                debug!(
                    "compartment {}: cgroup hierarchy ready ({})",
                    c.name(),
                    backend.backend_name()
                );
                Ok(HookOutcome::Done)
            }
            Phase::PostClone => {
                let backend = backend(&ctx.cfg)?;
                let pid = c
                    .pid()
                    .ok_or_else(|| Error::Internal("cgroup attach without child".to_string()))?;
                backend.attach(c, pid)?;
                // initial device allowlist
                for rule in &c.config().allowed_devices {
                    backend.device_allow(c, rule.kind, rule.major, rule.minor, &rule.access)?;
                }
                Ok(HookOutcome::Done)
            }
            _ => Ok(HookOutcome::Done),
        }
    }

    fn cleanup(&self, ctx: &Rc<Context>, c: &Rc<Compartment>, slot: usize) {
        let created = c
            .take_slot::<CgroupState>(slot)
            .map(|s| s.created)
            .unwrap_or(false);
        if !created {
            return;
        }
        match backend(&ctx.cfg) {
            Ok(backend) => {
                if let Err(e) = backend.remove(c) {
                    warn!("compartment {}: cgroup removal failed: {}", c.name(), e);
                }
            }
            Err(e) => warn!("compartment {}: no cgroup backend for cleanup: {}", c.name(), e),
        }
    }
}
