/// Time namespace module: the child unshares CLONE_NEWTIME and the parent
/// writes the configured offsets before any process enters the namespace.
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::lifecycle::module::{CModule, ChildPhase, HookOutcome, Phase};
use crate::types::{Error, Result};
use log::debug;
use std::rc::Rc;

const CLONE_NEWTIME: libc::c_int = 0x80;

pub struct TimeModule;

impl CModule for TimeModule {
    fn name(&self) -> &'static str {
        "time"
    }

    fn hook(
        &self,
        phase: Phase,
        _ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        _slot: usize,
    ) -> Result<HookOutcome> {
        if phase != Phase::StartPreExec {
            return Ok(HookOutcome::Done);
        }
        let Some(offset) = c.config().time_offset_secs else {
            return Ok(HookOutcome::Done);
        };
        let pid = c
            .pid()
            .ok_or_else(|| Error::Internal("time offsets without child".to_string()))?;
        // Writable until the first process enters the namespace, which is
        // the child's exec.
        std::fs::write(
            format!("/proc/{}/timens_offsets", pid),
            format!("monotonic {} 0\nboottime {} 0\n", offset, offset),
        )?;
        debug!(
            "compartment {}: time namespace offset {}s",
            c.name(),
            offset
        );
        Ok(HookOutcome::Done)
    }

    fn child_hook(
        &self,
        phase: ChildPhase,
        _ctx: &Context,
        c: &Compartment,
        _slot: usize,
    ) -> Result<()> {
        if phase == ChildPhase::ClonePostInChild && c.config().time_offset_secs.is_some() {
            // SAFETY: plain unshare; CLONE_NEWTIME is not available through
            // clone(2), only unshare.
            let rc = unsafe { libc::unshare(CLONE_NEWTIME) };
            if rc != 0 {
                return Err(Error::kernel_last("unshare CLONE_NEWTIME"));
            }
        }
        Ok(())
    }
}
