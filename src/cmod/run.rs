/// Run module: the child's execution environment. Session leadership,
/// hostname, umask; the exec itself is owned by the spawner.
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::lifecycle::module::{CModule, ChildPhase};
use crate::types::{Error, Result};
use nix::unistd::{sethostname, setsid};

pub struct RunModule;

impl CModule for RunModule {
    fn name(&self) -> &'static str {
        "run"
    }

    fn child_hook(
        &self,
        phase: ChildPhase,
        _ctx: &Context,
        c: &Compartment,
        _slot: usize,
    ) -> Result<()> {
        match phase {
            ChildPhase::ClonePostInChild => {
                if let Err(e) = setsid() {
                    // already a session leader is fine
                    if e != nix::errno::Errno::EPERM {
                        return Err(Error::kernel("setsid", e));
                    }
                }
                sethostname(c.name().as_str()).map_err(|e| Error::kernel("sethostname", e))?;
                Ok(())
            }
            ChildPhase::StartPreExecChild => {
                // SAFETY: umask is always safe to set.
                unsafe { libc::umask(0o022) };
                Ok(())
            }
        }
    }
}
