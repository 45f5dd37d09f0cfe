/// Capability bounding-set restriction, applied in the child before exec.
/// The kept set is data-driven from the configuration; everything else is
/// dropped.
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::lifecycle::module::{CModule, ChildPhase};
use crate::types::Result;
use log::debug;

const PR_CAPBSET_DROP: libc::c_int = 24;
/// Upper bound on probe; prctl returns EINVAL past the last valid cap.
const CAP_PROBE_MAX: u32 = 63;

pub struct CapsModule;

fn drop_bounding_except(keep: &[u32]) {
    for cap in 0..=CAP_PROBE_MAX {
        if keep.contains(&cap) {
            continue;
        }
        // SAFETY: PR_CAPBSET_DROP with an out-of-range cap fails with
        // EINVAL, which is the probe terminator.
        let rc = unsafe { libc::prctl(PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if rc != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINVAL) {
            break;
        }
    }
}

impl CModule for CapsModule {
    fn name(&self) -> &'static str {
        "caps"
    }

    fn child_hook(
        &self,
        phase: ChildPhase,
        _ctx: &Context,
        c: &Compartment,
        _slot: usize,
    ) -> Result<()> {
        if phase == ChildPhase::StartPreExecChild {
            let keep = c.config().caps_keep.clone();
            drop_bounding_except(&keep);
            debug!(
                "compartment {}: bounding set reduced to {} capabilities",
                c.name(),
                keep.len()
            );
        }
        Ok(())
    }
}
