/// Seccomp module: installs a BPF denylist filter in the child, built from
/// the configuration policy. Syscall numbers arrive pre-resolved for the
/// target architecture.
use crate::compartment::config::SeccompPolicy;
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::lifecycle::module::{CModule, ChildPhase};
use crate::types::{Error, Result};
use log::debug;

const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
const PR_SET_SECCOMP: libc::c_int = 22;
const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

const BPF_LD_W_ABS: u16 = 0x20;
const BPF_JMP_JEQ_K: u16 = 0x15;
const BPF_RET_K: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: u32 = 0xc000_00b7;

/// seccomp_data offsets
const OFF_NR: u32 = 0;
const OFF_ARCH: u32 = 4;

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Build the filter program: wrong architecture kills, denied syscalls get
/// the configured action, everything else is allowed.
fn build_filter(policy: &SeccompPolicy) -> Vec<libc::sock_filter> {
    let deny_action = if policy.kill_on_violation {
        SECCOMP_RET_KILL_PROCESS
    } else {
        SECCOMP_RET_ERRNO | libc::EPERM as u32
    };

    let mut prog = vec![
        insn(BPF_LD_W_ABS, 0, 0, OFF_ARCH),
        insn(BPF_JMP_JEQ_K, 1, 0, AUDIT_ARCH),
        insn(BPF_RET_K, 0, 0, SECCOMP_RET_KILL_PROCESS),
        insn(BPF_LD_W_ABS, 0, 0, OFF_NR),
    ];
    for nr in &policy.denied_syscalls {
        // jeq nr ? fall through to deny : skip the deny
        prog.push(insn(BPF_JMP_JEQ_K, 0, 1, *nr));
        prog.push(insn(BPF_RET_K, 0, 0, deny_action));
    }
    prog.push(insn(BPF_RET_K, 0, 0, SECCOMP_RET_ALLOW));
    prog
}

fn install(policy: &SeccompPolicy) -> Result<()> {
    let filter = build_filter(policy);
    let prog = libc::sock_fprog {
        len: filter.len() as u16,
        filter: filter.as_ptr() as *mut libc::sock_filter,
    };
    // SAFETY: prctl with valid arguments; no_new_privs is required before
    // an unprivileged filter install.
    unsafe {
        if libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            return Err(Error::kernel_last("PR_SET_NO_NEW_PRIVS"));
        }
        if libc::prctl(PR_SET_SECCOMP, SECCOMP_MODE_FILTER, &prog) != 0 {
            return Err(Error::kernel_last("PR_SET_SECCOMP"));
        }
    }
    Ok(())
}

pub struct SeccompModule;

impl CModule for SeccompModule {
    fn name(&self) -> &'static str {
        "seccomp"
    }

    fn child_hook(
        &self,
        phase: ChildPhase,
        _ctx: &Context,
        c: &Compartment,
        _slot: usize,
    ) -> Result<()> {
        if phase != ChildPhase::StartPreExecChild {
            return Ok(());
        }
        let policy = c.config().seccomp.clone();
        if policy.denied_syscalls.is_empty() {
            return Ok(());
        }
        install(&policy)?;
        debug!(
            "compartment {}: seccomp filter installed ({} denied syscalls)",
            c.name(),
            policy.denied_syscalls.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_shape_matches_policy() {
        let policy = SeccompPolicy {
            denied_syscalls: vec![165, 166], // mount, umount2 on x86_64
            kill_on_violation: false,
        };
        let prog = build_filter(&policy);
        // 4 header insns + 2 per denied syscall + final allow
        assert_eq!(prog.len(), 4 + 2 * 2 + 1);
        assert_eq!(prog[0].k, OFF_ARCH);
        assert_eq!(prog[3].k, OFF_NR);
        assert_eq!(prog[4].k, 165);
        assert_eq!(prog[5].k, SECCOMP_RET_ERRNO | libc::EPERM as u32);
        assert_eq!(prog.last().unwrap().k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn kill_policy_changes_deny_action() {
        let policy = SeccompPolicy {
            denied_syscalls: vec![101],
            kill_on_violation: true,
        };
        let prog = build_filter(&policy);
        assert_eq!(prog[5].k, SECCOMP_RET_KILL_PROCESS);
    }
}
