/// Child creation for the lifecycle engine.
///
/// The real spawner clones the child with its namespaces unshared at birth
/// and runs the child-side hooks around the go-pipe synchronization point.
/// The parent keeps the write end of the go-pipe (closing it releases the
/// blocked child) and the read end of the ready-pipe (readable once the
/// child finished its hooks, just before exec).
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::lifecycle::module::ChildPhase;
use crate::types::{Error, Result};
use log::warn;
use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::unistd::Pid;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;

pub struct SpawnedChild {
    pub pid: Pid,
    /// Dropping this releases the child from its pre-exec barrier.
    pub go_wr: Option<OwnedFd>,
    /// Readable when the child has completed its hooks.
    pub ready_rd: OwnedFd,
}

pub trait Spawner {
    fn spawn(&self, ctx: &Rc<Context>, c: &Rc<Compartment>) -> Result<SpawnedChild>;
}

/// Production spawner: clone(2) with fresh namespaces.
pub struct CloneSpawner;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

impl Spawner for CloneSpawner {
    fn spawn(&self, ctx: &Rc<Context>, c: &Rc<Compartment>) -> Result<SpawnedChild> {
        let (go_rd, go_wr) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::kernel("pipe2", e))?;
        let (ready_rd, ready_wr) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::kernel("pipe2", e))?;
        // SAFETY: pipe2 just returned these as fresh, valid, uniquely-owned fds.
        let (go_rd, go_wr, ready_rd, ready_wr) = unsafe {
            (
                OwnedFd::from_raw_fd(go_rd),
                OwnedFd::from_raw_fd(go_wr),
                OwnedFd::from_raw_fd(ready_rd),
                OwnedFd::from_raw_fd(ready_wr),
            )
        };

        let mut flags = CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS;
        let userns = c.config().uid_range_size > 0;
        if userns {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        c.set_has_userns(userns);

        let go_rd_raw = go_rd.as_raw_fd();
        let ready_wr_raw = ready_wr.as_raw_fd();
        let go_wr_raw = go_wr.as_raw_fd();
        let ready_rd_raw = ready_rd.as_raw_fd();

        let ctx_child = ctx.clone();
        let c_child = c.clone();
        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let cb = Box::new(move || -> isize {
            // Parent-side pipe ends are not ours to keep.
            // SAFETY: closing inherited fds the child does not use.
            unsafe {
                libc::close(go_wr_raw);
                libc::close(ready_rd_raw);
            }
            match child_main(&ctx_child, &c_child, go_rd_raw, ready_wr_raw) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!(
                        "compartment {} child setup failed: {}",
                        c_child.name(),
                        e
                    );
                    126
                }
            }
        });

        // SAFETY: single-threaded daemon; the child callback only touches
        // its own copies of the captured state and execs or _exits.
        let pid = unsafe {
            nix::sched::clone(cb, &mut stack, flags, Some(libc::SIGCHLD))
        }
        .map_err(|e| Error::kernel("clone", e))?;

        drop(go_rd);
        drop(ready_wr);

        Ok(SpawnedChild {
            pid,
            go_wr: Some(go_wr),
            ready_rd,
        })
    }
}

/// Runs inside the cloned child. Never returns on success; exec replaces
/// the process image.
fn child_main(ctx: &Rc<Context>, c: &Rc<Compartment>, go_rd: i32, ready_wr: i32) -> Result<()> {
    for (slot, module) in ctx.registry.iter() {
        module.child_hook(ChildPhase::ClonePostInChild, ctx, c, slot)?;
    }

    // Block until the parent finished its side of start_pre_exec.
    let mut buf = [0u8; 1];
    loop {
        // SAFETY: go_rd is a valid inherited pipe fd.
        let n = unsafe { libc::read(go_rd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
        if n >= 0 {
            break;
        }
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::EINTR) {
            return Err(Error::kernel_last("read go pipe"));
        }
    }
    // SAFETY: valid fd, closed exactly once here.
    unsafe { libc::close(go_rd) };

    for (slot, module) in ctx.registry.iter() {
        module.child_hook(ChildPhase::StartPreExecChild, ctx, c, slot)?;
    }

    // Signal readiness; the parent transitions to Running on this byte.
    let byte = 1u8;
    // SAFETY: valid inherited pipe fd.
    unsafe { libc::write(ready_wr, &byte as *const u8 as *const libc::c_void, 1) };

    exec_init(c)
}

fn exec_init(c: &Rc<Compartment>) -> Result<()> {
    let config = c.config();
    let init = if c.setup_mode() {
        config.setup_init.as_ref().unwrap_or(&config.init)
    } else {
        &config.init
    };
    let program = CString::new(init.to_string_lossy().as_bytes())
        .map_err(|_| Error::ConfigInvalid("init path contains NUL".to_string()))?;
    let mut argv = vec![program.clone()];
    for arg in &config.init_args {
        argv.push(
            CString::new(arg.as_str())
                .map_err(|_| Error::ConfigInvalid("init argument contains NUL".to_string()))?,
        );
    }
    let mut envp = Vec::new();
    for kv in &config.init_env {
        envp.push(
            CString::new(kv.as_str())
                .map_err(|_| Error::ConfigInvalid("init environment contains NUL".to_string()))?,
        );
    }
    nix::unistd::execve(&program, &argv, &envp).map_err(|e| Error::kernel("execve", e))?;
    unreachable!()
}

/// Test spawner: runs a plain long-lived process instead of a namespaced
/// init and reports readiness immediately. Keeps engine tests independent
/// of privileges.
pub struct CommandSpawner {
    pub program: String,
}

impl Default for CommandSpawner {
    fn default() -> Self {
        CommandSpawner {
            program: "sleep".to_string(),
        }
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self, _ctx: &Rc<Context>, c: &Rc<Compartment>) -> Result<SpawnedChild> {
        let (go_rd, go_wr) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::kernel("pipe2", e))?;
        let (ready_rd, ready_wr) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::kernel("pipe2", e))?;
        // SAFETY: pipe2 just returned these as fresh, valid, uniquely-owned fds.
        let (go_rd, go_wr, ready_rd, ready_wr) = unsafe {
            (
                OwnedFd::from_raw_fd(go_rd),
                OwnedFd::from_raw_fd(go_wr),
                OwnedFd::from_raw_fd(ready_rd),
                OwnedFd::from_raw_fd(ready_wr),
            )
        };

        let child = std::process::Command::new(&self.program)
            .arg("3600")
            .spawn()
            .map_err(|e| {
                warn!("test spawner failed for {}: {}", c.name(), e);
                Error::from(e)
            })?;

        // The stand-in child has no hooks to run; mark it ready at once.
        let byte = 1u8;
        // SAFETY: valid pipe fd owned by this function.
        unsafe {
            libc::write(
                ready_wr.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        drop(ready_wr);
        // go_rd is unused by the stand-in child.
        drop(go_rd);

        Ok(SpawnedChild {
            pid: Pid::from_raw(child.id() as i32),
            go_wr: Some(go_wr),
            ready_rd,
        })
    }
}
