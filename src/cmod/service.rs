/// Service module: a control FIFO in the compartment's run directory.
///
/// The compartment's init writes single-line commands into the FIFO;
/// `reboot` and `shutdown` are translated into lifecycle requests. The
/// daemon keeps the FIFO open read-write so the absence of a writer never
/// produces EOF wakeups.
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::event::{IoHandle, IoInterest};
use crate::lifecycle;
use crate::lifecycle::module::{CModule, HookOutcome, Phase};
use crate::types::{Error, Result};
use log::{debug, info, warn};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::rc::Rc;

struct ServiceState {
    fifo: PathBuf,
    _fd: OwnedFd,
    io: IoHandle,
}

pub struct ServiceModule;

fn fifo_path(ctx: &Context, c: &Compartment) -> PathBuf {
    ctx.cfg.run_dir.join(c.uuid().to_string()).join("service")
}

fn open_rdwr_nonblock(path: &PathBuf) -> Result<OwnedFd> {
    use nix::fcntl::{open, OFlag};
    let fd = open(
        path,
        OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| Error::kernel("open fifo", e))?;
    // SAFETY: fd is a freshly opened, owned descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn handle_line(ctx: &Rc<Context>, c: &Rc<Compartment>, line: &str) {
    match line.trim() {
        "" => {}
        "reboot" => {
            info!("compartment {}: reboot requested from inside", c.name());
            if let Err(e) = lifecycle::reboot(ctx, c, None) {
                warn!("compartment {}: reboot request rejected: {}", c.name(), e);
            }
        }
        "shutdown" => {
            info!("compartment {}: shutdown requested from inside", c.name());
            if let Err(e) = lifecycle::stop(ctx, c, None) {
                warn!("compartment {}: shutdown request rejected: {}", c.name(), e);
            }
        }
        other => debug!(
            "compartment {}: ignoring service command '{}'",
            c.name(),
            other
        ),
    }
}

impl CModule for ServiceModule {
    fn name(&self) -> &'static str {
        "service"
    }

    fn hook(
        &self,
        phase: Phase,
        ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        slot: usize,
    ) -> Result<HookOutcome> {
        if phase != Phase::SetupEarly {
            return Ok(HookOutcome::Done);
        }
        let fifo = fifo_path(ctx, c);
        std::fs::create_dir_all(fifo.parent().unwrap_or(&ctx.cfg.run_dir))?;
        if fifo.exists() {
            std::fs::remove_file(&fifo)?;
        }
        mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| Error::kernel("mkfifo", e))?;
        let fd = open_rdwr_nonblock(&fifo)?;

        let weak = Rc::downgrade(ctx);
        let uuid = c.uuid();
        let io = ctx.ev.add_io(
            fd.as_raw_fd(),
            IoInterest::Read,
            Box::new(move |_, raw, readiness| {
                if !readiness.readable {
                    return;
                }
                let Some(ctx) = weak.upgrade() else { return };
                let Some(c) = ctx.by_uuid(uuid) else { return };
                let mut buf = [0u8; 256];
                // SAFETY: valid fd registered on the loop.
                let n = unsafe { libc::read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n <= 0 {
                    return;
                }
                let text = String::from_utf8_lossy(&buf[..n as usize]).to_string();
                for line in text.lines() {
                    handle_line(&ctx, &c, line);
                }
            }),
        );

        c.set_slot(
            slot,
            ServiceState {
                fifo,
                _fd: fd,
                io,
            },
        );
        Ok(HookOutcome::Done)
    }

    fn cleanup(&self, ctx: &Rc<Context>, c: &Rc<Compartment>, slot: usize) {
        if let Some(state) = c.take_slot::<ServiceState>(slot) {
            ctx.ev.remove_io(state.io);
            if let Err(e) = std::fs::remove_file(&state.fifo) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("fifo removal failed: {}", e);
                }
            }
        }
    }
}
