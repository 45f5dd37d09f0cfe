/// The lifecycle engine.
///
/// Drives a compartment through phased start and stop by invoking each
/// registered module's hook in registry order. Any forward-hook failure
/// aborts the attempt and unwinds: `cleanup` runs for every module that
/// executed a forward hook, in reverse registration order. Hook failures
/// never abort the daemon.
///
/// Asynchronous hooks return `Pending(fd)`; the engine parks the
/// compartment on that fd with the credential wall-clock timeout and
/// re-invokes the hook when it fires. A stop arriving mid-start is deferred
/// to the next phase boundary.
pub mod module;
pub mod spawn;

use crate::compartment::{Compartment, LifecycleEvent};
use crate::daemon::Context;
use crate::event::{IoHandle, IoInterest, TimerHandle};
use crate::types::{CompartmentState, Error, Result};
use log::{debug, error, info, warn};
use module::{HookOutcome, Phase};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use spawn::SpawnedChild;
use std::collections::BTreeSet;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;
use uuid::Uuid;

/// Completion callback for a start/stop/reboot request.
pub type Waiter = Box<dyn FnOnce(&Rc<Context>, Result<()>)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartStage {
    /// Phases before the child exists.
    PreFork,
    /// Parent-side phases while the child is blocked on the go-pipe.
    PostFork,
    /// Parent-side phases after the child was released.
    PostExec,
    /// Waiting for the child's readiness byte.
    AwaitReady,
    /// Final hooks after readiness.
    Complete,
}

fn stage_phases(stage: StartStage) -> &'static [Phase] {
    match stage {
        StartStage::PreFork => &[
            Phase::Precheck,
            Phase::StopClean,
            Phase::SetupEarly,
            Phase::ClonePrep,
        ],
        StartStage::PostFork => &[Phase::PostClone, Phase::StartPreExec],
        StartStage::PostExec => &[Phase::StartPostExec, Phase::StartChildEarly],
        StartStage::AwaitReady => &[],
        StartStage::Complete => &[Phase::StartComplete],
    }
}

/// Book-keeping for one start attempt.
pub struct StartAttempt {
    stage: StartStage,
    phase_idx: usize,
    module_idx: usize,
    /// Modules that ran at least one forward hook this attempt; unwound in
    /// reverse registration order on failure.
    executed: BTreeSet<usize>,
    waiters: Vec<Waiter>,
    /// Waiters of a stop request deferred until the current phase ends.
    stop_waiters: Vec<Waiter>,
    child: Option<SpawnedChild>,
    pending_io: Option<IoHandle>,
    pending_timer: Option<TimerHandle>,
    ready_io: Option<IoHandle>,
}

/// Book-keeping for one stop/reboot operation.
pub struct StopOp {
    waiters: Vec<Waiter>,
    reboot: bool,
}

/// Begin a start. Completion (or failure) is reported through `waiter`
/// once the compartment reaches `Running` (or is torn back down).
pub fn start(
    ctx: &Rc<Context>,
    c: &Rc<Compartment>,
    setup: bool,
    waiter: Option<Waiter>,
) -> Result<()> {
    c.apply(if setup {
        LifecycleEvent::StartSetup
    } else {
        LifecycleEvent::Start
    })?;
    c.set_setup_mode(setup);
    c.set_deferred_stop(false);
    begin_attempt(ctx, c, waiter.into_iter().collect());
    Ok(())
}

/// Create the attempt record and run it; the compartment must already be
/// in `Starting`.
fn begin_attempt(ctx: &Rc<Context>, c: &Rc<Compartment>, waiters: Vec<Waiter>) {
    let attempt = StartAttempt {
        stage: StartStage::PreFork,
        phase_idx: 0,
        module_idx: 0,
        executed: BTreeSet::new(),
        waiters,
        stop_waiters: Vec::new(),
        child: None,
        pending_io: None,
        pending_timer: None,
        ready_io: None,
    };
    ctx.attempts.borrow_mut().insert(c.uuid(), attempt);
    advance(ctx, c);
}

/// Drive the attempt forward until it suspends, fails or completes.
fn advance(ctx: &Rc<Context>, c: &Rc<Compartment>) {
    let uuid = c.uuid();
    let Some(mut attempt) = ctx.attempts.borrow_mut().remove(&uuid) else {
        return;
    };

    loop {
        let phases = stage_phases(attempt.stage);
        while attempt.phase_idx < phases.len() {
            let phase = phases[attempt.phase_idx];
            while attempt.module_idx < ctx.registry.len() {
                let idx = attempt.module_idx;
                let m = ctx.registry.get(idx);
                match m.hook(phase, ctx, c, idx) {
                    Ok(HookOutcome::Done) => {
                        attempt.executed.insert(idx);
                        attempt.module_idx += 1;
                    }
                    Ok(HookOutcome::Pending(fd)) => {
                        attempt.executed.insert(idx);
                        debug!(
                            "compartment {}: module {} suspended {:?} on fd {}",
                            c.name(),
                            m.name(),
                            phase,
                            fd
                        );
                        park(ctx, c, attempt, fd);
                        return;
                    }
                    Err(e) => {
                        error!(
                            "compartment {}: module {} failed in {:?}: {}",
                            c.name(),
                            m.name(),
                            phase,
                            e
                        );
                        fail_start(ctx, c, attempt, e);
                        return;
                    }
                }
            }
            attempt.module_idx = 0;
            attempt.phase_idx += 1;
            if c.deferred_stop() {
                info!(
                    "compartment {}: deferred stop takes effect after {:?}",
                    c.name(),
                    phase
                );
                fail_start(
                    ctx,
                    c,
                    attempt,
                    Error::PreconditionFailed("start aborted by stop request".to_string()),
                );
                return;
            }
        }
        attempt.phase_idx = 0;
        attempt.module_idx = 0;

        match attempt.stage {
            StartStage::PreFork => {
                let spawned = match ctx.spawner.spawn(ctx, c) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("compartment {}: spawn failed: {}", c.name(), e);
                        fail_start(ctx, c, attempt, e);
                        return;
                    }
                };
                let pid = spawned.pid;
                c.set_pid(Some(pid));
                if let Err(e) = ctx.store.write_pidfile(uuid, pid) {
                    warn!("compartment {}: pidfile write failed: {}", c.name(), e);
                }
                attempt.child = Some(spawned);
                if let Err(e) = c.apply(LifecycleEvent::Forked) {
                    fail_start(ctx, c, attempt, e);
                    return;
                }
                let weak = Rc::downgrade(ctx);
                ctx.ev.watch_child(
                    pid,
                    Box::new(move |_, pid, status| {
                        if let Some(ctx) = weak.upgrade() {
                            handle_child_exit(&ctx, uuid, pid, status);
                        }
                    }),
                );
                attempt.stage = StartStage::PostFork;
            }
            StartStage::PostFork => {
                // Release the child from its pre-exec barrier.
                if let Some(child) = attempt.child.as_mut() {
                    child.go_wr.take();
                }
                attempt.stage = StartStage::PostExec;
            }
            StartStage::PostExec => {
                let fd = attempt
                    .child
                    .as_ref()
                    .map(|child| child.ready_rd.as_raw_fd());
                let Some(fd) = fd else {
                    fail_start(
                        ctx,
                        c,
                        attempt,
                        Error::Internal("no child while awaiting readiness".to_string()),
                    );
                    return;
                };
                let weak = Rc::downgrade(ctx);
                attempt.ready_io = Some(ctx.ev.add_io(
                    fd,
                    IoInterest::Read,
                    Box::new(move |_, _, _| {
                        if let Some(ctx) = weak.upgrade() {
                            child_ready(&ctx, uuid);
                        }
                    }),
                ));
                attempt.stage = StartStage::AwaitReady;
                ctx.attempts.borrow_mut().insert(uuid, attempt);
                return;
            }
            StartStage::AwaitReady => {
                // progressed only by child_ready
                ctx.attempts.borrow_mut().insert(uuid, attempt);
                return;
            }
            StartStage::Complete => {
                finish_start(ctx, c, attempt);
                return;
            }
        }
    }
}

/// Park the attempt on `fd` with the credential wall-clock bound.
fn park(ctx: &Rc<Context>, c: &Rc<Compartment>, mut attempt: StartAttempt, fd: i32) {
    let uuid = c.uuid();
    let weak = Rc::downgrade(ctx);
    attempt.pending_io = Some(ctx.ev.add_io(
        fd,
        IoInterest::Read,
        Box::new(move |_, _, _| {
            if let Some(ctx) = weak.upgrade() {
                resume(&ctx, uuid);
            }
        }),
    ));
    let weak = Rc::downgrade(ctx);
    attempt.pending_timer = Some(ctx.ev.add_timer(
        ctx.cred.timeout(),
        None,
        Box::new(move |_, _| {
            if let Some(ctx) = weak.upgrade() {
                pending_timed_out(&ctx, uuid);
            }
        }),
    ));
    ctx.attempts.borrow_mut().insert(uuid, attempt);
}

/// The parked fd fired: re-invoke the suspended hook.
fn resume(ctx: &Rc<Context>, uuid: Uuid) {
    let Some(c) = ctx.by_uuid(uuid) else { return };
    {
        let mut attempts = ctx.attempts.borrow_mut();
        let Some(attempt) = attempts.get_mut(&uuid) else {
            return;
        };
        if let Some(io) = attempt.pending_io.take() {
            ctx.ev.remove_io(io);
        }
        if let Some(timer) = attempt.pending_timer.take() {
            ctx.ev.remove_timer(timer);
        }
    }
    advance(ctx, &c);
}

/// The credential wall-clock bound elapsed while parked.
fn pending_timed_out(ctx: &Rc<Context>, uuid: Uuid) {
    let Some(c) = ctx.by_uuid(uuid) else { return };
    let Some(mut attempt) = ctx.attempts.borrow_mut().remove(&uuid) else {
        return;
    };
    if let Some(io) = attempt.pending_io.take() {
        ctx.ev.remove_io(io);
    }
    attempt.pending_timer = None;
    fail_start(
        ctx,
        &c,
        attempt,
        Error::Credential("credential collaborator timed out".to_string()),
    );
}

/// The child wrote its readiness byte (or closed the pipe).
fn child_ready(ctx: &Rc<Context>, uuid: Uuid) {
    let Some(c) = ctx.by_uuid(uuid) else { return };
    let proceed = {
        let mut attempts = ctx.attempts.borrow_mut();
        let Some(attempt) = attempts.get_mut(&uuid) else {
            return;
        };
        if let Some(io) = attempt.ready_io.take() {
            ctx.ev.remove_io(io);
        }
        let mut buf = [0u8; 1];
        let n = attempt
            .child
            .as_ref()
            .map(|child| {
                // SAFETY: valid pipe fd owned by the attempt.
                unsafe {
                    libc::read(
                        child.ready_rd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        1,
                    )
                }
            })
            .unwrap_or(-1);
        if n > 0 {
            attempt.stage = StartStage::Complete;
            true
        } else {
            // EOF without a readiness byte: the child died before
            // completing its hooks; the exit watcher finishes the failure.
            debug!(
                "compartment {}: readiness pipe closed without byte",
                c.name()
            );
            false
        }
    };
    if proceed {
        advance(ctx, &c);
    }
}

/// Final transition once every phase has run.
fn finish_start(ctx: &Rc<Context>, c: &Rc<Compartment>, mut attempt: StartAttempt) {
    if !c.setup_mode() {
        if let Err(e) = c.apply(LifecycleEvent::Ready) {
            fail_start(ctx, c, attempt, e);
            return;
        }
    }
    info!("compartment {} started", c.name());
    for waiter in attempt.waiters.drain(..) {
        waiter(ctx, Ok(()));
    }
    let stop_waiters: Vec<Waiter> = attempt.stop_waiters.drain(..).collect();
    drop(attempt);
    if c.deferred_stop() {
        c.set_deferred_stop(false);
        for waiter in stop_waiters {
            queue_stop_waiter(ctx, c, waiter);
        }
        if let Err(e) = stop_now(ctx, c) {
            warn!("compartment {}: deferred stop failed: {}", c.name(), e);
        }
    }
}

/// Abort an attempt: kill the child, unwind executed modules in reverse
/// registration order, release resources and report the failure.
fn fail_start(ctx: &Rc<Context>, c: &Rc<Compartment>, mut attempt: StartAttempt, err: Error) {
    let uuid = c.uuid();
    if let Some(io) = attempt.pending_io.take() {
        ctx.ev.remove_io(io);
    }
    if let Some(timer) = attempt.pending_timer.take() {
        ctx.ev.remove_timer(timer);
    }
    if let Some(io) = attempt.ready_io.take() {
        ctx.ev.remove_io(io);
    }

    let mut zombie = false;
    if let Some(child) = attempt.child.take() {
        ctx.ev.unwatch_child(child.pid);
        zombie = !kill_and_reap(child.pid);
    }

    for idx in attempt.executed.iter().rev() {
        let m = ctx.registry.get(*idx);
        debug!("compartment {}: cleanup {}", c.name(), m.name());
        m.cleanup(ctx, c, *idx);
    }
    c.clear_slots();
    c.set_pid(None);
    ctx.store.clear_pidfile(uuid);

    c.set_state(if zombie {
        CompartmentState::Zombie
    } else {
        CompartmentState::Stopped
    });
    c.set_deferred_stop(false);

    for waiter in attempt.waiters.drain(..) {
        waiter(ctx, Err(err.clone()));
    }
    for waiter in attempt.stop_waiters.drain(..) {
        waiter(ctx, Ok(()));
    }
    error!("compartment {} start failed: {}", c.name(), err);
}

/// SIGKILL and synchronously reap. Returns false if the child could not be
/// reaped (zombie path).
fn kill_and_reap(pid: nix::unistd::Pid) -> bool {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => {
            warn!("kill {} failed: {}", pid, e);
            return false;
        }
    }
    // Bounded wait: SIGKILL takes effect promptly unless the task is stuck
    // in the kernel.
    for _ in 0..50 {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(nix::sys::wait::WaitStatus::StillAlive) => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(_) => return true,
            Err(nix::errno::Errno::ECHILD) => return true, // already reaped
            Err(e) => {
                warn!("waitpid {} failed: {}", pid, e);
                return false;
            }
        }
    }
    false
}

/// Request a stop. Depending on the current state this either tears down
/// immediately, defers until the in-flight start/freeze reaches a phase
/// boundary, or fails as an invalid transition.
pub fn stop(ctx: &Rc<Context>, c: &Rc<Compartment>, waiter: Option<Waiter>) -> Result<()> {
    let uuid = c.uuid();
    match c.state() {
        CompartmentState::Stopped | CompartmentState::Zombie => {
            return Err(Error::PreconditionFailed(format!(
                "compartment {} is {}",
                c.name(),
                c.state()
            )));
        }
        CompartmentState::ShuttingDown => {
            if let Some(waiter) = waiter {
                queue_stop_waiter(ctx, c, waiter);
            }
            return Ok(());
        }
        _ => {}
    }

    // A start in flight: defer to the next phase boundary.
    if ctx.attempts.borrow().contains_key(&uuid) {
        c.set_deferred_stop(true);
        if let Some(waiter) = waiter {
            let mut attempts = ctx.attempts.borrow_mut();
            if let Some(attempt) = attempts.get_mut(&uuid) {
                attempt.stop_waiters.push(waiter);
            }
        }
        return Ok(());
    }

    match c.state() {
        CompartmentState::Freezing => {
            // A freeze is completing first; the stop is queued and runs
            // once the compartment reaches Frozen.
            c.set_deferred_stop(true);
            if let Some(waiter) = waiter {
                queue_stop_waiter(ctx, c, waiter);
            }
            Ok(())
        }
        CompartmentState::Frozen => {
            if let Some(waiter) = waiter {
                queue_stop_waiter(ctx, c, waiter);
            }
            if let Err(e) = ctx.freezer.thaw(c) {
                warn!("compartment {}: thaw before stop failed: {}", c.name(), e);
            }
            stop_now(ctx, c)
        }
        _ => {
            if let Some(waiter) = waiter {
                queue_stop_waiter(ctx, c, waiter);
            }
            stop_now(ctx, c)
        }
    }
}

fn queue_stop_waiter(ctx: &Rc<Context>, c: &Rc<Compartment>, waiter: Waiter) {
    ctx.stops
        .borrow_mut()
        .entry(c.uuid())
        .or_insert_with(|| StopOp {
            waiters: Vec::new(),
            reboot: false,
        })
        .waiters
        .push(waiter);
}

/// Transition to ShuttingDown and kill the child; teardown continues when
/// the exit is reaped on the loop.
fn stop_now(ctx: &Rc<Context>, c: &Rc<Compartment>) -> Result<()> {
    c.apply(LifecycleEvent::Stop)?;
    ctx.stops
        .borrow_mut()
        .entry(c.uuid())
        .or_insert_with(|| StopOp {
            waiters: Vec::new(),
            reboot: false,
        });
    match c.pid() {
        Some(pid) => {
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("compartment {}: kill failed: {}", c.name(), e);
                }
            }
            // teardown continues in handle_child_exit
            Ok(())
        }
        None => {
            teardown_finish(ctx, c);
            Ok(())
        }
    }
}

/// Child exit observed by the loop.
pub fn handle_child_exit(
    ctx: &Rc<Context>,
    uuid: Uuid,
    pid: nix::unistd::Pid,
    status: nix::sys::wait::WaitStatus,
) {
    let Some(c) = ctx.by_uuid(uuid) else { return };
    info!(
        "compartment {}: child {} exited ({:?})",
        c.name(),
        pid,
        status
    );
    c.set_pid(None);
    ctx.store.clear_pidfile(uuid);

    // Mid-start exit: the attempt fails and unwinds.
    let attempt = ctx.attempts.borrow_mut().remove(&uuid);
    if let Some(mut attempt) = attempt {
        attempt.child = None; // already reaped by the loop
        fail_start(
            ctx,
            &c,
            attempt,
            Error::Internal("child exited during start".to_string()),
        );
        return;
    }

    match c.state() {
        CompartmentState::ShuttingDown | CompartmentState::Rebooting => {
            teardown_finish(ctx, &c);
        }
        CompartmentState::Stopped | CompartmentState::Zombie => {}
        _ => {
            // Spontaneous exit (init died, or stop initiated from inside).
            if c.apply(LifecycleEvent::Stop).is_ok() {
                teardown_finish(ctx, &c);
            }
        }
    }
}

/// Run stop and cleanup hooks in reverse registration order and finish the
/// transition. For reboots, immediately begin the restart.
fn teardown_finish(ctx: &Rc<Context>, c: &Rc<Compartment>) {
    let uuid = c.uuid();
    for (idx, m) in ctx.registry.iter().collect::<Vec<_>>().into_iter().rev() {
        if let Err(e) = m.stop(ctx, c, idx) {
            warn!("compartment {}: stop hook {} failed: {}", c.name(), m.name(), e);
        }
    }
    for (idx, m) in ctx.registry.iter().collect::<Vec<_>>().into_iter().rev() {
        m.cleanup(ctx, c, idx);
    }
    c.clear_slots();

    let op = ctx.stops.borrow_mut().remove(&uuid);
    let (waiters, reboot) = match op {
        Some(op) => (op.waiters, op.reboot),
        None => (Vec::new(), false),
    };

    if reboot && c.state() == CompartmentState::Rebooting {
        match c.apply(LifecycleEvent::RebootRestart) {
            Ok(_) => {
                info!("compartment {} rebooting", c.name());
                begin_attempt(ctx, c, waiters);
            }
            Err(e) => {
                error!("compartment {}: reboot restart failed: {}", c.name(), e);
                c.set_state(CompartmentState::Stopped);
                for waiter in waiters {
                    waiter(ctx, Err(e.clone()));
                }
            }
        }
        return;
    }

    match c.apply(LifecycleEvent::CleanupDone) {
        Ok(_) => {}
        Err(_) => c.set_state(CompartmentState::Stopped),
    }
    info!("compartment {} stopped", c.name());
    for waiter in waiters {
        waiter(ctx, Ok(()));
    }
}

/// Freeze a running compartment via the cgroup freezer; completion is
/// polled on a loop timer.
pub fn freeze(ctx: &Rc<Context>, c: &Rc<Compartment>, waiter: Option<Waiter>) -> Result<()> {
    c.apply(LifecycleEvent::Freeze)?;
    if let Err(e) = ctx.freezer.freeze(c) {
        c.set_state(CompartmentState::Running);
        return Err(e);
    }
    let uuid = c.uuid();
    let weak = Rc::downgrade(ctx);
    let mut waiter = waiter;
    let mut retries = 40u32;
    ctx.ev.add_timer(
        Duration::from_millis(10),
        Some(Duration::from_millis(25)),
        Box::new(move |ev, handle| {
            let Some(ctx) = weak.upgrade() else {
                ev.remove_timer(handle);
                return;
            };
            let Some(c) = ctx.by_uuid(uuid) else {
                ev.remove_timer(handle);
                return;
            };
            if c.state() != CompartmentState::Freezing {
                ev.remove_timer(handle);
                return;
            }
            match ctx.freezer.is_frozen(&c) {
                Ok(true) => {
                    ev.remove_timer(handle);
                    let _ = c.apply(LifecycleEvent::FreezeComplete);
                    info!("compartment {} frozen", c.name());
                    if let Some(waiter) = waiter.take() {
                        waiter(&ctx, Ok(()));
                    }
                    if c.deferred_stop() {
                        // stop queued during the freeze: thaw and tear down
                        c.set_deferred_stop(false);
                        if let Err(e) = ctx.freezer.thaw(&c) {
                            warn!("compartment {}: thaw failed: {}", c.name(), e);
                        }
                        if let Err(e) = stop_now(&ctx, &c) {
                            warn!("compartment {}: queued stop failed: {}", c.name(), e);
                        }
                    }
                }
                Ok(false) | Err(_) => {
                    retries = retries.saturating_sub(1);
                    if retries == 0 {
                        ev.remove_timer(handle);
                        warn!("compartment {}: freeze did not settle", c.name());
                        let _ = ctx.freezer.thaw(&c);
                        c.set_state(CompartmentState::Running);
                        if let Some(waiter) = waiter.take() {
                            waiter(&ctx, Err(Error::Timeout("freeze".to_string())));
                        }
                    }
                }
            }
        }),
    );
    Ok(())
}

/// Thaw a frozen compartment.
pub fn unfreeze(ctx: &Rc<Context>, c: &Rc<Compartment>, waiter: Option<Waiter>) -> Result<()> {
    if c.state() != CompartmentState::Frozen {
        return Err(Error::PreconditionFailed(format!(
            "compartment {} is {}",
            c.name(),
            c.state()
        )));
    }
    ctx.freezer.thaw(c)?;
    c.apply(LifecycleEvent::Unfreeze)?;
    if let Some(waiter) = waiter {
        waiter(ctx, Ok(()));
    }
    if c.deferred_stop() {
        c.set_deferred_stop(false);
        stop_now(ctx, c)?;
    }
    Ok(())
}

/// Reboot: stop keeping the configuration, then start again. The waiter
/// resolves when the compartment is running again.
pub fn reboot(ctx: &Rc<Context>, c: &Rc<Compartment>, waiter: Option<Waiter>) -> Result<()> {
    c.apply(LifecycleEvent::Reboot)?;
    let mut stops = ctx.stops.borrow_mut();
    let op = stops.entry(c.uuid()).or_insert_with(|| StopOp {
        waiters: Vec::new(),
        reboot: true,
    });
    op.reboot = true;
    if let Some(waiter) = waiter {
        op.waiters.push(waiter);
    }
    drop(stops);
    match c.pid() {
        Some(pid) => {
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("compartment {}: kill failed: {}", c.name(), e);
                }
            }
        }
        None => teardown_finish(ctx, c),
    }
    Ok(())
}

