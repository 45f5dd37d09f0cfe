//! Lifecycle engine integration tests: phased start/stop with counting
//! probe modules, failure unwind, deferred stop, freeze/stop queuing and
//! credential timeout handling.

use compartmentd::compartment::config::CompartmentConfig;
use compartmentd::compartment::Compartment;
use compartmentd::cred::CredClient;
use compartmentd::daemon::{Context, DaemonConfig, Freezer};
use compartmentd::event::EventLoop;
use compartmentd::lifecycle;
use compartmentd::lifecycle::module::{CModule, HookOutcome, ModuleRegistry, Phase};
use compartmentd::lifecycle::spawn::CommandSpawner;
use compartmentd::store::Store;
use compartmentd::types::{CompartmentState, Error, Result};
use std::cell::RefCell;
use std::collections::HashSet;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::time::{Duration, Instant};
use uuid::Uuid;

type Log = Rc<RefCell<Vec<(String, String, String)>>>;

struct ProbeModule {
    name: &'static str,
    log: Log,
    fail_phase: Option<Phase>,
}

impl CModule for ProbeModule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn hook(
        &self,
        phase: Phase,
        _ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        _slot: usize,
    ) -> Result<HookOutcome> {
        self.log
            .borrow_mut()
            .push((c.name(), self.name.to_string(), format!("{:?}", phase)));
        if self.fail_phase == Some(phase) {
            return Err(Error::Kernel {
                op: "mount".to_string(),
                errno: libc::EIO,
            });
        }
        Ok(HookOutcome::Done)
    }

    fn stop(&self, _ctx: &Rc<Context>, c: &Rc<Compartment>, _slot: usize) -> Result<()> {
        self.log
            .borrow_mut()
            .push((c.name(), self.name.to_string(), "stop".to_string()));
        Ok(())
    }

    fn cleanup(&self, _ctx: &Rc<Context>, c: &Rc<Compartment>, _slot: usize) {
        self.log
            .borrow_mut()
            .push((c.name(), self.name.to_string(), "cleanup".to_string()));
    }
}

/// Suspends start_pre_exec on a pipe that never becomes readable; the
/// engine's credential timeout is the only way out.
struct StuckPendingModule {
    log: Log,
}

struct PipePair {
    _rd: std::os::fd::OwnedFd,
    _wr: std::os::fd::OwnedFd,
}

impl CModule for StuckPendingModule {
    fn name(&self) -> &'static str {
        "stuck"
    }

    fn hook(
        &self,
        phase: Phase,
        _ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        slot: usize,
    ) -> Result<HookOutcome> {
        self.log
            .borrow_mut()
            .push((c.name(), "stuck".to_string(), format!("{:?}", phase)));
        if phase != Phase::StartPreExec {
            return Ok(HookOutcome::Done);
        }
        let (rd, wr) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        // SAFETY: pipe2 just returned these as fresh, valid, uniquely-owned fds.
        let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(rd), OwnedFd::from_raw_fd(wr)) };
        let fd = rd.as_raw_fd();
        c.set_slot(slot, PipePair { _rd: rd, _wr: wr });
        Ok(HookOutcome::Pending(fd))
    }

    fn cleanup(&self, _ctx: &Rc<Context>, c: &Rc<Compartment>, slot: usize) {
        c.take_slot::<PipePair>(slot);
        self.log
            .borrow_mut()
            .push((c.name(), "stuck".to_string(), "cleanup".to_string()));
    }
}

#[derive(Default)]
struct TestFreezer {
    frozen: RefCell<HashSet<Uuid>>,
}

impl Freezer for TestFreezer {
    fn freeze(&self, c: &Compartment) -> Result<()> {
        self.frozen.borrow_mut().insert(c.uuid());
        Ok(())
    }

    fn thaw(&self, c: &Compartment) -> Result<()> {
        self.frozen.borrow_mut().remove(&c.uuid());
        Ok(())
    }

    fn is_frozen(&self, c: &Compartment) -> Result<bool> {
        Ok(self.frozen.borrow().contains(&c.uuid()))
    }
}

struct TestEnv {
    ctx: Rc<Context>,
    log: Log,
    _tmp: tempfile::TempDir,
}

fn probe_registry(log: &Log, fail: Option<(&'static str, Phase)>) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    for name in ["keymat", "volumes", "network"] {
        registry.register(Box::new(ProbeModule {
            name,
            log: log.clone(),
            fail_phase: match fail {
                Some((fail_name, phase)) if fail_name == name => Some(phase),
                _ => None,
            },
        }));
    }
    registry
}

fn env_with(registry: ModuleRegistry) -> TestEnv {
    let tmp = tempfile::tempdir().unwrap();
    let ev = EventLoop::new().unwrap();
    let store = Store::open(tmp.path().join("data")).unwrap();
    let cred = CredClient::new(tmp.path().join("cred.sock"), Duration::from_millis(300));
    let cfg = DaemonConfig {
        data_dir: tmp.path().join("data"),
        run_dir: tmp.path().join("run"),
        socket_dir: tmp.path().join("sock"),
        cred_socket: tmp.path().join("cred.sock"),
        cred_timeout: Duration::from_millis(300),
        sysfs_root: tmp.path().join("sys"),
        dev_root: tmp.path().join("dev"),
        cgroup_root: tmp.path().join("cgroup"),
        force_cgroup_v1: true,
        uid_base: 100_000,
        uid_ranges: 4,
    };
    let ctx = Context::new(
        ev,
        registry,
        store,
        cred,
        Box::new(CommandSpawner::default()),
        Box::new(TestFreezer::default()),
        cfg,
    );
    TestEnv {
        ctx,
        log: Rc::new(RefCell::new(Vec::new())),
        _tmp: tmp,
    }
}

fn env(fail: Option<(&'static str, Phase)>) -> TestEnv {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let registry = probe_registry(&log, fail);
    let mut e = env_with(registry);
    e.log = log;
    e
}

fn drive_until(ctx: &Rc<Context>, cond: impl Fn() -> bool, ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while !cond() && Instant::now() < deadline {
        ctx.ev
            .run_until(Instant::now() + Duration::from_millis(20))
            .unwrap();
    }
}

type Outcome = Rc<RefCell<Option<Result<()>>>>;

fn waiter(outcome: &Outcome) -> lifecycle::Waiter {
    let outcome = outcome.clone();
    Box::new(move |_, res| {
        *outcome.borrow_mut() = Some(res);
    })
}

fn events_of<'a>(
    log: &'a [(String, String, String)],
    compartment: &str,
    event: &str,
) -> Vec<&'a str> {
    log.iter()
        .filter(|(c, _, e)| c == compartment && e == event)
        .map(|(_, m, _)| m.as_str())
        .collect()
}

/// S3: a module failing in start_pre_exec unwinds already-run modules in
/// reverse registration order, reaps the child, ends Stopped and reports
/// the kernel error to the caller.
#[test]
fn failed_start_unwinds_in_reverse_and_reports() {
    let e = env(Some(("volumes", Phase::StartPreExec)));
    let c = e
        .ctx
        .add_compartment(CompartmentConfig::management("c3"))
        .unwrap();

    let outcome: Outcome = Rc::new(RefCell::new(None));
    lifecycle::start(&e.ctx, &c, false, Some(waiter(&outcome))).unwrap();

    // the failure happens synchronously inside the start call
    let result = outcome.borrow_mut().take().expect("start did not resolve");
    assert!(matches!(result, Err(Error::Kernel { .. })), "{:?}", result);
    assert_eq!(c.state(), CompartmentState::Stopped);
    assert_eq!(c.pid(), None);

    let log = e.log.borrow();
    // every module that ran a forward hook is cleaned exactly once, in
    // reverse registration order
    assert_eq!(events_of(&log, "c3", "cleanup"), vec!["network", "volumes", "keymat"]);
    // the phase aborted at volumes: network never saw StartPreExec
    let network_pre_exec = log
        .iter()
        .filter(|(cn, m, ev)| cn == "c3" && m == "network" && ev == "StartPreExec")
        .count();
    assert_eq!(network_pre_exec, 0);
}

/// Invariant 2: a clean start/stop cycle runs each module's cleanup
/// exactly once and leaves no attempt state behind.
#[test]
fn clean_cycle_balances_hooks_and_cleanups() {
    let e = env(None);
    let c = e
        .ctx
        .add_compartment(CompartmentConfig::management("c1"))
        .unwrap();

    let started: Outcome = Rc::new(RefCell::new(None));
    lifecycle::start(&e.ctx, &c, false, Some(waiter(&started))).unwrap();
    drive_until(&e.ctx, || c.state() == CompartmentState::Running, 3000);
    assert_eq!(c.state(), CompartmentState::Running);
    assert!(matches!(*started.borrow(), Some(Ok(()))));
    assert!(c.pid().is_some());

    let stopped: Outcome = Rc::new(RefCell::new(None));
    lifecycle::stop(&e.ctx, &c, Some(waiter(&stopped))).unwrap();
    drive_until(&e.ctx, || c.state() == CompartmentState::Stopped, 3000);
    assert_eq!(c.state(), CompartmentState::Stopped);
    assert!(matches!(*stopped.borrow(), Some(Ok(()))));

    let log = e.log.borrow();
    assert_eq!(events_of(&log, "c1", "cleanup"), vec!["network", "volumes", "keymat"]);
    assert_eq!(events_of(&log, "c1", "stop"), vec!["network", "volumes", "keymat"]);
}

/// S5: two compartments start concurrently; each sees its phases in strict
/// order even though the loop interleaves their callbacks.
#[test]
fn concurrent_starts_keep_per_compartment_order() {
    let e = env(None);
    let c5 = e
        .ctx
        .add_compartment(CompartmentConfig::management("c5"))
        .unwrap();
    let c6 = e
        .ctx
        .add_compartment(CompartmentConfig::management("c6"))
        .unwrap();

    lifecycle::start(&e.ctx, &c5, false, None).unwrap();
    lifecycle::start(&e.ctx, &c6, false, None).unwrap();
    drive_until(
        &e.ctx,
        || c5.state() == CompartmentState::Running && c6.state() == CompartmentState::Running,
        3000,
    );
    assert_eq!(c5.state(), CompartmentState::Running);
    assert_eq!(c6.state(), CompartmentState::Running);

    let expected_phases = [
        "Precheck",
        "StopClean",
        "SetupEarly",
        "ClonePrep",
        "PostClone",
        "StartPreExec",
        "StartPostExec",
        "StartChildEarly",
        "StartComplete",
    ];
    let log = e.log.borrow();
    for name in ["c5", "c6"] {
        let seq: Vec<(&str, &str)> = log
            .iter()
            .filter(|(c, _, ev)| c == name && ev != "stop" && ev != "cleanup")
            .map(|(_, m, ev)| (m.as_str(), ev.as_str()))
            .collect();
        let mut expected = Vec::new();
        for phase in &expected_phases {
            for module in ["keymat", "volumes", "network"] {
                expected.push((module, *phase));
            }
        }
        assert_eq!(seq, expected, "phase order for {}", name);
    }
    drop(log);

    lifecycle::stop(&e.ctx, &c5, None).unwrap();
    lifecycle::stop(&e.ctx, &c6, None).unwrap();
    drive_until(
        &e.ctx,
        || c5.state() == CompartmentState::Stopped && c6.state() == CompartmentState::Stopped,
        3000,
    );
}

/// S4: a stop issued while a freeze is in flight is queued; the freeze
/// completes first, then the engine thaws and tears down.
#[test]
fn stop_during_freeze_is_queued_until_frozen() {
    let e = env(None);
    let c = e
        .ctx
        .add_compartment(CompartmentConfig::management("c4"))
        .unwrap();
    lifecycle::start(&e.ctx, &c, false, None).unwrap();
    drive_until(&e.ctx, || c.state() == CompartmentState::Running, 3000);

    let seen: Rc<RefCell<Vec<CompartmentState>>> = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    c.observe(Rc::new(move |_, _, new| seen2.borrow_mut().push(new)));

    let froze: Outcome = Rc::new(RefCell::new(None));
    let stopped: Outcome = Rc::new(RefCell::new(None));
    lifecycle::freeze(&e.ctx, &c, Some(waiter(&froze))).unwrap();
    assert_eq!(c.state(), CompartmentState::Freezing);
    lifecycle::stop(&e.ctx, &c, Some(waiter(&stopped))).unwrap();
    // still freezing: the stop is queued, not executed
    assert_eq!(c.state(), CompartmentState::Freezing);

    drive_until(&e.ctx, || c.state() == CompartmentState::Stopped, 3000);
    assert!(matches!(*froze.borrow(), Some(Ok(()))));
    assert!(matches!(*stopped.borrow(), Some(Ok(()))));
    assert_eq!(
        *seen.borrow(),
        vec![
            CompartmentState::Freezing,
            CompartmentState::Frozen,
            CompartmentState::ShuttingDown,
            CompartmentState::Stopped,
        ],
        "queued stop must run only after the freeze settled"
    );
}

/// A stop during a pending start is deferred to the phase boundary; the
/// start caller sees a failure, the stop caller success.
#[test]
fn stop_during_start_is_deferred() {
    let e = env(None);
    let c = e
        .ctx
        .add_compartment(CompartmentConfig::management("c8"))
        .unwrap();

    let started: Outcome = Rc::new(RefCell::new(None));
    let stopped: Outcome = Rc::new(RefCell::new(None));
    lifecycle::start(&e.ctx, &c, false, Some(waiter(&started))).unwrap();
    // the start is parked awaiting readiness; stop must defer
    lifecycle::stop(&e.ctx, &c, Some(waiter(&stopped))).unwrap();

    drive_until(&e.ctx, || c.state() == CompartmentState::Stopped, 3000);
    assert_eq!(c.state(), CompartmentState::Stopped);
    assert!(matches!(*stopped.borrow(), Some(Ok(()))));
    assert!(started.borrow().is_some());
}

/// S6: the credential collaborator timing out during start surfaces as a
/// credential failure, unwinds, and leaves the daemon usable.
#[test]
fn credential_timeout_fails_start_and_daemon_survives() {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let mut registry = ModuleRegistry::new();
    registry.register(Box::new(ProbeModule {
        name: "keymat",
        log: log.clone(),
        fail_phase: None,
    }));
    registry.register(Box::new(StuckPendingModule { log: log.clone() }));
    registry.register(Box::new(ProbeModule {
        name: "network",
        log: log.clone(),
        fail_phase: None,
    }));
    let mut e = env_with(registry);
    e.log = log;

    let c7 = e
        .ctx
        .add_compartment(CompartmentConfig::management("c7"))
        .unwrap();
    let outcome: Outcome = Rc::new(RefCell::new(None));
    lifecycle::start(&e.ctx, &c7, false, Some(waiter(&outcome))).unwrap();
    // parked on the stuck fd until the 300 ms credential bound fires
    drive_until(&e.ctx, || outcome.borrow().is_some(), 3000);

    let result = outcome.borrow_mut().take().unwrap();
    assert!(matches!(result, Err(Error::Credential(_))), "{:?}", result);
    assert_eq!(c7.state(), CompartmentState::Stopped);
    {
        let log = e.log.borrow();
        assert_eq!(events_of(&log, "c7", "cleanup"), vec!["network", "stuck", "keymat"]);
    }

    // the daemon remains healthy for further requests
    let c9 = e
        .ctx
        .add_compartment(CompartmentConfig::management("c9"))
        .unwrap();
    let ok: Outcome = Rc::new(RefCell::new(None));
    lifecycle::start(&e.ctx, &c9, false, Some(waiter(&ok))).unwrap();
    // c9's own stuck module parks it too and times out the same way; the
    // point is that the engine keeps answering and nothing is wedged
    drive_until(&e.ctx, || ok.borrow().is_some(), 3000);
    assert!(ok.borrow().is_some());
    assert_eq!(c9.state(), CompartmentState::Stopped);
}

/// Reboot tears down and starts again with the same configuration.
#[test]
fn reboot_cycles_back_to_running() {
    let e = env(None);
    let c = e
        .ctx
        .add_compartment(CompartmentConfig::management("cr"))
        .unwrap();
    lifecycle::start(&e.ctx, &c, false, None).unwrap();
    drive_until(&e.ctx, || c.state() == CompartmentState::Running, 3000);

    let rebooted: Outcome = Rc::new(RefCell::new(None));
    lifecycle::reboot(&e.ctx, &c, Some(waiter(&rebooted))).unwrap();
    drive_until(&e.ctx, || rebooted.borrow().is_some(), 3000);
    assert!(matches!(*rebooted.borrow(), Some(Ok(()))));
    assert_eq!(c.state(), CompartmentState::Running);

    let log = e.log.borrow();
    // two full forward passes: the boot and the reboot
    let prechecks = log
        .iter()
        .filter(|(cn, m, ev)| cn == "cr" && m == "keymat" && ev == "Precheck")
        .count();
    assert_eq!(prechecks, 2);
    drop(log);

    lifecycle::stop(&e.ctx, &c, None).unwrap();
    drive_until(&e.ctx, || c.state() == CompartmentState::Stopped, 3000);
}

/// The volumes module computes the mount plan before the clone so the
/// child's copy of the slot carries it.
#[test]
fn volumes_plan_is_built_pre_fork() {
    use compartmentd::cmod::volumes::{VolumesModule, VolumesState};
    use compartmentd::compartment::config::{VolumeConfig, VolumeKind};

    let mut registry = ModuleRegistry::new();
    registry.register(Box::new(VolumesModule));
    let e = env_with(registry);

    let mut config = CompartmentConfig::management("cv");
    config.volumes = vec![
        VolumeConfig {
            label: "scratch".to_string(),
            image: None,
            mount_point: "tmp".into(),
            fs_type: "tmpfs".to_string(),
            kind: VolumeKind::Tmpfs { size_mb: 16 },
        },
        VolumeConfig {
            label: "shared".to_string(),
            image: None,
            mount_point: "media".into(),
            fs_type: "none".to_string(),
            kind: VolumeKind::Bind {
                source: "/srv/shared".into(),
            },
        },
    ];
    let c = e.ctx.add_compartment(config).unwrap();

    let outcome = e
        .ctx
        .registry
        .get(0)
        .hook(Phase::SetupEarly, &e.ctx, &c, 0)
        .unwrap();
    assert!(matches!(outcome, HookOutcome::Done));

    let state = c.take_slot::<VolumesState>(0).expect("plan in slot");
    assert!(state.rootfs.ends_with("rootfs"));
    assert_eq!(state.plan.len(), 2);
    assert_eq!(state.plan[0].target, std::path::PathBuf::from("tmp"));
    assert_eq!(state.plan[0].fstype.as_deref(), Some("tmpfs"));
    assert_eq!(state.plan[0].data.as_deref(), Some("size=16m"));
    assert_eq!(state.plan[1].source.as_deref(), Some(std::path::Path::new("/srv/shared")));
}

/// Stop on a stopped compartment is an explicit error, not a no-op crash.
#[test]
fn stop_when_stopped_is_a_precondition_error() {
    let e = env(None);
    let c = e
        .ctx
        .add_compartment(CompartmentConfig::management("cz"))
        .unwrap();
    let err = lifecycle::stop(&e.ctx, &c, None).unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
}
