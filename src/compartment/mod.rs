/// Compartment record: identity, state machine, per-module state slots and
/// the observer list notified on every transition.
///
/// Compartments are owned by the daemon context and referenced by UUID
/// everywhere else (hotplug mappings, control replies); nothing outside the
/// context holds a strong reference across callbacks except the lifecycle
/// engine while an operation is in flight.
pub mod config;

use crate::types::{CompartmentState, Error, Result};
use config::CompartmentConfig;
use log::{info, warn};
use nix::unistd::Pid;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use uuid::Uuid;

/// Inputs to the state machine. Every (state, event) pair is either a
/// defined transition or an explicit `PreconditionFailed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Operator requested a regular start.
    Start,
    /// Operator requested a provisioning (setup-mode) start.
    StartSetup,
    /// Pre-child phases done, child forked.
    Forked,
    /// Child signaled readiness.
    Ready,
    Freeze,
    FreezeComplete,
    Unfreeze,
    Stop,
    /// Teardown finished and all resources released.
    CleanupDone,
    /// Child could not be reaped during teardown.
    ReapFailed,
    Reboot,
    /// Reboot teardown finished; the restart begins.
    RebootRestart,
}

/// Transition table; `None` marks an invalid pair.
fn next_state(state: CompartmentState, event: LifecycleEvent) -> Option<CompartmentState> {
    use CompartmentState as S;
    use LifecycleEvent as E;
    match (state, event) {
        (S::Stopped, E::Start) => Some(S::Starting),
        (S::Stopped, E::StartSetup) => Some(S::Starting),
        (S::Starting, E::Forked) => Some(S::Booting),
        (S::Booting, E::Ready) => Some(S::Running),
        (S::Running, E::Freeze) => Some(S::Freezing),
        (S::Freezing, E::FreezeComplete) => Some(S::Frozen),
        (S::Frozen, E::Unfreeze) => Some(S::Running),
        (S::Starting, E::Stop)
        | (S::Setup, E::Stop)
        | (S::Booting, E::Stop)
        | (S::Running, E::Stop)
        | (S::Freezing, E::Stop)
        | (S::Frozen, E::Stop)
        | (S::Rebooting, E::Stop) => Some(S::ShuttingDown),
        (S::ShuttingDown, E::CleanupDone) => Some(S::Stopped),
        (S::ShuttingDown, E::ReapFailed) => Some(S::Zombie),
        (S::Running, E::Reboot) => Some(S::Rebooting),
        (S::Rebooting, E::RebootRestart) => Some(S::Starting),
        _ => None,
    }
}

pub type ObserverHandle = u64;
pub type StateObserver = Rc<dyn Fn(&Compartment, CompartmentState, CompartmentState)>;

pub struct Compartment {
    uuid: Uuid,
    name: String,
    config: RefCell<CompartmentConfig>,
    state: Cell<CompartmentState>,
    pid: Cell<Option<Pid>>,
    setup_mode: Cell<bool>,
    /// Stop arrived while a start or freeze was in flight; executed at the
    /// next phase boundary.
    deferred_stop: Cell<bool>,
    /// One opaque slot per registered module, indexed by registry order.
    slots: RefCell<Vec<Option<Box<dyn Any>>>>,
    observers: RefCell<Vec<(ObserverHandle, StateObserver)>>,
    next_observer: Cell<ObserverHandle>,
    notifying: Cell<bool>,
    /// Physical interfaces currently assigned by the hotplug coordinator.
    netifs: RefCell<Vec<String>>,
    /// Child runs in a user namespace (affects uevent injection).
    has_userns: Cell<bool>,
    /// Unwrapped volume key material, deposited by the smartcard module
    /// for the volumes module; dropped on every teardown.
    volume_key: RefCell<Option<Vec<u8>>>,
    /// (start, size) of the allocated uid/gid range, deposited by the
    /// userns module for ownership shifting.
    uid_range: Cell<Option<(u32, u32)>>,
}

impl Compartment {
    pub fn new(uuid: Uuid, config: CompartmentConfig, module_count: usize) -> Rc<Compartment> {
        let mut slots = Vec::with_capacity(module_count);
        slots.resize_with(module_count, || None);
        Rc::new(Compartment {
            uuid,
            name: config.name.clone(),
            config: RefCell::new(config),
            state: Cell::new(CompartmentState::Stopped),
            pid: Cell::new(None),
            setup_mode: Cell::new(false),
            deferred_stop: Cell::new(false),
            slots: RefCell::new(slots),
            observers: RefCell::new(Vec::new()),
            next_observer: Cell::new(1),
            notifying: Cell::new(false),
            netifs: RefCell::new(Vec::new()),
            has_userns: Cell::new(false),
            volume_key: RefCell::new(None),
            uid_range: Cell::new(None),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> String {
        self.name.clone()
    }

    pub fn state(&self) -> CompartmentState {
        self.state.get()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid.get()
    }

    pub fn set_pid(&self, pid: Option<Pid>) {
        self.pid.set(pid);
    }

    pub fn setup_mode(&self) -> bool {
        self.setup_mode.get()
    }

    pub fn set_setup_mode(&self, on: bool) {
        self.setup_mode.set(on);
    }

    pub fn has_userns(&self) -> bool {
        self.has_userns.get()
    }

    pub fn set_has_userns(&self, on: bool) {
        self.has_userns.set(on);
    }

    pub fn deferred_stop(&self) -> bool {
        self.deferred_stop.get()
    }

    pub fn set_deferred_stop(&self, on: bool) {
        self.deferred_stop.set(on);
    }

    /// Immutable after a start has begun; the engine snapshots at
    /// `LifecycleEvent::Start`.
    pub fn config(&self) -> std::cell::Ref<'_, CompartmentConfig> {
        self.config.borrow()
    }

    pub fn replace_config(&self, config: CompartmentConfig) -> Result<()> {
        if self.state.get() != CompartmentState::Stopped {
            return Err(Error::PreconditionFailed(format!(
                "compartment {} is {}, configuration is immutable",
                self.name,
                self.state.get()
            )));
        }
        *self.config.borrow_mut() = config;
        Ok(())
    }

    pub fn netifs(&self) -> Vec<String> {
        self.netifs.borrow().clone()
    }

    pub fn add_netif(&self, ifname: &str) {
        self.netifs.borrow_mut().push(ifname.to_string());
    }

    pub fn remove_netif(&self, ifname: &str) {
        self.netifs.borrow_mut().retain(|n| n != ifname);
    }

    /// Apply a lifecycle event, notifying observers on success. Invalid
    /// pairs are an explicit no-op error, never a panic.
    pub fn apply(self: &Rc<Self>, event: LifecycleEvent) -> Result<CompartmentState> {
        let old = self.state.get();
        let new = next_state(old, event).ok_or_else(|| {
            Error::PreconditionFailed(format!(
                "compartment {}: no transition from {} on {:?}",
                self.name, old, event
            ))
        })?;
        // setup-mode boots land in Setup instead of Booting
        let new = if new == CompartmentState::Booting && self.setup_mode.get() {
            CompartmentState::Setup
        } else {
            new
        };
        self.set_state(new);
        Ok(new)
    }

    /// Force a state without consulting the table; only the engine uses
    /// this, for recovery paths that re-enter Stopped.
    pub(crate) fn set_state(self: &Rc<Self>, new: CompartmentState) {
        let old = self.state.replace(new);
        if old == new {
            return;
        }
        info!("compartment {} ({}): {} -> {}", self.name, self.uuid, old, new);
        if self.notifying.replace(true) {
            // Observer triggered a nested transition; the observer contract
            // forbids this because later observers of the outer transition
            // would see a stale state.
            warn!(
                "compartment {}: nested state transition from an observer",
                self.name
            );
        }
        let snapshot: Vec<StateObserver> = self
            .observers
            .borrow()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in snapshot {
            cb(self, old, new);
        }
        self.notifying.set(false);
    }

    /// Register an observer; it sees every future transition of this
    /// compartment. Observers must not trigger transitions synchronously.
    pub fn observe(&self, cb: StateObserver) -> ObserverHandle {
        let handle = self.next_observer.get();
        self.next_observer.set(handle + 1);
        self.observers.borrow_mut().push((handle, cb));
        handle
    }

    pub fn unobserve(&self, handle: ObserverHandle) {
        self.observers.borrow_mut().retain(|(h, _)| *h != handle);
    }

    /// Store a module's private state in its slot.
    pub fn set_slot<T: Any>(&self, idx: usize, value: T) {
        self.slots.borrow_mut()[idx] = Some(Box::new(value));
    }

    /// Take a module's state out of its slot (cleanup paths consume it).
    pub fn take_slot<T: Any>(&self, idx: usize) -> Option<Box<T>> {
        let boxed = self.slots.borrow_mut()[idx].take()?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(v),
            Err(boxed) => {
                // wrong type requested; put it back rather than lose it
                self.slots.borrow_mut()[idx] = Some(boxed);
                None
            }
        }
    }

    /// Run a closure against the module state in `idx` without moving it.
    pub fn with_slot<T: Any, R>(&self, idx: usize, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slots = self.slots.borrow_mut();
        let boxed = slots.get_mut(idx)?.as_mut()?;
        boxed.downcast_mut::<T>().map(f)
    }

    pub fn clear_slots(&self) {
        for slot in self.slots.borrow_mut().iter_mut() {
            *slot = None;
        }
        self.volume_key.borrow_mut().take();
    }

    pub fn set_volume_key(&self, key: Vec<u8>) {
        *self.volume_key.borrow_mut() = Some(key);
    }

    pub fn volume_key(&self) -> Option<Vec<u8>> {
        self.volume_key.borrow().clone()
    }

    pub fn set_uid_range(&self, range: Option<(u32, u32)>) {
        self.uid_range.set(range);
    }

    pub fn uid_range(&self) -> Option<(u32, u32)> {
        self.uid_range.get()
    }
}

impl std::fmt::Debug for Compartment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compartment")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("pid", &self.pid.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comp(name: &str) -> Rc<Compartment> {
        Compartment::new(Uuid::new_v4(), CompartmentConfig::management(name), 4)
    }

    #[test]
    fn start_cycle_transitions() {
        let c = comp("c1");
        assert_eq!(c.apply(LifecycleEvent::Start).unwrap(), CompartmentState::Starting);
        assert_eq!(c.apply(LifecycleEvent::Forked).unwrap(), CompartmentState::Booting);
        assert_eq!(c.apply(LifecycleEvent::Ready).unwrap(), CompartmentState::Running);
        assert_eq!(c.apply(LifecycleEvent::Stop).unwrap(), CompartmentState::ShuttingDown);
        assert_eq!(c.apply(LifecycleEvent::CleanupDone).unwrap(), CompartmentState::Stopped);
    }

    #[test]
    fn freeze_thaw_cycle() {
        let c = comp("c4");
        c.apply(LifecycleEvent::Start).unwrap();
        c.apply(LifecycleEvent::Forked).unwrap();
        c.apply(LifecycleEvent::Ready).unwrap();
        assert_eq!(c.apply(LifecycleEvent::Freeze).unwrap(), CompartmentState::Freezing);
        assert_eq!(
            c.apply(LifecycleEvent::FreezeComplete).unwrap(),
            CompartmentState::Frozen
        );
        assert_eq!(c.apply(LifecycleEvent::Unfreeze).unwrap(), CompartmentState::Running);
    }

    #[test]
    fn invalid_pairs_are_explicit_errors() {
        let c = comp("c1");
        // every event against Stopped except Start/StartSetup must error
        for event in [
            LifecycleEvent::Forked,
            LifecycleEvent::Ready,
            LifecycleEvent::Freeze,
            LifecycleEvent::FreezeComplete,
            LifecycleEvent::Unfreeze,
            LifecycleEvent::Stop,
            LifecycleEvent::CleanupDone,
            LifecycleEvent::ReapFailed,
            LifecycleEvent::Reboot,
            LifecycleEvent::RebootRestart,
        ] {
            let err = c.apply(event).unwrap_err();
            assert!(matches!(err, Error::PreconditionFailed(_)), "{:?}", event);
            assert_eq!(c.state(), CompartmentState::Stopped);
        }
    }

    #[test]
    fn totality_every_pair_is_defined_or_rejected() {
        use CompartmentState as S;
        use LifecycleEvent as E;
        let states = [
            S::Stopped,
            S::Starting,
            S::Setup,
            S::Booting,
            S::Running,
            S::Freezing,
            S::Frozen,
            S::ShuttingDown,
            S::Zombie,
            S::Rebooting,
        ];
        let events = [
            E::Start,
            E::StartSetup,
            E::Forked,
            E::Ready,
            E::Freeze,
            E::FreezeComplete,
            E::Unfreeze,
            E::Stop,
            E::CleanupDone,
            E::ReapFailed,
            E::Reboot,
            E::RebootRestart,
        ];
        for state in states {
            for event in events {
                // must not panic; either Some(next) or None
                let _ = next_state(state, event);
            }
        }
    }

    #[test]
    fn observers_see_post_transition_state() {
        let c = comp("c1");
        let seen: Rc<RefCell<Vec<(CompartmentState, CompartmentState)>>> =
            Rc::new(RefCell::new(Vec::new()));
        let seen_a = seen.clone();
        c.observe(Rc::new(move |comp, old, new| {
            assert_eq!(comp.state(), new);
            seen_a.borrow_mut().push((old, new));
        }));
        let seen_b = seen.clone();
        c.observe(Rc::new(move |comp, _, new| {
            assert_eq!(comp.state(), new);
            seen_b.borrow_mut().push((new, new));
        }));
        c.apply(LifecycleEvent::Start).unwrap();
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn setup_mode_boots_into_setup() {
        let c = comp("c9");
        c.set_setup_mode(true);
        c.apply(LifecycleEvent::StartSetup).unwrap();
        assert_eq!(c.apply(LifecycleEvent::Forked).unwrap(), CompartmentState::Setup);
        assert_eq!(c.apply(LifecycleEvent::Stop).unwrap(), CompartmentState::ShuttingDown);
    }

    #[test]
    fn slots_roundtrip_typed_state() {
        let c = comp("c1");
        c.set_slot(2, 42u32);
        assert_eq!(c.with_slot::<u32, u32>(2, |v| *v), Some(42));
        let taken = c.take_slot::<u32>(2).unwrap();
        assert_eq!(*taken, 42);
        assert!(c.take_slot::<u32>(2).is_none());
    }
}
