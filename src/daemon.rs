/// The owning daemon context.
///
/// One record holds every global registry: the event loop, the module
/// registry, known compartments, hotplug mapping tables, the uid range
/// allocator and the persisted store. It is passed through the engine and
/// coordinators explicitly; there are no process-wide mutable singletons.
use crate::cmod::userns::UidAllocator;
use crate::compartment::config::CompartmentConfig;
use crate::compartment::Compartment;
use crate::cred::CredClient;
use crate::event::EventLoop;
use crate::lifecycle::module::ModuleRegistry;
use crate::lifecycle::spawn::Spawner;
use crate::lifecycle::{StartAttempt, StopOp};
use crate::store::Store;
use crate::types::{Error, Result};
use log::info;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use uuid::Uuid;

/// Daemon-wide settings, fixed at initialization.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Persisted compartment state (see `store`).
    pub data_dir: PathBuf,
    /// Runtime scratch: service fifos, pipes.
    pub run_dir: PathBuf,
    /// Directory for the control socket (`cml-<name>`).
    pub socket_dir: PathBuf,
    /// Credential collaborator socket.
    pub cred_socket: PathBuf,
    pub cred_timeout: Duration,
    /// Overridable roots so tests can fake kernel trees.
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    pub cgroup_root: PathBuf,
    pub force_cgroup_v1: bool,
    /// Base and count for contiguous uid range allocation.
    pub uid_base: u32,
    pub uid_ranges: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            data_dir: PathBuf::from("/var/lib/compartmentd"),
            run_dir: PathBuf::from("/run/compartmentd"),
            socket_dir: PathBuf::from("/run/socket"),
            cred_socket: PathBuf::from("/run/compartmentd/cred.sock"),
            cred_timeout: Duration::from_secs(30),
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            force_cgroup_v1: false,
            uid_base: 100_000,
            uid_ranges: 64,
        }
    }
}

/// Freezer control, implemented by the cgroup backend. Behind a trait so
/// the engine's freeze handling stays testable without a cgroup tree.
pub trait Freezer {
    fn freeze(&self, c: &Compartment) -> Result<()>;
    fn thaw(&self, c: &Compartment) -> Result<()>;
    fn is_frozen(&self, c: &Compartment) -> Result<bool>;
}

pub struct Context {
    pub ev: EventLoop,
    pub registry: ModuleRegistry,
    pub store: Store,
    pub cred: CredClient,
    pub spawner: Box<dyn Spawner>,
    pub freezer: Box<dyn Freezer>,
    pub cfg: DaemonConfig,
    pub uids: RefCell<UidAllocator>,
    compartments: RefCell<Vec<Rc<Compartment>>>,
    /// In-flight start attempts keyed by compartment UUID.
    pub(crate) attempts: RefCell<HashMap<Uuid, StartAttempt>>,
    /// In-flight stop/reboot operations.
    pub(crate) stops: RefCell<HashMap<Uuid, StopOp>>,
    /// The management compartment receiving unmatched interfaces.
    default_uuid: Cell<Option<Uuid>>,
    /// Set once at bootstrap; absent in engine-only tests.
    uevent: RefCell<Option<Rc<crate::uevent::UeventSource>>>,
}

impl Context {
    pub fn new(
        ev: EventLoop,
        registry: ModuleRegistry,
        store: Store,
        cred: CredClient,
        spawner: Box<dyn Spawner>,
        freezer: Box<dyn Freezer>,
        cfg: DaemonConfig,
    ) -> Rc<Context> {
        let uids = UidAllocator::new(cfg.uid_base, cfg.uid_ranges);
        Rc::new(Context {
            ev,
            registry,
            store,
            cred,
            spawner,
            freezer,
            cfg,
            uids: RefCell::new(uids),
            compartments: RefCell::new(Vec::new()),
            attempts: RefCell::new(HashMap::new()),
            stops: RefCell::new(HashMap::new()),
            default_uuid: Cell::new(None),
            uevent: RefCell::new(None),
        })
    }

    pub fn set_uevent_source(&self, source: Rc<crate::uevent::UeventSource>) {
        *self.uevent.borrow_mut() = Some(source);
    }

    pub fn uevent_source(&self) -> Option<Rc<crate::uevent::UeventSource>> {
        self.uevent.borrow().clone()
    }

    /// Register a compartment from a validated configuration and persist
    /// the snapshot.
    pub fn add_compartment(&self, config: CompartmentConfig) -> Result<Rc<Compartment>> {
        config.validate()?;
        if self.by_name(&config.name).is_some() {
            return Err(Error::ConfigInvalid(format!(
                "compartment name '{}' already registered",
                config.name
            )));
        }
        let uuid = Uuid::new_v4();
        self.add_compartment_with_uuid(uuid, config)
    }

    /// Restore path: re-register a compartment under its persisted UUID.
    pub fn add_compartment_with_uuid(
        &self,
        uuid: Uuid,
        config: CompartmentConfig,
    ) -> Result<Rc<Compartment>> {
        config.validate()?;
        self.store.save_config(uuid, &config)?;
        let compartment = Compartment::new(uuid, config, self.registry.len());
        info!(
            "registered compartment {} ({})",
            compartment.name(),
            uuid
        );
        self.compartments.borrow_mut().push(compartment.clone());
        Ok(compartment)
    }

    /// Drop a compartment record and its persisted state. Only valid while
    /// stopped.
    pub fn remove_compartment(&self, uuid: Uuid) -> Result<()> {
        let compartment = self
            .by_uuid(uuid)
            .ok_or_else(|| Error::PreconditionFailed(format!("unknown compartment {}", uuid)))?;
        if compartment.state() != crate::types::CompartmentState::Stopped {
            return Err(Error::PreconditionFailed(format!(
                "compartment {} is {}, cannot remove",
                compartment.name(),
                compartment.state()
            )));
        }
        self.compartments.borrow_mut().retain(|c| c.uuid() != uuid);
        self.store.remove(uuid)?;
        info!("removed compartment {}", uuid);
        Ok(())
    }

    pub fn by_uuid(&self, uuid: Uuid) -> Option<Rc<Compartment>> {
        self.compartments
            .borrow()
            .iter()
            .find(|c| c.uuid() == uuid)
            .cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Rc<Compartment>> {
        self.compartments
            .borrow()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn compartments(&self) -> Vec<Rc<Compartment>> {
        self.compartments.borrow().clone()
    }

    pub fn set_default_compartment(&self, uuid: Uuid) {
        self.default_uuid.set(Some(uuid));
    }

    /// The `c0` management compartment, if registered.
    pub fn default_compartment(&self) -> Option<Rc<Compartment>> {
        self.default_uuid.get().and_then(|u| self.by_uuid(u))
    }
}
