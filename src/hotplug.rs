/// Hotplug coordinator.
///
/// Matches kernel uevents against the USB and net mapping tables and routes
/// newly discovered devices to their owning compartments: device-cgroup
/// allow/deny for USB nodes, debounced token attach, and rename-and-move
/// for physical network interfaces. Mappings reference compartments by
/// UUID only; the live record is looked up through the sink at action time,
/// which makes concurrent removal safe.
///
/// The coordinator never blocks the loop: sysfs reads and kernel writes are
/// bounded, waits are realized as repeating timers with retry counters.
use crate::compartment::config::{PnetConfig, UsbDeviceConfig, UsbKind};
use crate::daemon::Context;
use crate::event::EventLoop;
use crate::net;
use crate::types::{CompartmentState, Error, Result};
use crate::uevent::{Uevent, UeventAction, UeventSource};
use log::{debug, info, trace, warn};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::Duration;
use uuid::Uuid;

/// Everything the coordinator needs from the rest of the daemon. The
/// production implementation forwards to the context; tests record calls.
pub trait HotplugSink {
    fn compartment_state(&self, uuid: Uuid) -> Option<CompartmentState>;
    fn device_allow(&self, uuid: Uuid, kind: char, major: u32, minor: u32, assign: bool)
        -> Result<()>;
    fn device_deny(&self, uuid: Uuid, kind: char, major: u32, minor: u32) -> Result<()>;
    fn token_attach(&self, uuid: Uuid);
    fn token_detach(&self, uuid: Uuid);
    fn rename_ifi(&self, old: &str, new: &str) -> Result<()>;
    fn move_to_compartment(&self, uuid: Uuid, ifname: &str) -> Result<()>;
    fn inject_uevent(&self, uuid: Uuid, event: &Uevent) -> Result<()>;
    fn default_compartment(&self) -> Option<Uuid>;
}

/// A USB mapping enriched with the (major, minor) discovered at add time.
pub struct UsbMapping {
    pub owner: Uuid,
    pub config: UsbDeviceConfig,
    pub major: Cell<i32>,
    pub minor: Cell<i32>,
}

pub struct NetMapping {
    pub owner: Uuid,
    pub mac: [u8; 6],
    pub config: PnetConfig,
}

const DEBOUNCE: Duration = Duration::from_millis(100);
const TOKEN_RETRIES: u32 = 10;
const NETIF_RETRIES: u32 = 50;

struct Inner {
    sink: Box<dyn HotplugSink>,
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    usb: RefCell<Vec<UsbMapping>>,
    net: RefCell<Vec<NetMapping>>,
    /// Per-family monotonic rename counters.
    eth_idx: Cell<u32>,
    wlan_idx: Cell<u32>,
    /// Physical interfaces known to the host namespace.
    phys: RefCell<Vec<String>>,
}

pub struct Hotplug {
    inner: Rc<Inner>,
}

impl Hotplug {
    pub fn new(sink: Box<dyn HotplugSink>, sysfs_root: &Path, dev_root: &Path) -> Hotplug {
        Hotplug {
            inner: Rc::new(Inner {
                sink,
                sysfs_root: sysfs_root.to_path_buf(),
                dev_root: dev_root.to_path_buf(),
                usb: RefCell::new(Vec::new()),
                net: RefCell::new(Vec::new()),
                eth_idx: Cell::new(0),
                wlan_idx: Cell::new(0),
                phys: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to the uevent source. Call once at daemon init, after the
    /// initial interface sweep.
    pub fn subscribe(&self, source: &UeventSource) {
        let weak = Rc::downgrade(&self.inner);
        source.subscribe(Rc::new(move |ev, event| {
            if let Some(inner) = weak.upgrade() {
                Inner::handle_uevent(&inner, ev, event);
            }
        }));
    }

    /// Rename all physical interfaces present at daemon start to the
    /// managed `cml{eth|wlan}<n>` scheme before uevent handling begins.
    pub fn rename_existing(&self, ifnames: &[String]) {
        for ifname in ifnames {
            let wifi = net::interface_is_wifi(&self.inner.sysfs_root, ifname);
            let family = if wifi { "wlan" } else { "eth" };
            match self.inner.rename_to_managed(ifname, family) {
                Ok(newname) => self.inner.phys.borrow_mut().push(newname),
                Err(e) => warn!("initial rename of {} failed: {}", ifname, e),
            }
        }
    }

    /// Register a USB device mapping. At most one compartment may hold a
    /// token mapping with a given serial.
    pub fn register_usb(&self, owner: Uuid, config: UsbDeviceConfig) -> Result<()> {
        if config.kind == UsbKind::Token {
            let usb = self.inner.usb.borrow();
            if usb
                .iter()
                .any(|m| m.config.kind == UsbKind::Token && m.config.serial == config.serial)
            {
                return Err(Error::ResourceBusy(format!(
                    "token with serial '{}' already mapped",
                    config.serial
                )));
            }
        }
        info!(
            "registered usb mapping {:04x}:{:04x} '{}' ({:?}) for {}",
            config.vendor, config.product, config.serial, config.kind, owner
        );
        self.inner.usb.borrow_mut().push(UsbMapping {
            owner,
            config,
            major: Cell::new(-1),
            minor: Cell::new(-1),
        });
        Ok(())
    }

    pub fn unregister_usb(&self, owner: Uuid, config: &UsbDeviceConfig) -> Result<()> {
        let mut usb = self.inner.usb.borrow_mut();
        let before = usb.len();
        usb.retain(|m| {
            !(m.owner == owner
                && m.config.vendor == config.vendor
                && m.config.product == config.product
                && m.config.serial == config.serial)
        });
        if usb.len() == before {
            return Err(Error::PreconditionFailed(format!(
                "no usb mapping {:04x}:{:04x} '{}' for {}",
                config.vendor, config.product, config.serial, owner
            )));
        }
        info!(
            "unregistered usb mapping {:04x}:{:04x} '{}' for {}",
            config.vendor, config.product, config.serial, owner
        );
        Ok(())
    }

    /// Register a physical-net mapping. A MAC appears in at most one
    /// mapping.
    pub fn register_net(&self, owner: Uuid, config: PnetConfig) -> Result<()> {
        let mac = net::parse_mac(&config.mac)?;
        let mut table = self.inner.net.borrow_mut();
        if table.iter().any(|m| m.mac == mac) {
            return Err(Error::ResourceBusy(format!(
                "mac {} already mapped",
                config.mac
            )));
        }
        info!("registered net mapping {} for {}", config.mac, owner);
        table.push(NetMapping { owner, mac, config });
        Ok(())
    }

    pub fn unregister_net(&self, owner: Uuid, mac: &[u8; 6]) -> Result<()> {
        let mut table = self.inner.net.borrow_mut();
        let before = table.len();
        table.retain(|m| !(m.owner == owner && &m.mac == mac));
        if table.len() == before {
            return Err(Error::PreconditionFailed(format!(
                "no net mapping {} for {}",
                net::format_mac(mac),
                owner
            )));
        }
        info!("unregistered net mapping {} for {}", net::format_mac(mac), owner);
        Ok(())
    }

    /// Test/inspection hook: feed one event through the dispatch path.
    pub fn handle(&self, ev: &EventLoop, event: &Uevent) {
        Inner::handle_uevent(&self.inner, ev, event);
    }
}

impl Inner {
    fn handle_uevent(inner: &Rc<Inner>, ev: &EventLoop, event: &Uevent) {
        if Self::handle_usb(inner, ev, event) {
            return;
        }
        if event.action() == UeventAction::Add
            && event.subsystem() == "net"
            && !event.devpath().contains("virtual")
        {
            Self::handle_net_add(inner, ev, event);
        }
    }

    /// USB device add/remove. Returns true when the event is completely
    /// handled.
    fn handle_usb(inner: &Rc<Inner>, ev: &EventLoop, event: &Uevent) -> bool {
        if event.subsystem() != "usb" || event.devtype() != "usb_device" {
            return false;
        }
        match event.action() {
            UeventAction::Remove => {
                trace!("usb remove {}:{}", event.major(), event.minor());
                for mapping in inner.usb.borrow().iter() {
                    if mapping.major.get() == event.major() && mapping.minor.get() == event.minor()
                    {
                        if mapping.config.kind == UsbKind::Token {
                            info!("usb token removed");
                            inner.sink.token_detach(mapping.owner);
                        }
                        if let Err(e) = inner.sink.device_deny(
                            mapping.owner,
                            'c',
                            mapping.major.get() as u32,
                            mapping.minor.get() as u32,
                        ) {
                            warn!("device deny failed: {}", e);
                        }
                    }
                }
            }
            UeventAction::Add => {
                trace!("usb add {}:{}", event.major(), event.minor());
                let Some(serial) = inner.read_serial(event.devpath()) else {
                    trace!("usb device without readable serial");
                    return false;
                };
                for mapping in inner.usb.borrow().iter() {
                    if mapping.config.vendor != event.usb_vendor()
                        || mapping.config.product != event.usb_product()
                        || mapping.config.serial != serial
                    {
                        continue;
                    }
                    mapping.major.set(event.major());
                    mapping.minor.set(event.minor());
                    info!(
                        "{} device node {}:{} -> compartment {}",
                        if mapping.config.assign { "assign" } else { "allow" },
                        event.major(),
                        event.minor(),
                        mapping.owner
                    );
                    if mapping.config.kind == UsbKind::Token {
                        Self::schedule_token_attach(inner, ev, mapping.owner, event.devname());
                    }
                    if event.major() >= 0 && event.minor() >= 0 {
                        if let Err(e) = inner.sink.device_allow(
                            mapping.owner,
                            'c',
                            event.major() as u32,
                            event.minor() as u32,
                            mapping.config.assign,
                        ) {
                            warn!("device allow failed: {}", e);
                        }
                    }
                }
            }
            _ => {}
        }
        false
    }

    /// `/sys/<devpath>/serial`, newline-trimmed.
    fn read_serial(&self, devpath: &str) -> Option<String> {
        let path = self
            .sysfs_root
            .join(devpath.trim_start_matches('/'))
            .join("serial");
        let serial = std::fs::read_to_string(path).ok()?;
        let serial = serial.trim_end_matches('\n').to_string();
        if serial.is_empty() {
            None
        } else {
            Some(serial)
        }
    }

    /// The uevent devname may or may not carry a /dev prefix; normalize
    /// against the configured dev root.
    fn token_node_path(&self, devname: &str) -> PathBuf {
        match devname.strip_prefix("/dev/") {
            Some(rest) => self.dev_root.join(rest),
            None => self.dev_root.join(devname.trim_start_matches('/')),
        }
    }

    /// Give devfs time to create the token node, then attach. Fixed
    /// 10 x 100 ms, no jitter.
    fn schedule_token_attach(inner: &Rc<Inner>, ev: &EventLoop, owner: Uuid, devname: &str) {
        let node = inner.token_node_path(devname);
        let weak = Rc::downgrade(inner);
        let mut retries = TOKEN_RETRIES;
        debug!("waiting for token node {}", node.display());
        ev.add_timer(
            DEBOUNCE,
            Some(DEBOUNCE),
            Box::new(move |ev, handle| {
                let Some(inner) = weak.upgrade() else {
                    ev.remove_timer(handle);
                    return;
                };
                if !node.exists() {
                    retries = retries.saturating_sub(1);
                    if retries == 0 {
                        warn!("token node {} never appeared", node.display());
                        ev.remove_timer(handle);
                    }
                    return;
                }
                inner.sink.token_attach(owner);
                info!("processed token attachment of {}", node.display());
                ev.remove_timer(handle);
            }),
        );
    }

    /// New physical interface: track it and debounce before the move so
    /// sysfs (wifi especially) can settle.
    fn handle_net_add(inner: &Rc<Inner>, ev: &EventLoop, event: &Uevent) {
        inner
            .phys
            .borrow_mut()
            .push(event.interface().to_string());
        let weak = Rc::downgrade(inner);
        let event = event.clone();
        let mut retries = NETIF_RETRIES;
        ev.add_timer(
            DEBOUNCE,
            Some(DEBOUNCE),
            Box::new(move |ev, handle| {
                let Some(inner) = weak.upgrade() else {
                    ev.remove_timer(handle);
                    return;
                };
                // wifi interfaces must report as wireless before the move
                if event.devtype() == "wlan"
                    && !net::interface_is_wifi(&inner.sysfs_root, event.interface())
                {
                    retries = retries.saturating_sub(1);
                    if retries == 0 {
                        warn!(
                            "interface {} never reported wireless, dropping",
                            event.interface()
                        );
                        ev.remove_timer(handle);
                    }
                    return;
                }
                if Self::netdev_move(&inner, &event).is_err() {
                    warn!("did not move net interface {}", event.interface());
                } else {
                    info!("moved net interface {} to target", event.interface());
                }
                ev.remove_timer(handle);
            }),
        );
    }

    /// Consume a rename index (strictly monotonic per family, spent even if
    /// the rename fails) and perform the host-side rename.
    fn rename_to_managed(&self, oldname: &str, family: &str) -> Result<String> {
        let counter = if family == "wlan" {
            &self.wlan_idx
        } else {
            &self.eth_idx
        };
        let idx = counter.get();
        counter.set(idx + 1);
        let newname = format!("cml{}{}", family, idx);
        info!("renaming {} to {}", oldname, newname);
        self.sink.rename_ifi(oldname, &newname)?;
        Ok(newname)
    }

    /// Rename the interface, rewrite the uevent and move it into the
    /// mapped (or default) compartment.
    fn netdev_move(inner: &Rc<Inner>, event: &Uevent) -> Result<()> {
        let ifname = event.interface().to_string();
        let mac = net::get_mac_by_ifname(&inner.sysfs_root, &ifname).map_err(|e| {
            warn!("iface '{}' with no mac, skipping: {}", ifname, e);
            e
        })?;

        let (owner, mac_filter) = {
            let table = inner.net.borrow();
            match table.iter().find(|m| m.mac == mac) {
                Some(mapping) => (Some(mapping.owner), mapping.config.mac_filter),
                None => (None, false),
            }
        };
        // no mapping: ephemeral assignment to the default compartment
        let owner = match owner.or_else(|| inner.sink.default_compartment()) {
            Some(owner) => owner,
            None => {
                warn!("target compartment not found, skip moving {}", ifname);
                return Err(Error::PreconditionFailed("no target compartment".to_string()));
            }
        };

        match inner.sink.compartment_state(owner) {
            Some(state) if state.accepts_devices() => {}
            other => {
                warn!(
                    "target compartment {} is {:?}, skip moving {}",
                    owner, other, ifname
                );
                return Err(Error::PreconditionFailed("target not running".to_string()));
            }
        }

        // rename to a unique host-scope name to avoid clashes in the target
        let family = if event.devtype() == "wlan" { "wlan" } else { "eth" };
        let (moved_name, renamed_event) = match inner.rename_to_managed(&ifname, family) {
            Ok(newname) => {
                {
                    let mut phys = inner.phys.borrow_mut();
                    phys.retain(|n| n != &ifname);
                    phys.push(newname.clone());
                }
                // rewrite every occurrence of the old name (header, DEVPATH
                // and INTERFACE each carry one)
                let mut rewritten = Some(event.clone());
                for _ in 0..4 {
                    let Some(current) = rewritten.as_ref() else { break };
                    if current.interface() != ifname && !current.devpath().contains(ifname.as_str())
                    {
                        break;
                    }
                    match current.replace_member(&ifname, &newname) {
                        Some(e) => rewritten = Some(e),
                        None => {
                            rewritten = None;
                            break;
                        }
                    }
                }
                match rewritten {
                    Some(e) => {
                        debug!(
                            "injected renamed interface {} devpath {} into uevent",
                            e.interface(),
                            e.devpath()
                        );
                        (newname, Some(e))
                    }
                    None => (newname, None),
                }
            }
            Err(e) => {
                warn!("failed to rename {}: {}; moving as-is", ifname, e);
                (ifname.clone(), None)
            }
        };

        inner
            .sink
            .move_to_compartment(owner, &moved_name)
            .map_err(|e| {
                warn!("cannot move '{}' to {}: {}", net::format_mac(&mac), owner, e);
                e
            })?;
        info!(
            "moved phys network interface '{}' (mac: {}) to {}",
            moved_name,
            net::format_mac(&mac),
            owner
        );

        // a MAC-filtering bridge re-advertises the device itself
        if mac_filter {
            return Ok(());
        }
        let inject = renamed_event.as_ref().unwrap_or(event);
        if let Err(e) = inner.sink.inject_uevent(owner, inject) {
            warn!("could not inject uevent into netns of {}: {}", owner, e);
        }
        Ok(())
    }
}

/// Production sink backed by the daemon context.
pub struct ContextSink {
    ctx: Weak<Context>,
}

impl ContextSink {
    pub fn new(ctx: &Rc<Context>) -> ContextSink {
        ContextSink {
            ctx: Rc::downgrade(ctx),
        }
    }
}

impl HotplugSink for ContextSink {
    fn compartment_state(&self, uuid: Uuid) -> Option<CompartmentState> {
        self.ctx.upgrade()?.by_uuid(uuid).map(|c| c.state())
    }

    fn device_allow(
        &self,
        uuid: Uuid,
        kind: char,
        major: u32,
        minor: u32,
        assign: bool,
    ) -> Result<()> {
        let ctx = self
            .ctx
            .upgrade()
            .ok_or_else(|| Error::Internal("daemon context gone".to_string()))?;
        let c = ctx
            .by_uuid(uuid)
            .ok_or_else(|| Error::PreconditionFailed(format!("unknown compartment {}", uuid)))?;
        crate::cmod::cgroup::device_allow(&ctx, &c, kind, major, minor, assign)
    }

    fn device_deny(&self, uuid: Uuid, kind: char, major: u32, minor: u32) -> Result<()> {
        let ctx = self
            .ctx
            .upgrade()
            .ok_or_else(|| Error::Internal("daemon context gone".to_string()))?;
        let c = ctx
            .by_uuid(uuid)
            .ok_or_else(|| Error::PreconditionFailed(format!("unknown compartment {}", uuid)))?;
        crate::cmod::cgroup::device_deny(&ctx, &c, kind, major, minor)
    }

    fn token_attach(&self, uuid: Uuid) {
        if let Some(ctx) = self.ctx.upgrade() {
            if let Some(c) = ctx.by_uuid(uuid) {
                crate::cmod::smartcard::token_attach(&ctx, &c);
            }
        }
    }

    fn token_detach(&self, uuid: Uuid) {
        if let Some(ctx) = self.ctx.upgrade() {
            if let Some(c) = ctx.by_uuid(uuid) {
                crate::cmod::smartcard::token_detach(&ctx, &c);
            }
        }
    }

    fn rename_ifi(&self, old: &str, new: &str) -> Result<()> {
        net::rename_ifi(old, new)
    }

    fn move_to_compartment(&self, uuid: Uuid, ifname: &str) -> Result<()> {
        let ctx = self
            .ctx
            .upgrade()
            .ok_or_else(|| Error::Internal("daemon context gone".to_string()))?;
        let c = ctx
            .by_uuid(uuid)
            .ok_or_else(|| Error::PreconditionFailed(format!("unknown compartment {}", uuid)))?;
        crate::cmod::network::move_phys_into(&ctx, &c, ifname)
    }

    fn inject_uevent(&self, uuid: Uuid, event: &Uevent) -> Result<()> {
        let ctx = self
            .ctx
            .upgrade()
            .ok_or_else(|| Error::Internal("daemon context gone".to_string()))?;
        let c = ctx
            .by_uuid(uuid)
            .ok_or_else(|| Error::PreconditionFailed(format!("unknown compartment {}", uuid)))?;
        let pid = c
            .pid()
            .ok_or_else(|| Error::PreconditionFailed("compartment has no child".to_string()))?;
        event.inject_into_netns(pid, c.has_userns())
    }

    fn default_compartment(&self) -> Option<Uuid> {
        self.ctx.upgrade()?.default_compartment().map(|c| c.uuid())
    }
}
