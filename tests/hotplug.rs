//! Hotplug coordinator integration tests against a fake sysfs/dev tree and
//! a recording sink.

use compartmentd::compartment::config::{PnetConfig, UsbDeviceConfig, UsbKind};
use compartmentd::event::EventLoop;
use compartmentd::hotplug::{Hotplug, HotplugSink};
use compartmentd::types::{CompartmentState, Error, Result};
use compartmentd::uevent::Uevent;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
enum Call {
    DeviceAllow(Uuid, char, u32, u32, bool),
    DeviceDeny(Uuid, char, u32, u32),
    TokenAttach(Uuid),
    TokenDetach(Uuid),
    Rename(String, String),
    Move(Uuid, String),
    Inject(Uuid, String, String), // owner, interface, devpath
}

#[derive(Default)]
struct RecorderInner {
    calls: RefCell<Vec<Call>>,
    states: RefCell<HashMap<Uuid, CompartmentState>>,
    default_uuid: RefCell<Option<Uuid>>,
}

#[derive(Clone, Default)]
struct Recorder(Rc<RecorderInner>);

impl Recorder {
    fn set_state(&self, uuid: Uuid, state: CompartmentState) {
        self.0.states.borrow_mut().insert(uuid, state);
    }

    fn calls(&self) -> Vec<Call> {
        self.0.calls.borrow().clone()
    }

    fn push(&self, call: Call) {
        self.0.calls.borrow_mut().push(call);
    }
}

impl HotplugSink for Recorder {
    fn compartment_state(&self, uuid: Uuid) -> Option<CompartmentState> {
        self.0.states.borrow().get(&uuid).copied()
    }

    fn device_allow(
        &self,
        uuid: Uuid,
        kind: char,
        major: u32,
        minor: u32,
        assign: bool,
    ) -> Result<()> {
        self.push(Call::DeviceAllow(uuid, kind, major, minor, assign));
        Ok(())
    }

    fn device_deny(&self, uuid: Uuid, kind: char, major: u32, minor: u32) -> Result<()> {
        self.push(Call::DeviceDeny(uuid, kind, major, minor));
        Ok(())
    }

    fn token_attach(&self, uuid: Uuid) {
        self.push(Call::TokenAttach(uuid));
    }

    fn token_detach(&self, uuid: Uuid) {
        self.push(Call::TokenDetach(uuid));
    }

    fn rename_ifi(&self, old: &str, new: &str) -> Result<()> {
        self.push(Call::Rename(old.to_string(), new.to_string()));
        Ok(())
    }

    fn move_to_compartment(&self, uuid: Uuid, ifname: &str) -> Result<()> {
        if !self
            .compartment_state(uuid)
            .map(|s| s.accepts_devices())
            .unwrap_or(false)
        {
            return Err(Error::PreconditionFailed("not running".to_string()));
        }
        self.push(Call::Move(uuid, ifname.to_string()));
        Ok(())
    }

    fn inject_uevent(&self, uuid: Uuid, event: &Uevent) -> Result<()> {
        self.push(Call::Inject(
            uuid,
            event.interface().to_string(),
            event.devpath().to_string(),
        ));
        Ok(())
    }

    fn default_compartment(&self) -> Option<Uuid> {
        *self.0.default_uuid.borrow()
    }
}

struct Harness {
    ev: EventLoop,
    hotplug: Hotplug,
    recorder: Recorder,
    tmp: tempfile::TempDir,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let sysfs = tmp.path().join("sys");
    let dev = tmp.path().join("dev");
    std::fs::create_dir_all(&sysfs).unwrap();
    std::fs::create_dir_all(&dev).unwrap();
    let recorder = Recorder::default();
    let hotplug = Hotplug::new(Box::new(recorder.clone()), &sysfs, &dev);
    Harness {
        ev: EventLoop::new().unwrap(),
        hotplug,
        recorder,
        tmp,
    }
}

fn write_file(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn usb_add_event() -> Uevent {
    Uevent::synthesize(
        "add",
        "/devices/pci0/usb1/1-2",
        &[
            ("ACTION", "add"),
            ("SUBSYSTEM", "usb"),
            ("DEVTYPE", "usb_device"),
            ("DEVPATH", "/devices/pci0/usb1/1-2"),
            ("DEVNAME", "bus/usb/001/003"),
            ("MAJOR", "189"),
            ("MINOR", "3"),
            ("PRODUCT", "1050/407/110"),
        ],
    )
}

fn usb_remove_event() -> Uevent {
    Uevent::synthesize(
        "remove",
        "/devices/pci0/usb1/1-2",
        &[
            ("ACTION", "remove"),
            ("SUBSYSTEM", "usb"),
            ("DEVTYPE", "usb_device"),
            ("DEVPATH", "/devices/pci0/usb1/1-2"),
            ("MAJOR", "189"),
            ("MINOR", "3"),
        ],
    )
}

fn token_mapping() -> UsbDeviceConfig {
    UsbDeviceConfig {
        vendor: 0x1050,
        product: 0x0407,
        serial: "0001".to_string(),
        kind: UsbKind::Token,
        assign: true,
    }
}

/// S1: token add yields device allow then (debounced) token attach; remove
/// yields detach and deny, each exactly once.
#[test]
fn token_add_allow_attach_remove_deny_detach() {
    let h = harness();
    let c1 = Uuid::new_v4();
    h.recorder.set_state(c1, CompartmentState::Running);
    h.hotplug.register_usb(c1, token_mapping()).unwrap();

    write_file(
        &h.tmp.path().join("sys/devices/pci0/usb1/1-2/serial"),
        "0001\n",
    );
    write_file(&h.tmp.path().join("dev/bus/usb/001/003"), "");

    h.hotplug.handle(&h.ev, &usb_add_event());

    // allow is issued synchronously, exactly once
    assert_eq!(
        h.recorder
            .calls()
            .iter()
            .filter(|c| **c == Call::DeviceAllow(c1, 'c', 189, 3, true))
            .count(),
        1
    );
    // attach arrives after the 100 ms debounce, well inside one second
    h.ev.run_until(Instant::now() + Duration::from_millis(400)).unwrap();
    assert_eq!(
        h.recorder
            .calls()
            .iter()
            .filter(|c| **c == Call::TokenAttach(c1))
            .count(),
        1
    );

    h.hotplug.handle(&h.ev, &usb_remove_event());
    let calls = h.recorder.calls();
    assert_eq!(
        calls.iter().filter(|c| **c == Call::TokenDetach(c1)).count(),
        1
    );
    assert_eq!(
        calls
            .iter()
            .filter(|c| **c == Call::DeviceDeny(c1, 'c', 189, 3))
            .count(),
        1
    );
}

/// Generic (non-token) mappings get allow/deny but no token calls.
#[test]
fn generic_usb_shared_access() {
    let h = harness();
    let c1 = Uuid::new_v4();
    h.recorder.set_state(c1, CompartmentState::Running);
    h.hotplug
        .register_usb(
            c1,
            UsbDeviceConfig {
                kind: UsbKind::Generic,
                assign: false,
                ..token_mapping()
            },
        )
        .unwrap();
    write_file(
        &h.tmp.path().join("sys/devices/pci0/usb1/1-2/serial"),
        "0001\n",
    );

    h.hotplug.handle(&h.ev, &usb_add_event());
    h.ev.run_until(Instant::now() + Duration::from_millis(250)).unwrap();

    let calls = h.recorder.calls();
    assert!(calls.contains(&Call::DeviceAllow(c1, 'c', 189, 3, false)));
    assert!(!calls.iter().any(|c| matches!(c, Call::TokenAttach(_))));
}

/// Serial mismatches keep the mapping untouched.
#[test]
fn usb_serial_mismatch_is_ignored() {
    let h = harness();
    let c1 = Uuid::new_v4();
    h.recorder.set_state(c1, CompartmentState::Running);
    h.hotplug.register_usb(c1, token_mapping()).unwrap();
    write_file(
        &h.tmp.path().join("sys/devices/pci0/usb1/1-2/serial"),
        "9999\n",
    );
    h.hotplug.handle(&h.ev, &usb_add_event());
    h.ev.run_until(Instant::now() + Duration::from_millis(150)).unwrap();
    assert!(h.recorder.calls().is_empty());
}

/// Duplicate token serials are refused at registration.
#[test]
fn token_serial_uniqueness() {
    let h = harness();
    let c1 = Uuid::new_v4();
    let c2 = Uuid::new_v4();
    h.hotplug.register_usb(c1, token_mapping()).unwrap();
    let err = h.hotplug.register_usb(c2, token_mapping()).unwrap_err();
    assert!(matches!(err, Error::ResourceBusy(_)));
}

fn net_add_event(ifname: &str) -> Uevent {
    let devpath = format!("/devices/pci0/net/{}", ifname);
    Uevent::synthesize(
        "add",
        &devpath,
        &[
            ("ACTION", "add"),
            ("SUBSYSTEM", "net"),
            ("INTERFACE", ifname),
            ("DEVPATH", &devpath),
        ],
    )
}

fn register_iface_mac(h: &Harness, ifname: &str, mac: &str) {
    write_file(
        &h.tmp.path().join(format!("sys/class/net/{}/address", ifname)),
        &format!("{}\n", mac),
    );
}

/// S2: matching MAC mapping, booting target: rename to cmleth0, move, and
/// re-inject the rewritten uevent.
#[test]
fn net_add_renames_moves_and_reinjects() {
    let h = harness();
    let c2 = Uuid::new_v4();
    h.recorder.set_state(c2, CompartmentState::Booting);
    h.hotplug
        .register_net(
            c2,
            PnetConfig {
                mac: "02:00:00:00:00:01".to_string(),
                mac_filter: false,
                addrs: Vec::new(),
            },
        )
        .unwrap();
    register_iface_mac(&h, "eth7", "02:00:00:00:00:01");

    h.hotplug.handle(&h.ev, &net_add_event("eth7"));
    h.ev.run_until(Instant::now() + Duration::from_millis(400)).unwrap();

    let calls = h.recorder.calls();
    assert!(calls.contains(&Call::Rename("eth7".to_string(), "cmleth0".to_string())));
    assert!(calls.contains(&Call::Move(c2, "cmleth0".to_string())));
    assert!(calls.contains(&Call::Inject(
        c2,
        "cmleth0".to_string(),
        "/devices/pci0/net/cmleth0".to_string()
    )));
}

/// Invariant 4: the per-family rename index is strictly monotonic.
#[test]
fn rename_indices_are_monotonic_per_family() {
    let h = harness();
    let c = Uuid::new_v4();
    h.recorder.set_state(c, CompartmentState::Running);
    for (i, mac) in ["02:00:00:00:00:11", "02:00:00:00:00:12"].iter().enumerate() {
        let ifname = format!("eth{}", i);
        h.hotplug
            .register_net(
                c,
                PnetConfig {
                    mac: mac.to_string(),
                    mac_filter: false,
                    addrs: Vec::new(),
                },
            )
            .unwrap();
        register_iface_mac(&h, &ifname, mac);
        h.hotplug.handle(&h.ev, &net_add_event(&ifname));
    }
    h.ev.run_until(Instant::now() + Duration::from_millis(400)).unwrap();

    let renames: Vec<Call> = h
        .recorder
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Rename(..)))
        .collect();
    assert_eq!(
        renames,
        vec![
            Call::Rename("eth0".to_string(), "cmleth0".to_string()),
            Call::Rename("eth1".to_string(), "cmleth1".to_string()),
        ]
    );
}

/// Moves are refused when the target compartment is not in a device-
/// accepting state; the event is dropped.
#[test]
fn net_add_to_stopped_target_is_dropped() {
    let h = harness();
    let c = Uuid::new_v4();
    h.recorder.set_state(c, CompartmentState::Stopped);
    h.hotplug
        .register_net(
            c,
            PnetConfig {
                mac: "02:00:00:00:00:01".to_string(),
                mac_filter: false,
                addrs: Vec::new(),
            },
        )
        .unwrap();
    register_iface_mac(&h, "eth7", "02:00:00:00:00:01");

    h.hotplug.handle(&h.ev, &net_add_event("eth7"));
    h.ev.run_until(Instant::now() + Duration::from_millis(300)).unwrap();

    let calls = h.recorder.calls();
    assert!(!calls.iter().any(|c| matches!(c, Call::Move(..))));
    assert!(!calls.iter().any(|c| matches!(c, Call::Rename(..))));
}

/// MAC-filter-bridged mappings move the interface but suppress the uevent
/// re-injection (the bridge re-advertises).
#[test]
fn mac_filter_suppresses_reinjection() {
    let h = harness();
    let c = Uuid::new_v4();
    h.recorder.set_state(c, CompartmentState::Running);
    h.hotplug
        .register_net(
            c,
            PnetConfig {
                mac: "02:00:00:00:00:01".to_string(),
                mac_filter: true,
                addrs: Vec::new(),
            },
        )
        .unwrap();
    register_iface_mac(&h, "eth7", "02:00:00:00:00:01");

    h.hotplug.handle(&h.ev, &net_add_event("eth7"));
    h.ev.run_until(Instant::now() + Duration::from_millis(300)).unwrap();

    let calls = h.recorder.calls();
    assert!(calls.iter().any(|c| matches!(c, Call::Move(..))));
    assert!(!calls.iter().any(|c| matches!(c, Call::Inject(..))));
}

/// Unmatched interfaces land in the default compartment.
#[test]
fn unmatched_mac_goes_to_default_compartment() {
    let h = harness();
    let c0 = Uuid::new_v4();
    h.recorder.set_state(c0, CompartmentState::Running);
    *h.recorder.0.default_uuid.borrow_mut() = Some(c0);
    register_iface_mac(&h, "eth9", "02:00:00:00:00:99");

    h.hotplug.handle(&h.ev, &net_add_event("eth9"));
    h.ev.run_until(Instant::now() + Duration::from_millis(300)).unwrap();

    assert!(h
        .recorder
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Move(uuid, name) if *uuid == c0 && name == "cmleth0")));
}

/// Virtual interfaces are never touched.
#[test]
fn virtual_interfaces_are_ignored() {
    let h = harness();
    let event = Uevent::synthesize(
        "add",
        "/devices/virtual/net/veth0",
        &[
            ("ACTION", "add"),
            ("SUBSYSTEM", "net"),
            ("INTERFACE", "veth0"),
            ("DEVPATH", "/devices/virtual/net/veth0"),
        ],
    );
    h.hotplug.handle(&h.ev, &event);
    h.ev.run_until(Instant::now() + Duration::from_millis(200)).unwrap();
    assert!(h.recorder.calls().is_empty());
}
