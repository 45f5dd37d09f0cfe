/// Kernel uevent source.
///
/// Opens a netlink socket of the kobject-uevent family, decodes the
/// `\0`-separated `KEY=value` frames into immutable `Uevent` records and
/// dispatches them to subscribers on the event loop. Rename helpers produce
/// rewritten copies; frames are never mutated in place.
use crate::event::{EventLoop, IoInterest};
use crate::types::{Error, Result};
use log::{debug, trace, warn};
use nix::sched::{setns, CloneFlags};
use nix::sys::socket::{
    bind, recv, sendto, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use std::cell::RefCell;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

/// Netlink multicast group carrying kernel uevents.
const UEVENT_GROUP_KERNEL: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Remove,
    Change,
    Other,
}

/// A decoded kernel uevent. Owns the raw frame; accessors scan it lazily so
/// the frame itself stays the single source of truth.
#[derive(Clone)]
pub struct Uevent {
    buf: Vec<u8>,
}

impl Uevent {
    /// Parse a netlink frame. Frames from libudev (prefixed binary header)
    /// and malformed frames are rejected.
    pub fn parse(data: &[u8]) -> Option<Uevent> {
        let header = data.split(|&b| b == 0).next()?;
        let header = std::str::from_utf8(header).ok()?;
        if !header.contains('@') {
            trace!("dropping non-kernel uevent frame");
            return None;
        }
        Some(Uevent { buf: data.to_vec() })
    }

    /// Build an event from key=value lines; used by tests and re-injection.
    pub fn synthesize(action: &str, devpath: &str, fields: &[(&str, &str)]) -> Uevent {
        let mut buf = Vec::new();
        buf.extend_from_slice(action.as_bytes());
        buf.push(b'@');
        buf.extend_from_slice(devpath.as_bytes());
        buf.push(0);
        for (k, v) in fields {
            buf.extend_from_slice(k.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        }
        Uevent { buf }
    }

    pub fn raw(&self) -> &[u8] {
        &self.buf
    }

    /// Zero-copy lookup of a `KEY=` value in the frame.
    fn field(&self, key: &str) -> Option<&str> {
        for token in self.buf.split(|&b| b == 0).skip(1) {
            let token = std::str::from_utf8(token).ok()?;
            if let Some(value) = token.strip_prefix(key) {
                if let Some(value) = value.strip_prefix('=') {
                    return Some(value);
                }
            }
        }
        None
    }

    pub fn action(&self) -> UeventAction {
        match self.field("ACTION").unwrap_or("") {
            "add" => UeventAction::Add,
            "remove" => UeventAction::Remove,
            "change" => UeventAction::Change,
            _ => UeventAction::Other,
        }
    }

    pub fn subsystem(&self) -> &str {
        self.field("SUBSYSTEM").unwrap_or("")
    }

    pub fn devpath(&self) -> &str {
        self.field("DEVPATH").unwrap_or("")
    }

    pub fn devname(&self) -> &str {
        self.field("DEVNAME").unwrap_or("")
    }

    pub fn devtype(&self) -> &str {
        self.field("DEVTYPE").unwrap_or("")
    }

    pub fn interface(&self) -> &str {
        self.field("INTERFACE").unwrap_or("")
    }

    pub fn major(&self) -> i32 {
        self.field("MAJOR").and_then(|v| v.parse().ok()).unwrap_or(-1)
    }

    pub fn minor(&self) -> i32 {
        self.field("MINOR").and_then(|v| v.parse().ok()).unwrap_or(-1)
    }

    /// USB idVendor from the `PRODUCT=vid/pid/rev` field, hex without 0x.
    pub fn usb_vendor(&self) -> u16 {
        self.product_part(0)
    }

    pub fn usb_product(&self) -> u16 {
        self.product_part(1)
    }

    fn product_part(&self, idx: usize) -> u16 {
        self.field("PRODUCT")
            .and_then(|v| v.split('/').nth(idx))
            .and_then(|v| u16::from_str_radix(v, 16).ok())
            .unwrap_or(0)
    }

    /// Return a copy with the first occurrence of `old` replaced by `new`.
    /// The original event is left untouched.
    pub fn replace_member(&self, old: &str, new: &str) -> Option<Uevent> {
        if old.is_empty() {
            return None;
        }
        let pos = self
            .buf
            .windows(old.len())
            .position(|w| w == old.as_bytes())?;
        let mut buf = Vec::with_capacity(self.buf.len() + new.len() - old.len());
        buf.extend_from_slice(&self.buf[..pos]);
        buf.extend_from_slice(new.as_bytes());
        buf.extend_from_slice(&self.buf[pos + old.len()..]);
        Some(Uevent { buf })
    }

    /// Re-inject this frame into the net namespace of `pid`. Runs in a
    /// short-lived forked helper that joins the target namespaces; for
    /// user-namespaced targets the user namespace is entered first so the
    /// helper holds CAP_NET_ADMIN there.
    pub fn inject_into_netns(&self, pid: Pid, join_userns: bool) -> Result<()> {
        // SAFETY: single-threaded daemon; the child only calls setns,
        // socket syscalls and _exit.
        match unsafe { fork() }.map_err(|e| Error::kernel("fork", e))? {
            ForkResult::Child => {
                let code = match self.inject_in_child(pid, join_userns) {
                    Ok(()) => 0,
                    Err(e) => {
                        warn!("uevent injection helper failed: {}", e);
                        1
                    }
                };
                // SAFETY: terminate the helper without running atexit hooks.
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).map_err(|e| Error::kernel("waitpid", e))?;
                match status {
                    nix::sys::wait::WaitStatus::Exited(_, 0) => Ok(()),
                    other => Err(Error::Internal(format!(
                        "uevent injection helper: {:?}",
                        other
                    ))),
                }
            }
        }
    }

    fn inject_in_child(&self, pid: Pid, join_userns: bool) -> Result<()> {
        if join_userns {
            let userns = File::open(format!("/proc/{}/ns/user", pid))?;
            setns(userns, CloneFlags::CLONE_NEWUSER).map_err(|e| Error::kernel("setns user", e))?;
        }
        let netns = File::open(format!("/proc/{}/ns/net", pid))?;
        setns(netns, CloneFlags::CLONE_NEWNET).map_err(|e| Error::kernel("setns net", e))?;

        let sock = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|e| Error::kernel("socket", e))?;
        let addr = NetlinkAddr::new(0, 0);
        bind(sock.as_raw_fd(), &addr).map_err(|e| Error::kernel("bind", e))?;
        let dest = NetlinkAddr::new(0, UEVENT_GROUP_KERNEL);
        sendto(sock.as_raw_fd(), &self.buf, &dest, MsgFlags::empty())
            .map_err(|e| Error::kernel("sendto", e))?;
        Ok(())
    }
}

impl std::fmt::Debug for Uevent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uevent")
            .field("action", &self.field("ACTION").unwrap_or(""))
            .field("subsystem", &self.subsystem())
            .field("devpath", &self.devpath())
            .field("devname", &self.devname())
            .field("interface", &self.interface())
            .field("major", &self.major())
            .field("minor", &self.minor())
            .finish()
    }
}

pub type UeventSubscriber = Rc<dyn Fn(&EventLoop, &Uevent)>;

/// Reads uevents off the netlink socket and fans them out to subscribers.
pub struct UeventSource {
    _fd: OwnedFd,
    subscribers: Rc<RefCell<Vec<UeventSubscriber>>>,
}

impl UeventSource {
    /// Open the netlink socket and register it on the loop. Fatal at daemon
    /// init if the socket cannot be created.
    pub fn new(ev: &EventLoop) -> Result<Rc<UeventSource>> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|e| Error::kernel("netlink socket", e))?;
        let addr = NetlinkAddr::new(std::process::id(), UEVENT_GROUP_KERNEL);
        bind(fd.as_raw_fd(), &addr).map_err(|e| Error::kernel("netlink bind", e))?;

        let source = Rc::new(UeventSource {
            subscribers: Rc::new(RefCell::new(Vec::new())),
            _fd: fd,
        });

        let subscribers = source.subscribers.clone();
        let raw = source._fd.as_raw_fd();
        ev.add_io(
            raw,
            IoInterest::Read,
            Box::new(move |ev, fd, readiness| {
                if !readiness.readable {
                    return;
                }
                let mut buf = vec![0u8; 4096];
                loop {
                    match recv(fd, &mut buf, MsgFlags::empty()) {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Some(event) = Uevent::parse(&buf[..n]) {
                                debug!("uevent: {:?}", event);
                                dispatch(&subscribers, ev, &event);
                            }
                        }
                        Err(nix::errno::Errno::EAGAIN) => break,
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(e) => {
                            warn!("uevent recv failed: {}", e);
                            break;
                        }
                    }
                }
            }),
        );

        Ok(source)
    }

    pub fn subscribe(&self, cb: UeventSubscriber) {
        self.subscribers.borrow_mut().push(cb);
    }
}

fn dispatch(subscribers: &Rc<RefCell<Vec<UeventSubscriber>>>, ev: &EventLoop, event: &Uevent) {
    // Snapshot under the borrow, invoke outside it, so a subscriber may
    // register further subscribers from inside its callback.
    let snapshot: Vec<UeventSubscriber> = subscribers.borrow().clone();
    for cb in snapshot {
        cb(ev, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_add_frame() -> Uevent {
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

    #[test]
    fn parses_usb_add() {
        let ev = usb_add_frame();
        assert_eq!(ev.action(), UeventAction::Add);
        assert_eq!(ev.subsystem(), "usb");
        assert_eq!(ev.devtype(), "usb_device");
        assert_eq!(ev.devpath(), "/devices/pci0/usb1/1-2");
        assert_eq!(ev.major(), 189);
        assert_eq!(ev.minor(), 3);
        assert_eq!(ev.usb_vendor(), 0x1050);
        assert_eq!(ev.usb_product(), 0x0407);
    }

    #[test]
    fn missing_fields_have_defaults() {
        let ev = Uevent::synthesize("change", "/devices/x", &[("ACTION", "change")]);
        assert_eq!(ev.action(), UeventAction::Change);
        assert_eq!(ev.subsystem(), "");
        assert_eq!(ev.major(), -1);
        assert_eq!(ev.usb_vendor(), 0);
    }

    #[test]
    fn rejects_frames_without_header() {
        assert!(Uevent::parse(b"ACTION=add\0SUBSYSTEM=usb\0").is_none());
        assert!(Uevent::parse(b"add@/devices/x\0ACTION=add\0").is_some());
    }

    #[test]
    fn replace_member_copies_frame() {
        let ev = Uevent::synthesize(
            "add",
            "/devices/pci0/net/eth7",
            &[
                ("ACTION", "add"),
                ("SUBSYSTEM", "net"),
                ("INTERFACE", "eth7"),
                ("DEVPATH", "/devices/pci0/net/eth7"),
            ],
        );
        let renamed = ev.replace_member("eth7", "cmleth0").unwrap();
        assert_eq!(renamed.interface(), "cmleth0");
        // original untouched
        assert_eq!(ev.interface(), "eth7");
        // only the first occurrence changed; the devpath is rewritten by a
        // second replace_member call in the hotplug path
        assert_eq!(renamed.devpath(), "/devices/pci0/net/eth7");
        let full = renamed.replace_member("eth7", "cmleth0").unwrap();
        assert_eq!(full.devpath(), "/devices/pci0/net/cmleth0");
    }
}
