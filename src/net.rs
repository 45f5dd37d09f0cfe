/// Host-side network plumbing: MAC handling, interface rename, veth
/// creation, address setup and moving interfaces between net namespaces.
///
/// Kernel interaction is a mix of classic ioctls (rename, flags) and a
/// small hand-rolled rtnetlink encoder; the handful of message layouts we
/// need is not worth a netlink crate dependency.
use crate::types::{Error, Result};
use log::{debug, info};
use nix::sys::socket::{socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType};
use nix::unistd::Pid;
use std::os::fd::AsRawFd;
use std::path::Path;

pub const MAC_LEN: usize = 6;

/// Parse `aa:bb:cc:dd:ee:ff` into raw bytes.
pub fn parse_mac(s: &str) -> Result<[u8; MAC_LEN]> {
    let mut mac = [0u8; MAC_LEN];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != MAC_LEN {
        return Err(Error::ConfigInvalid(format!("malformed mac address '{}'", s)));
    }
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16)
            .map_err(|_| Error::ConfigInvalid(format!("malformed mac address '{}'", s)))?;
    }
    Ok(mac)
}

pub fn format_mac(mac: &[u8; MAC_LEN]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Read the current MAC of an interface from sysfs.
pub fn get_mac_by_ifname(sysfs_root: &Path, ifname: &str) -> Result<[u8; MAC_LEN]> {
    let path = sysfs_root.join("class/net").join(ifname).join("address");
    let content = std::fs::read_to_string(&path)?;
    parse_mac(content.trim())
}

/// An interface is wifi iff its sysfs node exposes a `wireless` directory.
pub fn interface_is_wifi(sysfs_root: &Path, ifname: &str) -> bool {
    sysfs_root
        .join("class/net")
        .join(ifname)
        .join("wireless")
        .exists()
}

const IFNAMSIZ: usize = 16;

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    // union ifr_ifru; large enough for every request we issue
    data: [u8; 24],
}

fn ifreq_with_name(name: &str) -> Result<IfReq> {
    if name.len() >= IFNAMSIZ {
        return Err(Error::ConfigInvalid(format!("interface name too long: {}", name)));
    }
    let mut req = IfReq {
        name: [0; IFNAMSIZ],
        data: [0; 24],
    };
    req.name[..name.len()].copy_from_slice(name.as_bytes());
    Ok(req)
}

fn ctrl_socket() -> Result<std::os::fd::OwnedFd> {
    socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| Error::kernel("socket", e))
}

const SIOCSIFNAME: libc::c_ulong = 0x8923;
const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;

/// Rename a host-namespace interface.
pub fn rename_ifi(old: &str, new: &str) -> Result<()> {
    let sock = ctrl_socket()?;
    let mut req = ifreq_with_name(old)?;
    if new.len() >= IFNAMSIZ {
        return Err(Error::ConfigInvalid(format!("interface name too long: {}", new)));
    }
    req.data[..new.len()].copy_from_slice(new.as_bytes());
    // SAFETY: req is a properly initialized ifreq-sized struct.
    let rc = unsafe { libc::ioctl(sock.as_raw_fd(), SIOCSIFNAME, &mut req) };
    if rc != 0 {
        return Err(Error::kernel_last("SIOCSIFNAME"));
    }
    info!("renamed interface {} to {}", old, new);
    Ok(())
}

/// Bring an interface up (IFF_UP).
pub fn set_ifi_up(ifname: &str) -> Result<()> {
    let sock = ctrl_socket()?;
    let mut req = ifreq_with_name(ifname)?;
    // SAFETY: valid ifreq struct for both ioctls.
    unsafe {
        if libc::ioctl(sock.as_raw_fd(), SIOCGIFFLAGS, &mut req) != 0 {
            return Err(Error::kernel_last("SIOCGIFFLAGS"));
        }
        let flags = i16::from_ne_bytes([req.data[0], req.data[1]]);
        let flags = flags | libc::IFF_UP as i16;
        req.data[..2].copy_from_slice(&flags.to_ne_bytes());
        if libc::ioctl(sock.as_raw_fd(), SIOCSIFFLAGS, &mut req) != 0 {
            return Err(Error::kernel_last("SIOCSIFFLAGS"));
        }
    }
    Ok(())
}

// rtnetlink message types and attributes we encode
const RTM_NEWLINK: u16 = 16;
const RTM_NEWADDR: u16 = 20;
const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;
const NLMSG_ERROR: u16 = 0x2;

const IFLA_IFNAME: u16 = 3;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_ADDRESS: u16 = 1;

const NLMSG_HDRLEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Incremental rtnetlink request builder. The nlmsghdr length field is
/// patched in `send`.
struct NlRequest {
    buf: Vec<u8>,
}

impl NlRequest {
    fn new(msg_type: u16, flags: u16) -> Self {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
        buf[6..8].copy_from_slice(&(flags | NLM_F_REQUEST | NLM_F_ACK).to_ne_bytes());
        buf[8..12].copy_from_slice(&1u32.to_ne_bytes()); // seq
        NlRequest { buf }
    }

    fn put(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append `struct ifinfomsg` with the given index.
    fn put_ifinfomsg(&mut self, index: i32) {
        let mut msg = [0u8; IFINFOMSG_LEN];
        msg[0] = libc::AF_UNSPEC as u8;
        msg[4..8].copy_from_slice(&index.to_ne_bytes());
        self.put(&msg);
    }

    fn put_attr(&mut self, kind: u16, payload: &[u8]) {
        let len = 4 + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align4(self.buf.len()), 0);
    }

    /// Open a nested attribute; the returned offset closes it.
    fn begin_nested(&mut self, kind: u16) -> usize {
        let offset = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        offset
    }

    fn end_nested(&mut self, offset: usize) {
        let len = (self.buf.len() - offset) as u16;
        self.buf[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
    }

    /// Send over a fresh route socket and wait for the kernel ack.
    fn send(mut self, what: &str) -> Result<()> {
        let total = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&total.to_ne_bytes());

        let sock = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )
        .map_err(|e| Error::kernel("socket", e))?;
        let kernel = NetlinkAddr::new(0, 0);
        nix::sys::socket::sendto(sock.as_raw_fd(), &self.buf, &kernel, MsgFlags::empty())
            .map_err(|e| Error::kernel("sendto", e))?;

        let mut reply = vec![0u8; 4096];
        let n = nix::sys::socket::recv(sock.as_raw_fd(), &mut reply, MsgFlags::empty())
            .map_err(|e| Error::kernel("recv", e))?;
        if n < NLMSG_HDRLEN + 4 {
            return Err(Error::Internal(format!("short netlink reply for {}", what)));
        }
        let msg_type = u16::from_ne_bytes([reply[4], reply[5]]);
        if msg_type != NLMSG_ERROR {
            return Err(Error::Internal(format!(
                "unexpected netlink reply type {} for {}",
                msg_type, what
            )));
        }
        let errno = i32::from_ne_bytes([
            reply[NLMSG_HDRLEN],
            reply[NLMSG_HDRLEN + 1],
            reply[NLMSG_HDRLEN + 2],
            reply[NLMSG_HDRLEN + 3],
        ]);
        if errno != 0 {
            return Err(Error::Kernel {
                op: what.to_string(),
                errno: -errno,
            });
        }
        Ok(())
    }
}

fn ifindex(ifname: &str) -> Result<i32> {
    let c = std::ffi::CString::new(ifname)
        .map_err(|_| Error::ConfigInvalid(format!("bad interface name {}", ifname)))?;
    // SAFETY: c is a valid NUL-terminated string.
    let idx = unsafe { libc::if_nametoindex(c.as_ptr()) };
    if idx == 0 {
        return Err(Error::kernel_last("if_nametoindex"));
    }
    Ok(idx as i32)
}

/// Move an interface into the net namespace of `pid`.
pub fn move_ifi_to_netns_pid(ifname: &str, pid: Pid) -> Result<()> {
    let idx = ifindex(ifname)?;
    let mut req = NlRequest::new(RTM_NEWLINK, 0);
    req.put_ifinfomsg(idx);
    req.put_attr(IFLA_NET_NS_PID, &(pid.as_raw() as u32).to_ne_bytes());
    req.send("move interface to netns")?;
    debug!("moved interface {} into netns of pid {}", ifname, pid);
    Ok(())
}

/// Create a veth pair in the host namespace.
pub fn create_veth_pair(name: &str, peer: &str) -> Result<()> {
    let mut req = NlRequest::new(RTM_NEWLINK, NLM_F_CREATE | NLM_F_EXCL);
    req.put_ifinfomsg(0);
    let mut ifname = name.as_bytes().to_vec();
    ifname.push(0);
    req.put_attr(IFLA_IFNAME, &ifname);

    let linkinfo = req.begin_nested(IFLA_LINKINFO);
    req.put_attr(IFLA_INFO_KIND, b"veth");
    let infodata = req.begin_nested(IFLA_INFO_DATA);
    let peer_nested = req.begin_nested(VETH_INFO_PEER);
    // VETH_INFO_PEER carries its own ifinfomsg followed by attributes
    req.put_ifinfomsg(0);
    let mut peername = peer.as_bytes().to_vec();
    peername.push(0);
    req.put_attr(IFLA_IFNAME, &peername);
    req.end_nested(peer_nested);
    req.end_nested(infodata);
    req.end_nested(linkinfo);

    req.send("create veth pair")?;
    info!("created veth pair {} <-> {}", name, peer);
    Ok(())
}

/// Delete a link by name; used when unwinding a failed start.
pub fn delete_ifi(ifname: &str) -> Result<()> {
    const RTM_DELLINK: u16 = 17;
    let idx = ifindex(ifname)?;
    let mut req = NlRequest::new(RTM_DELLINK, 0);
    req.put_ifinfomsg(idx);
    req.send("delete interface")
}

/// Assign an IPv4 address to an interface.
pub fn add_ipv4_addr(ifname: &str, addr: std::net::Ipv4Addr, prefixlen: u8) -> Result<()> {
    let idx = ifindex(ifname)?;
    let mut req = NlRequest::new(RTM_NEWADDR, NLM_F_CREATE | NLM_F_EXCL);
    // struct ifaddrmsg
    let mut msg = [0u8; 8];
    msg[0] = libc::AF_INET as u8;
    msg[1] = prefixlen;
    msg[4..8].copy_from_slice(&(idx as u32).to_ne_bytes());
    req.put(&msg);
    req.put_attr(IFA_LOCAL, &addr.octets());
    req.put_attr(IFA_ADDRESS, &addr.octets());
    req.send("add ipv4 address")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_roundtrip() {
        let mac = parse_mac("02:00:00:00:00:01").unwrap();
        assert_eq!(mac, [2, 0, 0, 0, 0, 1]);
        assert_eq!(format_mac(&mac), "02:00:00:00:00:01");
    }

    #[test]
    fn rejects_malformed_macs() {
        assert!(parse_mac("02:00:00:00:00").is_err());
        assert!(parse_mac("02:00:00:00:00:zz").is_err());
        assert!(parse_mac("").is_err());
    }

    #[test]
    fn wifi_detection_uses_sysfs_wireless_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        std::fs::create_dir_all(base.join("class/net/wlx0/wireless")).unwrap();
        std::fs::create_dir_all(base.join("class/net/eth0")).unwrap();
        assert!(interface_is_wifi(base, "wlx0"));
        assert!(!interface_is_wifi(base, "eth0"));
    }

    #[test]
    fn mac_read_from_sysfs() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        std::fs::create_dir_all(base.join("class/net/eth7")).unwrap();
        std::fs::write(base.join("class/net/eth7/address"), "02:00:00:00:00:01\n").unwrap();
        let mac = get_mac_by_ifname(base, "eth7").unwrap();
        assert_eq!(format_mac(&mac), "02:00:00:00:00:01");
    }

    #[test]
    fn attr_alignment_pads_to_four() {
        let mut req = NlRequest::new(RTM_NEWLINK, 0);
        req.put_ifinfomsg(1);
        req.put_attr(IFLA_IFNAME, b"eth0\0");
        // header 16 + ifinfomsg 16 + attr (4 + 5 padded to 12)
        assert_eq!(req.buf.len(), 16 + 16 + 12);
    }
}
