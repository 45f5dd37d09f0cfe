/// Typed compartment configuration records.
///
/// The on-disk binary descriptor format is decoded by a collaborator; the
/// daemon only ever sees these records. Snapshots are persisted as JSON in
/// the compartment's state directory and are immutable once a start has
/// begun.
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Kind of a mapped USB device.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsbKind {
    /// Plain device node access.
    Generic,
    /// Security token; attach/detach drives the smartcard machinery.
    Token,
}

/// A USB device claim from the configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsbDeviceConfig {
    pub vendor: u16,
    pub product: u16,
    pub serial: String,
    pub kind: UsbKind,
    /// Exclusive assignment; shared read access when false.
    pub assign: bool,
}

/// Physical network interface claim, matched by MAC at hotplug time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PnetConfig {
    /// MAC address string, e.g. `02:00:00:00:00:01`.
    pub mac: String,
    /// The interface sits behind a MAC-filtering bridge; uevents are not
    /// re-injected because the bridge re-advertises.
    pub mac_filter: bool,
    pub addrs: Vec<IpConfig>,
}

/// Virtual interface pair created at start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VnetConfig {
    /// Interface name inside the compartment.
    pub name: String,
    pub addr: Option<IpConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpConfig {
    pub addr: Ipv4Addr,
    pub prefixlen: u8,
}

/// Rootfs assembly step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum VolumeKind {
    /// Read-only image, optionally dm-verity protected.
    Image { verity_hash: Option<String> },
    /// Writable overlay: image (if any) as lower, per-compartment upper.
    Overlay,
    /// dm-crypt volume keyed by the compartment key.
    Encrypted,
    /// Fresh tmpfs.
    Tmpfs { size_mb: u64 },
    /// Bind mount from the host.
    Bind { source: PathBuf },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub label: String,
    /// Image file relative to the compartment's image directory.
    pub image: Option<PathBuf>,
    /// Mount point relative to the compartment rootfs.
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub kind: VolumeKind,
}

/// Device cgroup rule, `kind` is 'c' or 'b'; `minor` of None means any.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRule {
    pub kind: char,
    pub major: u32,
    pub minor: Option<u32>,
    /// Subset of "rwm".
    pub access: String,
}

/// Seccomp policy; syscall numbers are resolved by the config collaborator
/// for the target architecture.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SeccompPolicy {
    pub denied_syscalls: Vec<u32>,
    /// Kill the process instead of returning EPERM.
    pub kill_on_violation: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompartmentConfig {
    pub name: String,
    /// Init binary path inside the assembled rootfs.
    pub init: PathBuf,
    pub init_args: Vec<String>,
    pub init_env: Vec<String>,
    /// Setup-mode init, used instead of `init` for provisioning boots.
    pub setup_init: Option<PathBuf>,

    pub ram_limit_mb: Option<u64>,
    pub pid_limit: Option<u32>,
    /// Size of the contiguous uid/gid range to allocate.
    pub uid_range_size: u32,

    pub usb_devices: Vec<UsbDeviceConfig>,
    pub pnet: Vec<PnetConfig>,
    pub vnet: Vec<VnetConfig>,
    pub volumes: Vec<VolumeConfig>,

    /// Capabilities kept in the bounding set, by number.
    pub caps_keep: Vec<u32>,
    pub seccomp: SeccompPolicy,
    /// Initial device cgroup allowlist.
    pub allowed_devices: Vec<DeviceRule>,

    /// Offset applied in the time namespace, seconds.
    pub time_offset_secs: Option<i64>,
    /// Unlock key material through the credential collaborator at start.
    pub token_required: bool,
}

impl CompartmentConfig {
    /// Minimal management-compartment configuration; used for `c0` when no
    /// persisted configuration exists yet.
    pub fn management(name: &str) -> Self {
        CompartmentConfig {
            name: name.to_string(),
            init: PathBuf::from("/sbin/init"),
            init_args: Vec::new(),
            init_env: Vec::new(),
            setup_init: None,
            ram_limit_mb: None,
            pid_limit: None,
            uid_range_size: 65536,
            usb_devices: Vec::new(),
            pnet: Vec::new(),
            vnet: Vec::new(),
            volumes: Vec::new(),
            caps_keep: Vec::new(),
            seccomp: SeccompPolicy::default(),
            allowed_devices: Vec::new(),
            time_offset_secs: None,
            token_required: false,
        }
    }

    /// Reject configurations the engine cannot act on. Called at register
    /// time so bad blobs never reach a start attempt.
    pub fn validate(&self) -> crate::types::Result<()> {
        if self.name.is_empty() || self.name.len() > 64 {
            return Err(crate::types::Error::ConfigInvalid(
                "compartment name empty or too long".to_string(),
            ));
        }
        if self.uid_range_size == 0 {
            return Err(crate::types::Error::ConfigInvalid(
                "uid range size must be non-zero".to_string(),
            ));
        }
        for pnet in &self.pnet {
            crate::net::parse_mac(&pnet.mac)?;
        }
        for usb in &self.usb_devices {
            if usb.serial.is_empty() {
                return Err(crate::types::Error::ConfigInvalid(format!(
                    "usb mapping {:04x}:{:04x} without serial",
                    usb.vendor, usb.product
                )));
            }
        }
        for vol in &self.volumes {
            if vol.mount_point.is_absolute() {
                return Err(crate::types::Error::ConfigInvalid(format!(
                    "volume '{}' mount point must be rootfs-relative",
                    vol.label
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn management_config_validates() {
        CompartmentConfig::management("c0").validate().unwrap();
    }

    #[test]
    fn rejects_bad_mac_in_pnet() {
        let mut cfg = CompartmentConfig::management("c1");
        cfg.pnet.push(PnetConfig {
            mac: "not-a-mac".to_string(),
            mac_filter: false,
            addrs: Vec::new(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_usb_mapping_without_serial() {
        let mut cfg = CompartmentConfig::management("c1");
        cfg.usb_devices.push(UsbDeviceConfig {
            vendor: 0x1050,
            product: 0x0407,
            serial: String::new(),
            kind: UsbKind::Token,
            assign: true,
        });
        assert!(cfg.validate().is_err());
    }
}
