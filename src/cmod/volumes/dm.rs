/// Minimal device-mapper ioctl client: create, load a single-target table,
/// resume and remove. Covers the verity and crypt targets the volumes
/// module needs; the full libdevmapper surface is intentionally absent.
use crate::types::{Error, Result};
use log::debug;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

const DM_VERSION_MAJOR: u32 = 4;
const DM_IOCTL_STRUCT_SIZE: usize = 312;
const DM_TARGET_SPEC_SIZE: usize = 40;
const DM_NAME_LEN: usize = 128;

const DM_DEV_CREATE_CMD: u64 = 3;
const DM_DEV_REMOVE_CMD: u64 = 4;
const DM_DEV_SUSPEND_CMD: u64 = 6;
const DM_TABLE_LOAD_CMD: u64 = 9;

const DM_READONLY_FLAG: u32 = 1 << 0;

/// _IOWR(0xfd, nr, struct dm_ioctl)
fn dm_request(nr: u64) -> libc::c_ulong {
    ((3u64 << 30) | ((DM_IOCTL_STRUCT_SIZE as u64) << 16) | (0xfdu64 << 8) | nr) as libc::c_ulong
}

/// struct dm_ioctl, fixed 312-byte prefix of every request.
#[repr(C)]
struct DmIoctl {
    version: [u32; 3],
    data_size: u32,
    data_start: u32,
    target_count: u32,
    open_count: i32,
    flags: u32,
    event_nr: u32,
    padding: u32,
    dev: u64,
    name: [u8; DM_NAME_LEN],
    uuid: [u8; 129],
    data: [u8; 7],
}

impl DmIoctl {
    fn new(name: &str) -> Result<DmIoctl> {
        if name.len() >= DM_NAME_LEN {
            return Err(Error::ConfigInvalid(format!("dm name too long: {}", name)));
        }
        // SAFETY: all-zero is a valid representation for this POD struct.
        let mut hdr: DmIoctl = unsafe { std::mem::zeroed() };
        hdr.version = [DM_VERSION_MAJOR, 0, 0];
        hdr.data_size = DM_IOCTL_STRUCT_SIZE as u32;
        hdr.data_start = DM_IOCTL_STRUCT_SIZE as u32;
        hdr.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(hdr)
    }
}

/// struct dm_target_spec preceding the parameter string.
#[repr(C)]
struct DmTargetSpec {
    sector_start: u64,
    length: u64,
    status: i32,
    next: u32,
    target_type: [u8; 16],
}

fn control_fd() -> Result<std::fs::File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/mapper/control")
        .map_err(Error::from)
}

fn dm_ioctl_plain(cmd: u64, name: &str, flags: u32) -> Result<()> {
    let mut hdr = DmIoctl::new(name)?;
    hdr.flags = flags;
    let ctl = control_fd()?;
    // SAFETY: hdr is a properly initialized dm_ioctl of the declared size.
    let rc = unsafe { libc::ioctl(ctl.as_raw_fd(), dm_request(cmd), &mut hdr) };
    if rc != 0 {
        return Err(Error::kernel_last("dm ioctl"));
    }
    Ok(())
}

/// Register a new mapped device.
pub fn create(name: &str) -> Result<()> {
    dm_ioctl_plain(DM_DEV_CREATE_CMD, name, 0)?;
    debug!("dm device {} created", name);
    Ok(())
}

/// Load a single-target table. `sectors` is the device length in 512-byte
/// sectors; `params` is the target parameter string (verity/crypt syntax).
pub fn load_table(
    name: &str,
    sectors: u64,
    target_type: &str,
    params: &str,
    readonly: bool,
) -> Result<()> {
    if target_type.len() >= 16 {
        return Err(Error::ConfigInvalid(format!(
            "dm target type too long: {}",
            target_type
        )));
    }
    let params_len = params.len() + 1; // NUL
    let spec_total = (DM_TARGET_SPEC_SIZE + params_len + 7) & !7;
    let total = DM_IOCTL_STRUCT_SIZE + spec_total;

    let mut buf = vec![0u8; total];
    let mut hdr = DmIoctl::new(name)?;
    hdr.data_size = total as u32;
    hdr.target_count = 1;
    if readonly {
        hdr.flags = DM_READONLY_FLAG;
    }
    // SAFETY: DmIoctl is repr(C) POD of exactly DM_IOCTL_STRUCT_SIZE bytes.
    let hdr_bytes = unsafe {
        std::slice::from_raw_parts(&hdr as *const DmIoctl as *const u8, DM_IOCTL_STRUCT_SIZE)
    };
    buf[..DM_IOCTL_STRUCT_SIZE].copy_from_slice(hdr_bytes);

    let mut spec = DmTargetSpec {
        sector_start: 0,
        length: sectors,
        status: 0,
        next: spec_total as u32,
        target_type: [0; 16],
    };
    spec.target_type[..target_type.len()].copy_from_slice(target_type.as_bytes());
    // SAFETY: DmTargetSpec is repr(C) POD of exactly DM_TARGET_SPEC_SIZE bytes.
    let spec_bytes = unsafe {
        std::slice::from_raw_parts(&spec as *const DmTargetSpec as *const u8, DM_TARGET_SPEC_SIZE)
    };
    buf[DM_IOCTL_STRUCT_SIZE..DM_IOCTL_STRUCT_SIZE + DM_TARGET_SPEC_SIZE]
        .copy_from_slice(spec_bytes);
    let params_off = DM_IOCTL_STRUCT_SIZE + DM_TARGET_SPEC_SIZE;
    buf[params_off..params_off + params.len()].copy_from_slice(params.as_bytes());

    let ctl = control_fd()?;
    // SAFETY: buf holds a dm_ioctl header followed by one target spec; the
    // header's data_size covers the whole buffer.
    let rc = unsafe { libc::ioctl(ctl.as_raw_fd(), dm_request(DM_TABLE_LOAD_CMD), buf.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::kernel_last("DM_TABLE_LOAD"));
    }
    debug!("dm table loaded for {} ({} sectors {})", name, sectors, target_type);
    Ok(())
}

/// Resume (activate) a device whose table was loaded.
pub fn resume(name: &str) -> Result<()> {
    // DEV_SUSPEND without the suspend flag resumes
    dm_ioctl_plain(DM_DEV_SUSPEND_CMD, name, 0)?;
    debug!("dm device {} resumed", name);
    Ok(())
}

pub fn remove(name: &str) -> Result<()> {
    dm_ioctl_plain(DM_DEV_REMOVE_CMD, name, 0)?;
    debug!("dm device {} removed", name);
    Ok(())
}

pub fn dev_path(name: &str) -> PathBuf {
    PathBuf::from("/dev/mapper").join(name)
}

/// Verity target parameter string (version 1, 4K blocks).
pub fn verity_params(data_dev: &str, hash_dev: &str, blocks: u64, root_hash: &str) -> String {
    format!(
        "1 {} {} 4096 4096 {} 1 sha256 {} -",
        data_dev, hash_dev, blocks, root_hash
    )
}

/// Crypt target parameter string (aes-xts, key in hex).
pub fn crypt_params(dev: &str, key: &[u8]) -> String {
    let hex: String = key.iter().map(|b| format!("{:02x}", b)).collect();
    format!("aes-xts-plain64 {} 0 {} 0", hex, dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_abi() {
        assert_eq!(std::mem::size_of::<DmIoctl>(), DM_IOCTL_STRUCT_SIZE);
        assert_eq!(std::mem::size_of::<DmTargetSpec>(), DM_TARGET_SPEC_SIZE);
    }

    #[test]
    fn request_encoding() {
        // _IOWR(0xfd, 3, 312-byte struct)
        assert_eq!(dm_request(3) as u64, (3 << 30) | (312 << 16) | (0xfd << 8) | 3);
    }

    #[test]
    fn param_strings() {
        assert_eq!(
            verity_params("/dev/loop0", "/dev/loop1", 1024, "abcd"),
            "1 /dev/loop0 /dev/loop1 4096 4096 1024 1 sha256 abcd -"
        );
        assert_eq!(
            crypt_params("/dev/loop2", &[0xab, 0xcd]),
            "aes-xts-plain64 abcd 0 /dev/loop2 0"
        );
    }
}
