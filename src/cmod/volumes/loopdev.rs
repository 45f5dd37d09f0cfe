/// Loopback device attachment via /dev/loop-control.
use crate::types::{Error, Result};
use log::debug;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;

#[derive(Clone, Debug)]
pub struct LoopDevice {
    pub path: PathBuf,
    pub index: u32,
}

/// Grab a free loop device and bind it to `image`.
pub fn attach(image: &Path) -> Result<LoopDevice> {
    let ctl = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/loop-control")?;
    // SAFETY: valid fd; LOOP_CTL_GET_FREE takes no argument.
    let index = unsafe { libc::ioctl(ctl.as_raw_fd(), LOOP_CTL_GET_FREE) };
    if index < 0 {
        return Err(Error::kernel_last("LOOP_CTL_GET_FREE"));
    }

    let path = PathBuf::from(format!("/dev/loop{}", index));
    let dev = OpenOptions::new().read(true).write(true).open(&path)?;
    let backing = OpenOptions::new().read(true).write(true).open(image)?;
    // SAFETY: both fds valid; LOOP_SET_FD binds the backing file.
    let rc = unsafe { libc::ioctl(dev.as_raw_fd(), LOOP_SET_FD, backing.as_raw_fd()) };
    if rc != 0 {
        return Err(Error::kernel_last("LOOP_SET_FD"));
    }
    debug!("attached {} to loop{}", image.display(), index);
    Ok(LoopDevice {
        path,
        index: index as u32,
    })
}

/// Release the backing file; the device returns to the free pool.
pub fn detach(dev: &LoopDevice) -> Result<()> {
    let file = OpenOptions::new().read(true).open(&dev.path)?;
    // SAFETY: valid fd; LOOP_CLR_FD takes no argument.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), LOOP_CLR_FD, 0) };
    if rc != 0 {
        return Err(Error::kernel_last("LOOP_CLR_FD"));
    }
    debug!("detached loop{}", dev.index);
    Ok(())
}
