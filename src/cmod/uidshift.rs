/// Rootfs ownership remapping into the compartment's allocated uid range.
///
/// Two mutually exclusive strategies: the default walks the tree and adds
/// the range offset to every inode's owner; the `idmapped-mounts` feature
/// instead attaches an id-mapped mount of the rootfs, leaving the backing
/// tree untouched.
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::lifecycle::module::{CModule, HookOutcome, Phase};
use crate::types::{Error, Result};
use log::debug;
use std::path::Path;
use std::rc::Rc;

pub struct UidShiftModule;

#[cfg(not(feature = "idmapped-mounts"))]
fn shift_tree(root: &Path, offset: u32) -> Result<()> {
    fn chown_one(path: &Path, offset: u32) -> Result<()> {
        let meta = std::fs::symlink_metadata(path)?;
        use std::os::unix::fs::MetadataExt;
        let uid = meta.uid() + offset;
        let gid = meta.gid() + offset;
        let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::ConfigInvalid("path contains NUL".to_string()))?;
        // SAFETY: valid NUL-terminated path; lchown does not follow links.
        let rc = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
        if rc != 0 {
            return Err(Error::kernel_last("lchown"));
        }
        Ok(())
    }

    fn walk(dir: &Path, offset: u32) -> Result<()> {
        chown_one(dir, offset)?;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                walk(&path, offset)?;
            } else {
                chown_one(&path, offset)?;
            }
        }
        Ok(())
    }

    walk(root, offset)
}

#[cfg(feature = "idmapped-mounts")]
fn shift_tree(root: &Path, c: &Compartment) -> Result<()> {
    use std::os::fd::AsRawFd;

    const SYS_OPEN_TREE: libc::c_long = 428;
    const SYS_MOVE_MOUNT: libc::c_long = 429;
    const SYS_MOUNT_SETATTR: libc::c_long = 442;
    const OPEN_TREE_CLONE: libc::c_uint = 1;
    const AT_RECURSIVE: libc::c_uint = 0x8000;
    const MOUNT_ATTR_IDMAP: u64 = 0x0010_0000;
    const MOVE_MOUNT_F_EMPTY_PATH: libc::c_uint = 0x4;

    #[repr(C)]
    struct MountAttr {
        attr_set: u64,
        attr_clr: u64,
        propagation: u64,
        userns_fd: u64,
    }

    let pid = c
        .pid()
        .ok_or_else(|| Error::Internal("idmapped mount without child".to_string()))?;
    let userns = std::fs::File::open(format!("/proc/{}/ns/user", pid))?;
    let croot = std::ffi::CString::new(root.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::ConfigInvalid("path contains NUL".to_string()))?;

    // SAFETY: valid path and flags; returns a new mount fd.
    let tree_fd = unsafe {
        libc::syscall(
            SYS_OPEN_TREE,
            libc::AT_FDCWD,
            croot.as_ptr(),
            OPEN_TREE_CLONE | AT_RECURSIVE,
        )
    };
    if tree_fd < 0 {
        return Err(Error::kernel_last("open_tree"));
    }
    let attr = MountAttr {
        attr_set: MOUNT_ATTR_IDMAP,
        attr_clr: 0,
        propagation: 0,
        userns_fd: userns.as_raw_fd() as u64,
    };
    let empty = std::ffi::CString::new("").unwrap();
    // SAFETY: tree_fd from open_tree; attr struct matches the kernel ABI.
    let rc = unsafe {
        libc::syscall(
            SYS_MOUNT_SETATTR,
            tree_fd as libc::c_int,
            empty.as_ptr(),
            AT_RECURSIVE | 0x1000, // AT_EMPTY_PATH
            &attr,
            std::mem::size_of::<MountAttr>(),
        )
    };
    if rc != 0 {
        // SAFETY: closing the tree fd we own.
        unsafe { libc::close(tree_fd as libc::c_int) };
        return Err(Error::kernel_last("mount_setattr"));
    }
    // Replace the original rootfs mount with the id-mapped clone.
    // SAFETY: fds and paths as documented for move_mount(2).
    let rc = unsafe {
        libc::syscall(
            SYS_MOVE_MOUNT,
            tree_fd as libc::c_int,
            empty.as_ptr(),
            libc::AT_FDCWD,
            croot.as_ptr(),
            MOVE_MOUNT_F_EMPTY_PATH,
        )
    };
    // SAFETY: closing the tree fd we own.
    unsafe { libc::close(tree_fd as libc::c_int) };
    if rc != 0 {
        return Err(Error::kernel_last("move_mount"));
    }
    Ok(())
}

impl CModule for UidShiftModule {
    fn name(&self) -> &'static str {
        "uidshift"
    }

    fn hook(
        &self,
        phase: Phase,
        ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        _slot: usize,
    ) -> Result<HookOutcome> {
        if phase != Phase::StartPreExec {
            return Ok(HookOutcome::Done);
        }
        let Some((start, _size)) = c.uid_range() else {
            return Ok(HookOutcome::Done);
        };
        let rootfs = ctx.cfg.run_dir.join(c.uuid().to_string()).join("rootfs");
        if !rootfs.exists() || c.config().volumes.is_empty() {
            return Ok(HookOutcome::Done);
        }
        #[cfg(not(feature = "idmapped-mounts"))]
        {
            debug!("compartment {}: shifting rootfs ownership by {}", c.name(), start);
            shift_tree(&rootfs, start)?;
        }
        #[cfg(feature = "idmapped-mounts")]
        {
            debug!("compartment {}: attaching idmapped rootfs mount", c.name());
            let _ = start;
            shift_tree(&rootfs, c)?;
        }
        Ok(HookOutcome::Done)
    }
}
