/// Cgroup v1 backend: one directory per controller, freezer and devices
/// controllers included.
use crate::compartment::Compartment;
use crate::types::{Error, Result};
use log::{debug, warn};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};

use super::CgroupBackend;

const CONTROLLERS: &[&str] = &["memory", "pids", "freezer", "devices", "cpu"];
const GROUP_PREFIX: &str = "compartmentd";

pub struct CgroupV1 {
    root: PathBuf,
}

impl CgroupV1 {
    pub fn new(root: &Path) -> CgroupV1 {
        CgroupV1 {
            root: root.to_path_buf(),
        }
    }

    fn group_dir(&self, controller: &str, c: &Compartment) -> PathBuf {
        self.root.join(controller).join(GROUP_PREFIX).join(c.name())
    }

    fn write(&self, controller: &str, c: &Compartment, file: &str, value: &str) -> Result<()> {
        let path = self.group_dir(controller, c).join(file);
        fs::write(&path, value).map_err(|e| Error::Kernel {
            op: format!("write {}", path.display()),
            errno: e.raw_os_error().unwrap_or(0),
        })
    }

    fn controller_present(&self, controller: &str) -> bool {
        self.root.join(controller).exists()
    }
}

impl CgroupBackend for CgroupV1 {
    fn backend_name(&self) -> &'static str {
        "cgroup-v1"
    }

    fn create(&self, c: &Compartment) -> Result<()> {
        for controller in CONTROLLERS {
            if !self.controller_present(controller) {
                debug!("cgroup v1 controller {} not mounted, skipping", controller);
                continue;
            }
            fs::create_dir_all(self.group_dir(controller, c))?;
        }
        Ok(())
    }

    fn remove(&self, c: &Compartment) -> Result<()> {
        for controller in CONTROLLERS {
            let dir = self.group_dir(controller, c);
            if dir.exists() {
                // empty cgroup dirs are removed with rmdir semantics
                if let Err(e) = fs::remove_dir(&dir) {
                    warn!("cgroup removal of {} failed: {}", dir.display(), e);
                }
            }
        }
        Ok(())
    }

    fn attach(&self, c: &Compartment, pid: Pid) -> Result<()> {
        for controller in CONTROLLERS {
            if self.group_dir(controller, c).exists() {
                self.write(controller, c, "cgroup.procs", &format!("{}\n", pid))?;
            }
        }
        Ok(())
    }

    fn set_memory_limit(&self, c: &Compartment, bytes: u64) -> Result<()> {
        if !self.controller_present("memory") {
            warn!("memory controller unavailable, limit not enforced");
            return Ok(());
        }
        self.write("memory", c, "memory.limit_in_bytes", &bytes.to_string())
    }

    fn set_pid_limit(&self, c: &Compartment, limit: u32) -> Result<()> {
        if !self.controller_present("pids") {
            warn!("pids controller unavailable, limit not enforced");
            return Ok(());
        }
        self.write("pids", c, "pids.max", &limit.to_string())
    }

    fn freeze(&self, c: &Compartment) -> Result<()> {
        self.write("freezer", c, "freezer.state", "FROZEN\n")
    }

    fn thaw(&self, c: &Compartment) -> Result<()> {
        self.write("freezer", c, "freezer.state", "THAWED\n")
    }

    fn is_frozen(&self, c: &Compartment) -> Result<bool> {
        let path = self.group_dir("freezer", c).join("freezer.state");
        let state = fs::read_to_string(path)?;
        Ok(state.trim() == "FROZEN")
    }

    fn device_allow(
        &self,
        c: &Compartment,
        kind: char,
        major: u32,
        minor: Option<u32>,
        access: &str,
    ) -> Result<()> {
        let minor = minor.map(|m| m.to_string()).unwrap_or_else(|| "*".to_string());
        self.write(
            "devices",
            c,
            "devices.allow",
            &format!("{} {}:{} {}\n", kind, major, minor, access),
        )
    }

    fn device_deny(&self, c: &Compartment, kind: char, major: u32, minor: u32) -> Result<()> {
        self.write(
            "devices",
            c,
            "devices.deny",
            &format!("{} {}:{} rwm\n", kind, major, minor),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::config::CompartmentConfig;
    use uuid::Uuid;

    fn fake_v1_root() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for controller in CONTROLLERS {
            fs::create_dir_all(tmp.path().join(controller)).unwrap();
        }
        tmp
    }

    #[test]
    fn create_attach_freeze_remove() {
        let tmp = fake_v1_root();
        let backend = CgroupV1::new(tmp.path());
        let c = crate::compartment::Compartment::new(
            Uuid::new_v4(),
            CompartmentConfig::management("c1"),
            0,
        );

        backend.create(&c).unwrap();
        assert!(tmp.path().join("freezer/compartmentd/c1").exists());

        backend.freeze(&c).unwrap();
        assert!(backend.is_frozen(&c).unwrap());
        backend.thaw(&c).unwrap();
        assert!(!backend.is_frozen(&c).unwrap());

        backend
            .device_allow(&c, 'c', 189, Some(3), "rw")
            .unwrap();
        let allow = fs::read_to_string(tmp.path().join("devices/compartmentd/c1/devices.allow")).unwrap();
        assert_eq!(allow, "c 189:3 rw\n");

        backend.device_deny(&c, 'c', 189, 3).unwrap();
        let deny = fs::read_to_string(tmp.path().join("devices/compartmentd/c1/devices.deny")).unwrap();
        assert_eq!(deny, "c 189:3 rwm\n");

        backend.remove(&c).unwrap();
        assert!(!tmp.path().join("freezer/compartmentd/c1").exists());
    }
}
