/// Cgroup v2 backend: unified hierarchy, `cgroup.freeze` based freezer.
///
/// Device filtering on pure v2 hosts requires an eBPF device program; when
/// no v1 devices controller is mounted alongside, allow/deny intents are
/// logged but not enforced, matching the daemon's permissive fallback for
/// missing controllers.
use crate::compartment::Compartment;
use crate::types::{Error, Result};
use log::warn;
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};

use super::CgroupBackend;

const GROUP_PREFIX: &str = "compartmentd";

pub struct CgroupV2 {
    root: PathBuf,
}

impl CgroupV2 {
    pub fn new(root: &Path) -> CgroupV2 {
        CgroupV2 {
            root: root.to_path_buf(),
        }
    }

    fn group_dir(&self, c: &Compartment) -> PathBuf {
        self.root.join(GROUP_PREFIX).join(c.name())
    }

    fn write(&self, c: &Compartment, file: &str, value: &str) -> Result<()> {
        let path = self.group_dir(c).join(file);
        fs::write(&path, value).map_err(|e| Error::Kernel {
            op: format!("write {}", path.display()),
            errno: e.raw_os_error().unwrap_or(0),
        })
    }

    /// Legacy devices controller mounted next to the unified hierarchy
    /// (hybrid layout); used for enforcement when present.
    fn hybrid_devices(&self) -> Option<super::v1::CgroupV1> {
        if self.root.join("devices").exists() {
            Some(super::v1::CgroupV1::new(&self.root))
        } else {
            None
        }
    }
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &'static str {
        "cgroup-v2"
    }

    fn create(&self, c: &Compartment) -> Result<()> {
        fs::create_dir_all(self.group_dir(c))?;
        if let Some(devices) = self.hybrid_devices() {
            devices.create(c)?;
        }
        Ok(())
    }

    fn remove(&self, c: &Compartment) -> Result<()> {
        let dir = self.group_dir(c);
        if dir.exists() {
            if let Err(e) = fs::remove_dir(&dir) {
                warn!("cgroup removal of {} failed: {}", dir.display(), e);
            }
        }
        if let Some(devices) = self.hybrid_devices() {
            devices.remove(c)?;
        }
        Ok(())
    }

    fn attach(&self, c: &Compartment, pid: Pid) -> Result<()> {
        self.write(c, "cgroup.procs", &format!("{}\n", pid))?;
        if let Some(devices) = self.hybrid_devices() {
            devices.attach(c, pid)?;
        }
        Ok(())
    }

    fn set_memory_limit(&self, c: &Compartment, bytes: u64) -> Result<()> {
        self.write(c, "memory.max", &bytes.to_string())
    }

    fn set_pid_limit(&self, c: &Compartment, limit: u32) -> Result<()> {
        self.write(c, "pids.max", &limit.to_string())
    }

    fn freeze(&self, c: &Compartment) -> Result<()> {
        self.write(c, "cgroup.freeze", "1")
    }

    fn thaw(&self, c: &Compartment) -> Result<()> {
        self.write(c, "cgroup.freeze", "0")
    }

    fn is_frozen(&self, c: &Compartment) -> Result<bool> {
        let events = fs::read_to_string(self.group_dir(c).join("cgroup.events"))?;
        for line in events.lines() {
            let mut parts = line.split_whitespace();
            if let (Some("frozen"), Some(value)) = (parts.next(), parts.next()) {
                return Ok(value == "1");
            }
        }
        Ok(false)
    }

    fn device_allow(
        &self,
        c: &Compartment,
        kind: char,
        major: u32,
        minor: Option<u32>,
        access: &str,
    ) -> Result<()> {
        match self.hybrid_devices() {
            Some(devices) => devices.device_allow(c, kind, major, minor, access),
            None => {
                warn!(
                    "compartment {}: device allow {} {}:{:?} not enforced (no devices controller on v2)",
                    c.name(),
                    kind,
                    major,
                    minor
                );
                Ok(())
            }
        }
    }

    fn device_deny(&self, c: &Compartment, kind: char, major: u32, minor: u32) -> Result<()> {
        match self.hybrid_devices() {
            Some(devices) => devices.device_deny(c, kind, major, minor),
            None => {
                warn!(
                    "compartment {}: device deny {} {}:{} not enforced (no devices controller on v2)",
                    c.name(),
                    kind,
                    major,
                    minor
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::config::CompartmentConfig;
    use uuid::Uuid;

    #[test]
    fn freeze_state_parses_cgroup_events() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = CgroupV2::new(tmp.path());
        let c = crate::compartment::Compartment::new(
            Uuid::new_v4(),
            CompartmentConfig::management("c2"),
            0,
        );
        backend.create(&c).unwrap();
        fs::write(
            tmp.path().join("compartmentd/c2/cgroup.events"),
            "populated 1\nfrozen 0\n",
        )
        .unwrap();
        assert!(!backend.is_frozen(&c).unwrap());
        fs::write(
            tmp.path().join("compartmentd/c2/cgroup.events"),
            "populated 1\nfrozen 1\n",
        )
        .unwrap();
        assert!(backend.is_frozen(&c).unwrap());
    }

    #[test]
    fn limits_write_unified_files() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = CgroupV2::new(tmp.path());
        let c = crate::compartment::Compartment::new(
            Uuid::new_v4(),
            CompartmentConfig::management("c3"),
            0,
        );
        backend.create(&c).unwrap();
        backend.set_memory_limit(&c, 64 * 1024 * 1024).unwrap();
        backend.set_pid_limit(&c, 100).unwrap();
        assert_eq!(
            fs::read_to_string(tmp.path().join("compartmentd/c3/memory.max")).unwrap(),
            "67108864"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("compartmentd/c3/pids.max")).unwrap(),
            "100"
        );
    }
}
