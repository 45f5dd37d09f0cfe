/// Persisted per-compartment state.
///
/// Layout under the data directory, one subdirectory per compartment UUID:
///   config.json   configuration snapshot
///   state.json    last-known desired state, for restart-after-reboot
///   key.wrapped   wrapped per-compartment key material
///   pid           pidfile while the child is alive
///   images/       rootfs artifacts
use crate::compartment::config::CompartmentConfig;
use crate::types::{Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateRecord {
    pub desired: DesiredState,
    pub updated_at: DateTime<Utc>,
}

pub struct Store {
    base: PathBuf,
}

/// Atomically write content to a file: write to temp, fsync, rename, fsync
/// parent dir. Prevents data loss on crash.
fn atomic_write(target: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent dir"))?;

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        target.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));

    {
        let mut f = fs::File::create(&temp_path)?;
        f.write_all(content)?;
        f.sync_all()?;
    }
    fs::rename(&temp_path, target)?;
    fs::File::open(parent)?.sync_all()?;
    Ok(())
}

impl Store {
    pub fn open(base: impl Into<PathBuf>) -> Result<Store> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Store { base })
    }

    pub fn compartment_dir(&self, uuid: Uuid) -> PathBuf {
        self.base.join(uuid.to_string())
    }

    pub fn images_dir(&self, uuid: Uuid) -> PathBuf {
        self.compartment_dir(uuid).join("images")
    }

    pub fn wrapped_key_path(&self, uuid: Uuid) -> PathBuf {
        self.compartment_dir(uuid).join("key.wrapped")
    }

    /// Persist the configuration snapshot; creates the compartment dir on
    /// first use.
    pub fn save_config(&self, uuid: Uuid, config: &CompartmentConfig) -> Result<()> {
        let dir = self.compartment_dir(uuid);
        fs::create_dir_all(dir.join("images"))?;
        let json = serde_json::to_vec_pretty(config)?;
        atomic_write(&dir.join("config.json"), &json)?;
        debug!("persisted configuration for {} ({})", config.name, uuid);
        Ok(())
    }

    pub fn set_desired(&self, uuid: Uuid, desired: DesiredState) -> Result<()> {
        let record = StateRecord {
            desired,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec(&record)?;
        atomic_write(&self.compartment_dir(uuid).join("state.json"), &json)?;
        Ok(())
    }

    pub fn desired(&self, uuid: Uuid) -> Option<DesiredState> {
        let data = fs::read(self.compartment_dir(uuid).join("state.json")).ok()?;
        let record: StateRecord = serde_json::from_slice(&data).ok()?;
        Some(record.desired)
    }

    pub fn write_pidfile(&self, uuid: Uuid, pid: Pid) -> Result<()> {
        atomic_write(
            &self.compartment_dir(uuid).join("pid"),
            format!("{}\n", pid).as_bytes(),
        )?;
        Ok(())
    }

    pub fn clear_pidfile(&self, uuid: Uuid) {
        let path = self.compartment_dir(uuid).join("pid");
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove pidfile {}: {}", path.display(), e);
            }
        }
    }

    /// Enumerate persisted compartments, skipping unreadable entries.
    pub fn load_all(&self) -> Result<Vec<(Uuid, CompartmentConfig, Option<DesiredState>)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let Ok(uuid) = Uuid::parse_str(&name) else {
                continue;
            };
            let config_path = entry.path().join("config.json");
            let config: CompartmentConfig = match fs::read(&config_path)
                .map_err(Error::from)
                .and_then(|d| serde_json::from_slice(&d).map_err(Error::from))
            {
                Ok(c) => c,
                Err(e) => {
                    warn!("skipping {}: unreadable config: {}", name, e);
                    continue;
                }
            };
            out.push((uuid, config, self.desired(uuid)));
        }
        Ok(out)
    }

    /// Remove a compartment's persisted state entirely.
    pub fn remove(&self, uuid: Uuid) -> Result<()> {
        let dir = self.compartment_dir(uuid);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_state_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let uuid = Uuid::new_v4();
        let config = CompartmentConfig::management("c1");

        store.save_config(uuid, &config).unwrap();
        store.set_desired(uuid, DesiredState::Running).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        let (loaded_uuid, loaded_config, desired) = &all[0];
        assert_eq!(*loaded_uuid, uuid);
        assert_eq!(loaded_config.name, "c1");
        assert_eq!(*desired, Some(DesiredState::Running));
    }

    #[test]
    fn pidfile_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let uuid = Uuid::new_v4();
        store.save_config(uuid, &CompartmentConfig::management("c2")).unwrap();
        store.write_pidfile(uuid, Pid::from_raw(4242)).unwrap();
        let content = fs::read_to_string(store.compartment_dir(uuid).join("pid")).unwrap();
        assert_eq!(content.trim(), "4242");
        store.clear_pidfile(uuid);
        assert!(!store.compartment_dir(uuid).join("pid").exists());
        // clearing twice is fine
        store.clear_pidfile(uuid);
    }

    #[test]
    fn unreadable_entries_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let uuid = Uuid::new_v4();
        fs::create_dir_all(tmp.path().join(uuid.to_string())).unwrap();
        fs::write(tmp.path().join(uuid.to_string()).join("config.json"), b"{garbage").unwrap();
        fs::create_dir_all(tmp.path().join("not-a-uuid")).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
