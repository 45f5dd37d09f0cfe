/// Volumes module: root filesystem assembly.
///
/// The mount plan is computed before the clone so the child's copy of the
/// module slot already contains it; the parent then performs the
/// kernel-global preparations (loop attach, dm-verity, dm-crypt) while the
/// child is blocked, and the child executes the plan and pivots into the
/// new root before exec. Every acquisition is recorded in the slot and
/// released in reverse order on cleanup.
pub mod dm;
pub mod loopdev;

use crate::compartment::config::{VolumeConfig, VolumeKind};
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::lifecycle::module::{CModule, ChildPhase, HookOutcome, Phase};
use crate::types::{Error, Result};
use log::{debug, warn};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::pivot_root;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use loopdev::LoopDevice;

#[derive(Clone, Debug)]
pub struct MountStep {
    pub source: Option<PathBuf>,
    /// Relative to the compartment rootfs.
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

/// Per-compartment volume state. The plan part is fixed before the clone;
/// the acquisition lists only ever grow in the parent.
pub struct VolumesState {
    pub rootfs: PathBuf,
    pub plan: Vec<MountStep>,
    loops: Vec<LoopDevice>,
    dm_names: Vec<String>,
    /// Volumes whose device must be prepared once the key is available.
    deferred: Vec<(VolumeConfig, PathBuf)>,
}

fn dm_name(c: &Compartment, label: &str) -> String {
    format!("cmpt-{}-{}", c.name(), label)
}

fn image_sectors(image: &Path) -> Result<u64> {
    let len = std::fs::metadata(image)?.len();
    Ok(len / 512)
}

pub struct VolumesModule;

impl VolumesModule {
    /// Build the mount plan and attach loop devices whose paths the plan
    /// needs. Runs pre-clone.
    fn prepare(ctx: &Rc<Context>, c: &Rc<Compartment>) -> Result<VolumesState> {
        let rootfs = ctx.cfg.run_dir.join(c.uuid().to_string()).join("rootfs");
        std::fs::create_dir_all(&rootfs)?;

        let mut state = VolumesState {
            rootfs,
            plan: Vec::new(),
            loops: Vec::new(),
            dm_names: Vec::new(),
            deferred: Vec::new(),
        };
        // release partial acquisitions (attached loops) on any error so a
        // failed plan leaves nothing behind
        if let Err(e) = Self::fill_plan(ctx, c, &mut state) {
            Self::release(&mut state);
            return Err(e);
        }
        Ok(state)
    }

    fn fill_plan(ctx: &Rc<Context>, c: &Rc<Compartment>, state: &mut VolumesState) -> Result<()> {
        let rootfs = state.rootfs.clone();
        let images = ctx.store.images_dir(c.uuid());
        let config = c.config();
        for vol in &config.volumes {
            match &vol.kind {
                VolumeKind::Tmpfs { size_mb } => {
                    state.plan.push(MountStep {
                        source: None,
                        target: vol.mount_point.clone(),
                        fstype: Some("tmpfs".to_string()),
                        flags: MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
                        data: Some(format!("size={}m", size_mb)),
                    });
                }
                VolumeKind::Bind { source } => {
                    state.plan.push(MountStep {
                        source: Some(source.clone()),
                        target: vol.mount_point.clone(),
                        fstype: None,
                        flags: MsFlags::MS_BIND,
                        data: None,
                    });
                }
                VolumeKind::Image { verity_hash } => {
                    let image = images.join(vol.image.as_ref().ok_or_else(|| {
                        Error::ConfigInvalid(format!("volume '{}' without image", vol.label))
                    })?);
                    if !image.exists() {
                        return Err(Error::PreconditionFailed(format!(
                            "image {} missing",
                            image.display()
                        )));
                    }
                    let lo = loopdev::attach(&image)?;
                    let source = match verity_hash {
                        Some(_) => {
                            // the dm device is created post-unlock; the path
                            // is deterministic so the plan can carry it now
                            let name = dm_name(c, &vol.label);
                            let path = dm::dev_path(&name);
                            state.deferred.push((vol.clone(), lo.path.clone()));
                            path
                        }
                        None => lo.path.clone(),
                    };
                    state.loops.push(lo);
                    state.plan.push(MountStep {
                        source: Some(source),
                        target: vol.mount_point.clone(),
                        fstype: Some(vol.fs_type.clone()),
                        flags: MsFlags::MS_RDONLY | MsFlags::MS_NODEV,
                        data: None,
                    });
                }
                VolumeKind::Encrypted => {
                    let image = images.join(vol.image.as_ref().ok_or_else(|| {
                        Error::ConfigInvalid(format!("volume '{}' without image", vol.label))
                    })?);
                    if !image.exists() {
                        return Err(Error::PreconditionFailed(format!(
                            "image {} missing",
                            image.display()
                        )));
                    }
                    let lo = loopdev::attach(&image)?;
                    let name = dm_name(c, &vol.label);
                    state.deferred.push((vol.clone(), lo.path.clone()));
                    state.loops.push(lo);
                    state.plan.push(MountStep {
                        source: Some(dm::dev_path(&name)),
                        target: vol.mount_point.clone(),
                        fstype: Some(vol.fs_type.clone()),
                        flags: MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
                        data: None,
                    });
                }
                VolumeKind::Overlay => {
                    let upper = ctx.store.compartment_dir(c.uuid()).join("overlay").join(&vol.label);
                    let work = upper.with_extension("work");
                    std::fs::create_dir_all(&upper)?;
                    std::fs::create_dir_all(&work)?;
                    let lower = rootfs.join(&vol.mount_point);
                    state.plan.push(MountStep {
                        source: None,
                        target: vol.mount_point.clone(),
                        fstype: Some("overlay".to_string()),
                        flags: MsFlags::empty(),
                        data: Some(format!(
                            "lowerdir={},upperdir={},workdir={}",
                            lower.display(),
                            upper.display(),
                            work.display()
                        )),
                    });
                }
            }
        }
        Ok(())
    }

    /// Create the deferred dm devices; needs the unlocked key for crypt
    /// volumes. Runs parent-side while the child is blocked.
    fn activate_deferred(c: &Rc<Compartment>, state: &mut VolumesState) -> Result<()> {
        let deferred = std::mem::take(&mut state.deferred);
        for (vol, backing) in deferred {
            let name = dm_name(c, &vol.label);
            let sectors = image_sectors(Path::new(&backing)).unwrap_or(0);
            match &vol.kind {
                VolumeKind::Image {
                    verity_hash: Some(hash),
                } => {
                    dm::create(&name)?;
                    state.dm_names.push(name.clone());
                    let backing = backing.to_string_lossy();
                    let params =
                        dm::verity_params(&backing, &backing, sectors * 512 / 4096, hash);
                    dm::load_table(&name, sectors, "verity", &params, true)?;
                    dm::resume(&name)?;
                }
                VolumeKind::Encrypted => {
                    let key = c.volume_key().ok_or_else(|| {
                        Error::Credential(format!(
                            "volume '{}' needs a key but none was unlocked",
                            vol.label
                        ))
                    })?;
                    dm::create(&name)?;
                    state.dm_names.push(name.clone());
                    let params = dm::crypt_params(&backing.to_string_lossy(), &key);
                    dm::load_table(&name, sectors, "crypt", &params, false)?;
                    dm::resume(&name)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Execute the plan inside the child and pivot into the new root.
    fn apply_in_child(state: &VolumesState) -> Result<()> {
        if state.plan.is_empty() {
            return Ok(());
        }
        let root = &state.rootfs;
        // the new root must be a mount point for pivot_root
        mount(
            Some(root),
            root,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| Error::kernel("bind rootfs", e))?;

        for step in &state.plan {
            let target = root.join(&step.target);
            std::fs::create_dir_all(&target)?;
            mount(
                step.source.as_deref(),
                &target,
                step.fstype.as_deref(),
                step.flags,
                step.data.as_deref(),
            )
            .map_err(|e| Error::kernel(format!("mount {}", target.display()), e))?;
        }

        let old = root.join(".old-root");
        std::fs::create_dir_all(&old)?;
        pivot_root(root, &old).map_err(|e| Error::kernel("pivot_root", e))?;
        nix::unistd::chdir("/").map_err(|e| Error::kernel("chdir", e))?;
        umount2("/.old-root", MntFlags::MNT_DETACH).map_err(|e| Error::kernel("umount old root", e))?;
        let _ = std::fs::remove_dir("/.old-root");
        Ok(())
    }

    fn release(state: &mut VolumesState) {
        for name in state.dm_names.drain(..).rev() {
            if let Err(e) = dm::remove(&name) {
                warn!("dm device {} removal failed: {}", name, e);
            }
        }
        for lo in state.loops.drain(..).rev() {
            if let Err(e) = loopdev::detach(&lo) {
                warn!("loop{} detach failed: {}", lo.index, e);
            }
        }
        if state.rootfs.exists() {
            if let Err(e) = std::fs::remove_dir_all(&state.rootfs) {
                warn!("rootfs removal failed: {}", e);
            }
        }
    }
}

impl CModule for VolumesModule {
    fn name(&self) -> &'static str {
        "volumes"
    }

    fn hook(
        &self,
        phase: Phase,
        ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        slot: usize,
    ) -> Result<HookOutcome> {
        match phase {
            Phase::StopClean => {
                // leftovers of a crashed previous run
                let rootfs = ctx.cfg.run_dir.join(c.uuid().to_string()).join("rootfs");
                if rootfs.exists() {
                    debug!("compartment {}: removing stale rootfs", c.name());
                    let _ = std::fs::remove_dir_all(&rootfs);
                }
                Ok(HookOutcome::Done)
            }
            Phase::SetupEarly => {
                let state = Self::prepare(ctx, c)?;
                c.set_slot(slot, state);
                Ok(HookOutcome::Done)
            }
            Phase::StartPreExec => {
                let mut taken = c.take_slot::<VolumesState>(slot).ok_or_else(|| {
                    Error::Internal("volumes state missing in start_pre_exec".to_string())
                })?;
                let result = Self::activate_deferred(c, &mut taken);
                c.set_slot(slot, *taken);
                result?;
                Ok(HookOutcome::Done)
            }
            _ => Ok(HookOutcome::Done),
        }
    }

    fn child_hook(
        &self,
        phase: ChildPhase,
        _ctx: &Context,
        c: &Compartment,
        slot: usize,
    ) -> Result<()> {
        if phase == ChildPhase::StartPreExecChild {
            c.with_slot::<VolumesState, Result<()>>(slot, |state| Self::apply_in_child(state))
                .unwrap_or(Ok(()))?;
        }
        Ok(())
    }

    fn cleanup(&self, _ctx: &Rc<Context>, c: &Rc<Compartment>, slot: usize) {
        if let Some(mut state) = c.take_slot::<VolumesState>(slot) {
            Self::release(&mut state);
        }
    }
}
