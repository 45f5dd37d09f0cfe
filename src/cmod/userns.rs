/// User-namespace mapping module.
///
/// Allocates a contiguous uid/gid range per compartment from a daemon-wide
/// pool and writes the child's uid_map/gid_map once it exists. Runs before
/// the volumes module so ownership shifting can rely on the allocation.
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::lifecycle::module::{CModule, HookOutcome, Phase};
use crate::types::{Error, Result};
use log::{debug, warn};
use std::rc::Rc;

/// A contiguous uid/gid block leased from the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UidRange {
    pub start: u32,
    pub size: u32,
    slot: usize,
}

/// Fixed-slot allocator: slot `i` covers `base + i * 65536`. Exhaustion is
/// a `ResourceBusy`, surfaced to the failing start.
pub struct UidAllocator {
    base: u32,
    used: Vec<bool>,
}

const SLOT_SPAN: u32 = 65536;

impl UidAllocator {
    pub fn new(base: u32, slots: u32) -> UidAllocator {
        UidAllocator {
            base,
            used: vec![false; slots as usize],
        }
    }

    pub fn alloc(&mut self, size: u32) -> Result<UidRange> {
        if size == 0 || size > SLOT_SPAN {
            return Err(Error::ConfigInvalid(format!(
                "uid range size {} out of bounds",
                size
            )));
        }
        for (slot, used) in self.used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(UidRange {
                    start: self.base + slot as u32 * SLOT_SPAN,
                    size,
                    slot,
                });
            }
        }
        Err(Error::ResourceBusy("uid range pool exhausted".to_string()))
    }

    pub fn free(&mut self, range: UidRange) {
        if let Some(used) = self.used.get_mut(range.slot) {
            *used = false;
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }
}

pub struct UsernsModule;

impl UsernsModule {
    fn write_maps(c: &Compartment, range: UidRange) -> Result<()> {
        let pid = c
            .pid()
            .ok_or_else(|| Error::Internal("uid map write without child".to_string()))?;
        let map = format!("0 {} {}\n", range.start, range.size);
        // Deny setgroups first so the gid map is writable without
        // CAP_SETGID inside the namespace.
        std::fs::write(format!("/proc/{}/setgroups", pid), "deny\n")?;
        std::fs::write(format!("/proc/{}/uid_map", pid), &map)?;
        std::fs::write(format!("/proc/{}/gid_map", pid), &map)?;
        debug!("wrote uid/gid map for pid {}: {}", pid, map.trim());
        Ok(())
    }
}

impl CModule for UsernsModule {
    fn name(&self) -> &'static str {
        "userns"
    }

    fn hook(
        &self,
        phase: Phase,
        ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        slot: usize,
    ) -> Result<HookOutcome> {
        match phase {
            Phase::ClonePrep => {
                let size = c.config().uid_range_size;
                if size == 0 {
                    return Ok(HookOutcome::Done);
                }
                let range = ctx.uids.borrow_mut().alloc(size)?;
                debug!(
                    "compartment {}: allocated uid range {}+{}",
                    c.name(),
                    range.start,
                    range.size
                );
                c.set_uid_range(Some((range.start, range.size)));
                c.set_slot(slot, range);
                Ok(HookOutcome::Done)
            }
            Phase::PostClone => {
                if let Some(range) = c.with_slot::<UidRange, UidRange>(slot, |r| *r) {
                    Self::write_maps(c, range)?;
                }
                Ok(HookOutcome::Done)
            }
            _ => Ok(HookOutcome::Done),
        }
    }

    fn cleanup(&self, ctx: &Rc<Context>, c: &Rc<Compartment>, slot: usize) {
        c.set_uid_range(None);
        if let Some(range) = c.take_slot::<UidRange>(slot) {
            ctx.uids.borrow_mut().free(*range);
            debug!(
                "compartment {}: released uid range {}+{}",
                c.name(),
                range.start,
                range.size
            );
        } else if c.config().uid_range_size > 0 {
            warn!("compartment {}: no uid range to release", c.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_cycle() {
        let mut alloc = UidAllocator::new(100_000, 2);
        let a = alloc.alloc(65536).unwrap();
        let b = alloc.alloc(65536).unwrap();
        assert_eq!(a.start, 100_000);
        assert_eq!(b.start, 100_000 + 65536);
        assert!(matches!(
            alloc.alloc(65536).unwrap_err(),
            Error::ResourceBusy(_)
        ));
        alloc.free(a);
        let c = alloc.alloc(1000).unwrap();
        assert_eq!(c.start, 100_000);
        assert_eq!(c.size, 1000);
    }

    #[test]
    fn rejects_oversized_ranges() {
        let mut alloc = UidAllocator::new(100_000, 2);
        assert!(alloc.alloc(0).is_err());
        assert!(alloc.alloc(65537).is_err());
    }
}
