/// Compartment subsystem module interface.
///
/// Each module participates in the lifecycle phases through the uniform
/// hook trait below; the registry's insertion order is the authoritative
/// dependency order (uid mapping before volumes, volumes before network,
/// cgroups before capabilities). Unimplemented hooks default to no-ops.
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::types::Result;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Parent-side lifecycle phases, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Precheck,
    /// Crash recovery: tear down leftovers of a previous run before the
    /// fresh start begins.
    StopClean,
    SetupEarly,
    ClonePrep,
    PostClone,
    /// Child is blocked on the go-pipe while this runs.
    StartPreExec,
    StartPostExec,
    StartChildEarly,
    /// Runs when the child has signaled readiness.
    StartComplete,
}

/// Phases executed inside the forked child, before exec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildPhase {
    /// First thing in the child, namespaces already unshared.
    ClonePostInChild,
    /// After the parent released the go-pipe.
    StartPreExecChild,
}

/// Result of a forward hook.
pub enum HookOutcome {
    Done,
    /// Suspend the phase; the engine parks the compartment on this fd and
    /// re-invokes the same hook when it becomes readable.
    Pending(RawFd),
}

/// A compartment subsystem module. `slot` is the module's index in the
/// registry and addresses its private state slot on the compartment.
#[allow(unused_variables)]
pub trait CModule {
    fn name(&self) -> &'static str;

    /// Forward hook for a parent-side phase.
    fn hook(
        &self,
        phase: Phase,
        ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        slot: usize,
    ) -> Result<HookOutcome> {
        Ok(HookOutcome::Done)
    }

    /// Child-side hook; runs in the forked child. Errors abort the child.
    fn child_hook(
        &self,
        phase: ChildPhase,
        ctx: &Context,
        c: &Compartment,
        slot: usize,
    ) -> Result<()> {
        Ok(())
    }

    /// Stop-time hook, invoked in reverse registration order while the
    /// compartment is shutting down.
    fn stop(&self, ctx: &Rc<Context>, c: &Rc<Compartment>, slot: usize) -> Result<()> {
        Ok(())
    }

    /// Release everything this module acquired during the current attempt.
    /// Must be total: failures are logged inside, never propagated.
    fn cleanup(&self, ctx: &Rc<Context>, c: &Rc<Compartment>, slot: usize) {}
}

/// Ordered module list. Registered once at daemon start; the order encodes
/// subsystem dependencies and is never mutated afterwards.
pub struct ModuleRegistry {
    modules: Vec<Box<dyn CModule>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry { modules: Vec::new() }
    }

    pub fn register(&mut self, module: Box<dyn CModule>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn get(&self, idx: usize) -> &dyn CModule {
        self.modules[idx].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &dyn CModule)> {
        self.modules.iter().enumerate().map(|(i, m)| (i, m.as_ref()))
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
