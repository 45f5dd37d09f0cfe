/// Uevent forwarding module: re-injects device uevents that match a
/// running compartment's allowed-device rules into that compartment's net
/// namespace, so its own device manager sees them.
use crate::compartment::config::DeviceRule;
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::lifecycle::module::{CModule, HookOutcome, Phase};
use crate::types::Result;
use crate::uevent::{Uevent, UeventAction};
use log::{debug, warn};
use std::cell::Cell;
use std::rc::Rc;

fn rule_matches(rule: &DeviceRule, major: i32, minor: i32) -> bool {
    if major < 0 {
        return false;
    }
    rule.major == major as u32
        && match rule.minor {
            Some(m) => minor >= 0 && m == minor as u32,
            None => true,
        }
}

fn wants_event(c: &Compartment, event: &Uevent) -> bool {
    if !matches!(event.action(), UeventAction::Add | UeventAction::Remove | UeventAction::Change) {
        return false;
    }
    c.config()
        .allowed_devices
        .iter()
        .any(|rule| rule_matches(rule, event.major(), event.minor()))
}

pub struct UeventFwdModule {
    subscribed: Cell<bool>,
}

impl UeventFwdModule {
    pub fn new() -> UeventFwdModule {
        UeventFwdModule {
            subscribed: Cell::new(false),
        }
    }
}

impl Default for UeventFwdModule {
    fn default() -> Self {
        Self::new()
    }
}

impl CModule for UeventFwdModule {
    fn name(&self) -> &'static str {
        "uevent_fwd"
    }

    fn hook(
        &self,
        phase: Phase,
        ctx: &Rc<Context>,
        _c: &Rc<Compartment>,
        _slot: usize,
    ) -> Result<HookOutcome> {
        if phase != Phase::StartComplete || self.subscribed.get() {
            return Ok(HookOutcome::Done);
        }
        // One daemon-wide subscription; per-compartment filtering happens
        // per event against the live compartment list.
        let Some(source) = ctx.uevent_source() else {
            debug!("no uevent source; device forwarding disabled");
            return Ok(HookOutcome::Done);
        };
        let weak = Rc::downgrade(ctx);
        source.subscribe(Rc::new(move |_, event| {
            let Some(ctx) = weak.upgrade() else { return };
            for c in ctx.compartments() {
                if c.state() != crate::types::CompartmentState::Running {
                    continue;
                }
                if !wants_event(&c, event) {
                    continue;
                }
                let Some(pid) = c.pid() else { continue };
                if let Err(e) = event.inject_into_netns(pid, c.has_userns()) {
                    warn!(
                        "compartment {}: uevent forward failed: {}",
                        c.name(),
                        e
                    );
                }
            }
        }));
        self.subscribed.set(true);
        Ok(HookOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matching_honours_wildcard_minor() {
        let exact = DeviceRule {
            kind: 'c',
            major: 189,
            minor: Some(3),
            access: "rw".to_string(),
        };
        let any = DeviceRule {
            kind: 'c',
            major: 189,
            minor: None,
            access: "rw".to_string(),
        };
        assert!(rule_matches(&exact, 189, 3));
        assert!(!rule_matches(&exact, 189, 4));
        assert!(rule_matches(&any, 189, 4));
        assert!(!rule_matches(&any, 190, 4));
        assert!(!rule_matches(&any, -1, -1));
    }
}
