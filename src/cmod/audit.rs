/// Audit module: appends a structured record of every state transition to
/// the compartment's audit log. Registered as a transition observer so it
/// sees exactly what the engine publishes.
use crate::compartment::{Compartment, ObserverHandle};
use crate::daemon::Context;
use crate::lifecycle::module::{CModule, HookOutcome, Phase};
use crate::types::{CompartmentState, Result};
use chrono::Utc;
use log::warn;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Serialize)]
struct AuditRecord<'a> {
    ts: chrono::DateTime<Utc>,
    compartment: &'a str,
    from: CompartmentState,
    to: CompartmentState,
}

fn append_record(path: &PathBuf, record: &AuditRecord<'_>) {
    let line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(e) => {
            warn!("audit record serialization failed: {}", e);
            return;
        }
    };
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{}", line));
    if let Err(e) = result {
        warn!("audit append to {} failed: {}", path.display(), e);
    }
}

struct AuditState {
    observer: ObserverHandle,
}

pub struct AuditModule;

impl CModule for AuditModule {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn hook(
        &self,
        phase: Phase,
        ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        slot: usize,
    ) -> Result<HookOutcome> {
        if phase != Phase::SetupEarly {
            return Ok(HookOutcome::Done);
        }
        let log_path = ctx.store.compartment_dir(c.uuid()).join("audit.log");
        let name = c.name();
        let observer = c.observe(Rc::new(move |comp, old, new| {
            debug_assert_eq!(comp.state(), new);
            append_record(
                &log_path,
                &AuditRecord {
                    ts: Utc::now(),
                    compartment: name.as_str(),
                    from: old,
                    to: new,
                },
            );
        }));
        c.set_slot(slot, AuditState { observer });
        Ok(HookOutcome::Done)
    }

    fn cleanup(&self, ctx: &Rc<Context>, c: &Rc<Compartment>, slot: usize) {
        if let Some(state) = c.take_slot::<AuditState>(slot) {
            c.unobserve(state.observer);
            // the final Stopped transition happens after cleanup; record
            // the teardown itself so the log is complete
            let name = c.name();
            append_record(
                &ctx.store.compartment_dir(c.uuid()).join("audit.log"),
                &AuditRecord {
                    ts: Utc::now(),
                    compartment: name.as_str(),
                    from: c.state(),
                    to: CompartmentState::Stopped,
                },
            );
        }
    }
}
