/// Smartcard module: unlocks per-compartment key material through the
/// credential collaborator before the volumes module needs it.
///
/// The unwrap round-trip suspends `start_pre_exec`: the first hook
/// invocation submits the request and returns `Pending`; the engine parks
/// the compartment on the reply fd and re-invokes the hook, which then
/// consumes the reply. Token attach/detach arriving from the hotplug
/// coordinator run the same round-trip outside the engine, watched
/// directly on the loop.
use crate::compartment::Compartment;
use crate::cred::{CredPending, CredReply, CredRequest};
use crate::daemon::Context;
use crate::event::IoInterest;
use crate::lifecycle::module::{CModule, HookOutcome, Phase};
use crate::types::{Error, Result};
use log::{info, warn};
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Per-compartment token state, living in the module slot.
#[derive(Default)]
pub struct TokenState {
    pending: Option<CredPending>,
    pub unlocked: bool,
    pub attached: bool,
    pub passphrase: Option<String>,
}

pub struct SmartcardModule;

fn read_wrapped_key(ctx: &Context, c: &Compartment) -> Vec<u8> {
    std::fs::read(ctx.store.wrapped_key_path(c.uuid())).unwrap_or_default()
}

impl CModule for SmartcardModule {
    fn name(&self) -> &'static str {
        "smartcard"
    }

    fn hook(
        &self,
        phase: Phase,
        ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        slot: usize,
    ) -> Result<HookOutcome> {
        if phase != Phase::StartPreExec {
            return Ok(HookOutcome::Done);
        }
        if !c.config().token_required {
            return Ok(HookOutcome::Done);
        }

        // Second invocation: the engine re-entered after the reply fd
        // fired.
        let pending = c
            .with_slot::<TokenState, Option<CredPending>>(slot, |s| s.pending.take())
            .flatten();
        if let Some(pending) = pending {
            let reply = pending.complete().map_err(|e| match e {
                Error::Credential(_) => e,
                other => Error::Credential(other.to_string()),
            })?;
            return match reply {
                CredReply::Key(key) => {
                    c.set_volume_key(key);
                    c.with_slot::<TokenState, ()>(slot, |s| s.unlocked = true);
                    info!("compartment {}: key material unlocked", c.name());
                    Ok(HookOutcome::Done)
                }
                CredReply::WrongPassphrase => Err(Error::Credential(format!(
                    "compartment {}: token rejected passphrase",
                    c.name()
                ))),
                CredReply::Error(e) => Err(Error::Credential(e)),
                other => Err(Error::Credential(format!(
                    "unexpected credential reply {:?}",
                    other
                ))),
            };
        }

        // First invocation: submit the unwrap request and suspend. An
        // existing slot (passphrase deposited via attach_token) is kept.
        let wrapped = read_wrapped_key(ctx, c);
        let pending = ctx.cred.submit(&CredRequest::UnwrapKey {
            uuid: c.uuid(),
            wrapped,
        })?;
        let fd: RawFd = pending.fd();
        let mut holder = Some(pending);
        if c
            .with_slot::<TokenState, ()>(slot, |s| s.pending = holder.take())
            .is_none()
        {
            let mut state = TokenState::default();
            state.pending = holder.take();
            c.set_slot(slot, state);
        }
        Ok(HookOutcome::Pending(fd))
    }

    fn cleanup(&self, _ctx: &Rc<Context>, c: &Rc<Compartment>, slot: usize) {
        // drop any half-finished round-trip and the unlocked key
        c.take_slot::<TokenState>(slot);
    }
}

/// Registry index of the smartcard module.
fn slot_of(ctx: &Context) -> Option<usize> {
    ctx.registry
        .iter()
        .find(|(_, m)| m.name() == "smartcard")
        .map(|(i, _)| i)
}

/// Store the passphrase used for subsequent token attach operations.
pub fn set_passphrase(ctx: &Rc<Context>, c: &Rc<Compartment>, passphrase: String) {
    if let Some(slot) = slot_of(ctx) {
        if c.with_slot::<TokenState, ()>(slot, |s| s.passphrase = Some(passphrase.clone()))
            .is_none()
        {
            let state = TokenState {
                passphrase: Some(passphrase),
                ..Default::default()
            };
            c.set_slot(slot, state);
        }
    }
}

/// Token plugged in (hotplug): unlock it for the owning compartment.
pub fn token_attach(ctx: &Rc<Context>, c: &Rc<Compartment>) {
    let Some(slot) = slot_of(ctx) else { return };
    let passphrase = c
        .with_slot::<TokenState, Option<String>>(slot, |s| s.passphrase.clone())
        .flatten()
        .unwrap_or_default();
    let request = CredRequest::TokenUnlock {
        uuid: c.uuid(),
        passphrase,
    };
    let pending = match ctx.cred.submit(&request) {
        Ok(p) => p,
        Err(e) => {
            warn!("compartment {}: token attach failed: {}", c.name(), e);
            return;
        }
    };
    let fd = pending.fd();
    let holder = Rc::new(RefCell::new(Some(pending)));
    let handle_cell: Rc<std::cell::Cell<Option<crate::event::IoHandle>>> =
        Rc::new(std::cell::Cell::new(None));
    let handle_for_cb = handle_cell.clone();
    let weak = Rc::downgrade(ctx);
    let uuid = c.uuid();
    let handle = ctx.ev.add_io(
        fd,
        IoInterest::Read,
        Box::new(move |ev, _, _| {
            // one-shot: drop the watch before handling the reply
            if let Some(handle) = handle_for_cb.get() {
                ev.remove_io(handle);
            }
            let Some(pending) = holder.borrow_mut().take() else {
                return;
            };
            let Some(ctx) = weak.upgrade() else { return };
            let Some(c) = ctx.by_uuid(uuid) else { return };
            match pending.complete() {
                Ok(CredReply::Ok) => {
                    if let Some(slot) = slot_of(&ctx) {
                        c.with_slot::<TokenState, ()>(slot, |s| s.attached = true);
                    }
                    info!("compartment {}: token attached", c.name());
                }
                Ok(CredReply::WrongPassphrase) => {
                    warn!("compartment {}: token attach: wrong passphrase", c.name());
                }
                Ok(other) => {
                    warn!(
                        "compartment {}: token attach: unexpected reply {:?}",
                        c.name(),
                        other
                    );
                }
                Err(e) => warn!("compartment {}: token attach failed: {}", c.name(), e),
            }
        }),
    );
    handle_cell.set(Some(handle));
}

/// Token unplugged (hotplug): forget the attachment.
pub fn token_detach(ctx: &Rc<Context>, c: &Rc<Compartment>) {
    if let Some(slot) = slot_of(ctx) {
        c.with_slot::<TokenState, ()>(slot, |s| s.attached = false);
    }
    info!("compartment {}: token detached", c.name());
}
