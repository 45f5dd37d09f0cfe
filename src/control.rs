/// Control facade and local control channel.
///
/// The facade validates each operation against the compartment's existence
/// and state and translates it into lifecycle engine calls; registrations
/// and queries complete synchronously, start/stop/reboot register a
/// transition waiter and reply when it resolves.
///
/// The channel owns the stream socket under the socket directory and the
/// length-prefixed framing; payload bytes are handed to a `ControlSurface`
/// collaborator, the core never interprets them itself. A JSON surface is
/// bundled so the daemon is operable stand-alone.
use crate::compartment::config::{CompartmentConfig, PnetConfig, UsbDeviceConfig};
use crate::daemon::Context;
use crate::event::{EventLoop, IoInterest};
use crate::hotplug::Hotplug;
use crate::lifecycle;
use crate::store::DesiredState;
use crate::types::{CompartmentState, Error, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompartmentInfo {
    pub uuid: Uuid,
    pub name: String,
    pub state: CompartmentState,
}

/// Completion callback handed to asynchronous operations.
pub type Completion = Box<dyn FnOnce(Result<()>)>;

pub struct ControlFacade {
    ctx: Rc<Context>,
    hotplug: Rc<Hotplug>,
}

impl ControlFacade {
    pub fn new(ctx: Rc<Context>, hotplug: Rc<Hotplug>) -> ControlFacade {
        ControlFacade { ctx, hotplug }
    }

    pub fn context(&self) -> &Rc<Context> {
        &self.ctx
    }

    fn lookup(&self, uuid: Uuid) -> Result<Rc<crate::compartment::Compartment>> {
        self.ctx
            .by_uuid(uuid)
            .ok_or_else(|| Error::PreconditionFailed(format!("unknown compartment {}", uuid)))
    }

    pub fn list(&self) -> Vec<CompartmentInfo> {
        self.ctx
            .compartments()
            .iter()
            .map(|c| CompartmentInfo {
                uuid: c.uuid(),
                name: c.name(),
                state: c.state(),
            })
            .collect()
    }

    /// Register a new compartment from a decoded configuration record.
    pub fn register(&self, config: CompartmentConfig) -> Result<Uuid> {
        let c = self.ctx.add_compartment(config)?;
        Ok(c.uuid())
    }

    pub fn remove(&self, uuid: Uuid) -> Result<()> {
        self.ctx.remove_compartment(uuid)
    }

    pub fn start(&self, uuid: Uuid, done: Completion) -> Result<()> {
        let c = self.lookup(uuid)?;
        if let Err(e) = self.ctx.store.set_desired(uuid, DesiredState::Running) {
            warn!("desired-state persist failed: {}", e);
        }
        lifecycle::start(&self.ctx, &c, false, Some(Box::new(move |_, res| done(res))))
    }

    /// Provisioning boot into the setup init.
    pub fn start_setup(&self, uuid: Uuid, done: Completion) -> Result<()> {
        let c = self.lookup(uuid)?;
        lifecycle::start(&self.ctx, &c, true, Some(Box::new(move |_, res| done(res))))
    }

    pub fn stop(&self, uuid: Uuid, done: Completion) -> Result<()> {
        let c = self.lookup(uuid)?;
        if let Err(e) = self.ctx.store.set_desired(uuid, DesiredState::Stopped) {
            warn!("desired-state persist failed: {}", e);
        }
        lifecycle::stop(&self.ctx, &c, Some(Box::new(move |_, res| done(res))))
    }

    pub fn freeze(&self, uuid: Uuid, done: Completion) -> Result<()> {
        let c = self.lookup(uuid)?;
        lifecycle::freeze(&self.ctx, &c, Some(Box::new(move |_, res| done(res))))
    }

    pub fn unfreeze(&self, uuid: Uuid, done: Completion) -> Result<()> {
        let c = self.lookup(uuid)?;
        lifecycle::unfreeze(&self.ctx, &c, Some(Box::new(move |_, res| done(res))))
    }

    pub fn reboot(&self, uuid: Uuid, done: Completion) -> Result<()> {
        let c = self.lookup(uuid)?;
        lifecycle::reboot(&self.ctx, &c, Some(Box::new(move |_, res| done(res))))
    }

    pub fn register_usb(&self, uuid: Uuid, mapping: UsbDeviceConfig) -> Result<()> {
        self.lookup(uuid)?;
        self.hotplug.register_usb(uuid, mapping)
    }

    pub fn unregister_usb(&self, uuid: Uuid, mapping: &UsbDeviceConfig) -> Result<()> {
        self.lookup(uuid)?;
        self.hotplug.unregister_usb(uuid, mapping)
    }

    pub fn register_net(&self, uuid: Uuid, mapping: PnetConfig) -> Result<()> {
        self.lookup(uuid)?;
        self.hotplug.register_net(uuid, mapping)
    }

    pub fn unregister_net(&self, uuid: Uuid, mac: &str) -> Result<()> {
        self.lookup(uuid)?;
        let mac = crate::net::parse_mac(mac)?;
        self.hotplug.unregister_net(uuid, &mac)
    }

    /// Store the passphrase and drive a token unlock for the compartment.
    pub fn attach_token(&self, uuid: Uuid, passphrase: String) -> Result<()> {
        let c = self.lookup(uuid)?;
        if !c.state().accepts_devices() {
            return Err(Error::PreconditionFailed(format!(
                "compartment {} is {}",
                c.name(),
                c.state()
            )));
        }
        crate::cmod::smartcard::set_passphrase(&self.ctx, &c, passphrase);
        crate::cmod::smartcard::token_attach(&self.ctx, &c);
        Ok(())
    }
}

/// Frame decoder/encoder contract implemented by the control-surface
/// collaborator. `reply` must be invoked exactly once per request;
/// `notify` may be retained to push asynchronous state-change frames onto
/// the same connection.
pub trait ControlSurface {
    fn handle(
        &self,
        facade: &ControlFacade,
        payload: &[u8],
        reply: Box<dyn FnOnce(Vec<u8>)>,
        notify: Rc<dyn Fn(Vec<u8>)>,
    );
}

/// Listener plus per-connection framing on the event loop.
pub struct ControlChannel {
    pub path: PathBuf,
}

impl ControlChannel {
    /// Bind the control socket. Failure here is fatal for the daemon.
    pub fn bind(
        ev: &EventLoop,
        socket_dir: &Path,
        name: &str,
        facade: Rc<ControlFacade>,
        surface: Rc<dyn ControlSurface>,
    ) -> Result<ControlChannel> {
        std::fs::create_dir_all(socket_dir)?;
        let path = socket_dir.join(format!("cml-{}", name));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        info!("control socket at {}", path.display());

        let listener = Rc::new(listener);
        let accept_listener = listener.clone();
        ev.add_io(
            listener.as_raw_fd(),
            IoInterest::Read,
            Box::new(move |ev, _, _| loop {
                match accept_listener.accept() {
                    Ok((stream, _)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!("control connection setup failed: {}", e);
                            continue;
                        }
                        debug!("control connection accepted");
                        serve_connection(ev, stream, facade.clone(), surface.clone());
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("control accept failed: {}", e);
                        break;
                    }
                }
            }),
        );
        // keep the listener alive through the closure above
        Ok(ControlChannel { path })
    }
}

struct ConnState {
    stream: UnixStream,
    buf: Vec<u8>,
}

fn serve_connection(
    ev: &EventLoop,
    stream: UnixStream,
    facade: Rc<ControlFacade>,
    surface: Rc<dyn ControlSurface>,
) {
    let fd = stream.as_raw_fd();
    let state = Rc::new(RefCell::new(ConnState {
        stream,
        buf: Vec::new(),
    }));
    let handle_cell: Rc<std::cell::Cell<Option<crate::event::IoHandle>>> =
        Rc::new(std::cell::Cell::new(None));
    let handle_for_cb = handle_cell.clone();

    let handle = ev.add_io(
        fd,
        IoInterest::Read,
        Box::new(move |ev, _, readiness| {
            if readiness.hangup && !readiness.readable {
                if let Some(handle) = handle_for_cb.get() {
                    ev.remove_io(handle);
                }
                return;
            }
            let mut chunk = [0u8; 4096];
            {
                let mut state = state.borrow_mut();
                match state.stream.read(&mut chunk) {
                    Ok(0) => {
                        if let Some(handle) = handle_for_cb.get() {
                            ev.remove_io(handle);
                        }
                        return;
                    }
                    Ok(n) => state.buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!("control connection read failed: {}", e);
                        if let Some(handle) = handle_for_cb.get() {
                            ev.remove_io(handle);
                        }
                        return;
                    }
                }
            }
            // drain complete frames: 4-byte BE length + payload
            loop {
                let payload = {
                    let mut state = state.borrow_mut();
                    if state.buf.len() < 4 {
                        break;
                    }
                    let len = u32::from_be_bytes([
                        state.buf[0],
                        state.buf[1],
                        state.buf[2],
                        state.buf[3],
                    ]) as usize;
                    if len > 1 << 20 {
                        warn!("oversized control frame ({} bytes), dropping connection", len);
                        if let Some(handle) = handle_for_cb.get() {
                            ev.remove_io(handle);
                        }
                        return;
                    }
                    if state.buf.len() < 4 + len {
                        break;
                    }
                    let payload: Vec<u8> = state.buf[4..4 + len].to_vec();
                    state.buf.drain(..4 + len);
                    payload
                };
                let reply_state = state.clone();
                let notify_state = state.clone();
                surface.handle(
                    &facade,
                    &payload,
                    Box::new(move |reply| {
                        let mut state = reply_state.borrow_mut();
                        let len = (reply.len() as u32).to_be_bytes();
                        if let Err(e) = state
                            .stream
                            .write_all(&len)
                            .and_then(|_| state.stream.write_all(&reply))
                        {
                            debug!("control reply write failed: {}", e);
                        }
                    }),
                    Rc::new(move |frame: Vec<u8>| {
                        let mut state = notify_state.borrow_mut();
                        let len = (frame.len() as u32).to_be_bytes();
                        if let Err(e) = state
                            .stream
                            .write_all(&len)
                            .and_then(|_| state.stream.write_all(&frame))
                        {
                            debug!("control notification write failed: {}", e);
                        }
                    }),
                );
            }
        }),
    );
    handle_cell.set(Some(handle));
}

/// Wire records of the bundled JSON control surface.
#[derive(Deserialize)]
pub enum WireRequest {
    List,
    Start { uuid: Uuid },
    StartSetup { uuid: Uuid },
    Stop { uuid: Uuid },
    Freeze { uuid: Uuid },
    Unfreeze { uuid: Uuid },
    Reboot { uuid: Uuid },
    RegisterUsb { uuid: Uuid, mapping: UsbDeviceConfig },
    UnregisterUsb { uuid: Uuid, mapping: UsbDeviceConfig },
    RegisterNet { uuid: Uuid, mapping: PnetConfig },
    UnregisterNet { uuid: Uuid, mac: String },
    AttachToken { uuid: Uuid, passphrase: String },
    /// Stream state-change notifications for all compartments onto this
    /// connection.
    Subscribe,
}

#[derive(Serialize)]
pub enum WireReply {
    Ok,
    Compartments(Vec<CompartmentInfo>),
    Error { kind: String, message: String },
}

/// Asynchronous state-change frame pushed to subscribed connections.
#[derive(Serialize)]
pub struct WireNotification {
    pub uuid: Uuid,
    pub state: CompartmentState,
}

fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::ConfigInvalid(_) => "config_invalid",
        Error::PreconditionFailed(_) => "precondition_failed",
        Error::ResourceBusy(_) => "resource_busy",
        Error::Credential(_) => "credential_error",
        Error::Kernel { .. } => "kernel_error",
        Error::Timeout(_) => "timeout",
        Error::Internal(_) => "internal",
    }
}

fn encode(reply: &WireReply) -> Vec<u8> {
    serde_json::to_vec(reply).unwrap_or_else(|_| b"{\"Error\":{}}".to_vec())
}

fn result_reply(result: Result<()>) -> Vec<u8> {
    match result {
        Ok(()) => encode(&WireReply::Ok),
        Err(e) => encode(&WireReply::Error {
            kind: error_kind(&e).to_string(),
            message: e.to_string(),
        }),
    }
}

/// Bundled collaborator: JSON over the length-prefixed framing.
pub struct JsonSurface;

impl ControlSurface for JsonSurface {
    fn handle(
        &self,
        facade: &ControlFacade,
        payload: &[u8],
        reply: Box<dyn FnOnce(Vec<u8>)>,
        notify: Rc<dyn Fn(Vec<u8>)>,
    ) {
        let request: WireRequest = match serde_json::from_slice(payload) {
            Ok(r) => r,
            Err(e) => {
                reply(encode(&WireReply::Error {
                    kind: "config_invalid".to_string(),
                    message: format!("malformed request: {}", e),
                }));
                return;
            }
        };
        // Asynchronous operations reply when the transition resolves; a
        // synchronous validation error replies immediately. Either way the
        // reply fires exactly once.
        fn deferred(
            reply: Box<dyn FnOnce(Vec<u8>)>,
            op: impl FnOnce(Completion) -> Result<()>,
        ) {
            let slot = Rc::new(RefCell::new(Some(reply)));
            let waiter_slot = slot.clone();
            let outcome = op(Box::new(move |res| {
                if let Some(reply) = waiter_slot.borrow_mut().take() {
                    reply(result_reply(res));
                }
            }));
            if let Err(e) = outcome {
                if let Some(reply) = slot.borrow_mut().take() {
                    reply(result_reply(Err(e)));
                }
            }
        }

        match request {
            WireRequest::List => reply(encode(&WireReply::Compartments(facade.list()))),
            WireRequest::Start { uuid } => {
                deferred(reply, |done| facade.start(uuid, done));
            }
            WireRequest::StartSetup { uuid } => {
                deferred(reply, |done| facade.start_setup(uuid, done));
            }
            WireRequest::Stop { uuid } => {
                deferred(reply, |done| facade.stop(uuid, done));
            }
            WireRequest::Freeze { uuid } => {
                deferred(reply, |done| facade.freeze(uuid, done));
            }
            WireRequest::Unfreeze { uuid } => {
                deferred(reply, |done| facade.unfreeze(uuid, done));
            }
            WireRequest::Reboot { uuid } => {
                deferred(reply, |done| facade.reboot(uuid, done));
            }
            WireRequest::RegisterUsb { uuid, mapping } => {
                reply(result_reply(facade.register_usb(uuid, mapping)));
            }
            WireRequest::UnregisterUsb { uuid, mapping } => {
                reply(result_reply(facade.unregister_usb(uuid, &mapping)));
            }
            WireRequest::RegisterNet { uuid, mapping } => {
                reply(result_reply(facade.register_net(uuid, mapping)));
            }
            WireRequest::UnregisterNet { uuid, mac } => {
                reply(result_reply(facade.unregister_net(uuid, &mac)));
            }
            WireRequest::AttachToken { uuid, passphrase } => {
                reply(result_reply(facade.attach_token(uuid, passphrase)));
            }
            WireRequest::Subscribe => {
                for c in facade.context().compartments() {
                    let notify = notify.clone();
                    c.observe(Rc::new(move |comp, _, new| {
                        let frame = serde_json::to_vec(&WireNotification {
                            uuid: comp.uuid(),
                            state: new,
                        })
                        .unwrap_or_default();
                        notify(frame);
                    }));
                }
                reply(encode(&WireReply::Ok));
            }
        }
    }
}
