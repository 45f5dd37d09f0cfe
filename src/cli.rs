/// Daemon entry: argument parsing, logger setup, bootstrap and the main
/// loop. Initialization order is fixed: event loop, uevent source, module
/// registry, persisted-state restore, hotplug, control socket. Failures
/// before the loop starts are fatal; everything after is recovered per
/// compartment.
use crate::cmod;
use crate::cmod::cgroup::CgroupFreezer;
use crate::compartment::config::CompartmentConfig;
use crate::control::{ControlChannel, ControlFacade, JsonSurface};
use crate::cred::CredClient;
use crate::daemon::{Context, DaemonConfig};
use crate::event::EventLoop;
use crate::hotplug::{ContextSink, Hotplug};
use crate::lifecycle::spawn::CloneSpawner;
use crate::store::{DesiredState, Store};
use crate::uevent::UeventSource;
use anyhow::Context as AnyhowContext;
use clap::Parser;
use log::{info, warn};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

const DEFAULT_COMPARTMENT: &str = "c0";

#[derive(Parser)]
#[command(author, version, about = "compartment management daemon", long_about = None)]
struct Cli {
    /// Persisted compartment state directory
    #[arg(long, default_value = "/var/lib/compartmentd")]
    data_dir: PathBuf,

    /// Runtime directory for rootfs trees and service fifos
    #[arg(long, default_value = "/run/compartmentd")]
    run_dir: PathBuf,

    /// Directory for the control socket
    #[arg(long, default_value = "/run/socket")]
    socket_dir: PathBuf,

    /// Control socket name suffix (cml-<name>)
    #[arg(long, default_value = "control")]
    name: String,

    /// Credential collaborator socket
    #[arg(long, default_value = "/run/compartmentd/cred.sock")]
    cred_socket: PathBuf,

    /// Credential round-trip timeout in seconds
    #[arg(long, default_value_t = 30)]
    cred_timeout: u64,

    /// Force the cgroup v1 backend
    #[arg(long)]
    cgroup_v1: bool,

    /// Override roots for tests (hidden)
    #[arg(long, hide = true, default_value = "/sys")]
    sysfs_root: PathBuf,
    #[arg(long, hide = true, default_value = "/dev")]
    dev_root: PathBuf,
    #[arg(long, hide = true, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,
}

/// Physical interfaces present at startup: entries of /sys/class/net with
/// a backing device, loopback excluded.
fn list_physical_ifaces(sysfs_root: &PathBuf) -> Vec<String> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(sysfs_root.join("class/net")) else {
        return out;
    };
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        if name == "lo" {
            continue;
        }
        if entry.path().join("device").exists() {
            out.push(name);
        }
    }
    out
}

pub fn run() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let cfg = DaemonConfig {
        data_dir: cli.data_dir.clone(),
        run_dir: cli.run_dir.clone(),
        socket_dir: cli.socket_dir.clone(),
        cred_socket: cli.cred_socket.clone(),
        cred_timeout: Duration::from_secs(cli.cred_timeout),
        sysfs_root: cli.sysfs_root.clone(),
        dev_root: cli.dev_root.clone(),
        cgroup_root: cli.cgroup_root.clone(),
        force_cgroup_v1: cli.cgroup_v1,
        ..DaemonConfig::default()
    };

    // Fatal initialization: event loop, uevent source, control socket.
    let ev = EventLoop::new().context("event loop setup failed")?;
    let uevents = UeventSource::new(&ev).context("uevent netlink socket failed")?;
    let registry = cmod::standard_registry();
    let store = Store::open(&cfg.data_dir).context("state directory unusable")?;
    let cred = CredClient::new(&cfg.cred_socket, cfg.cred_timeout);
    std::fs::create_dir_all(&cfg.run_dir).context("run directory unusable")?;

    let ctx = Context::new(
        ev.clone(),
        registry,
        store,
        cred,
        Box::new(CloneSpawner),
        Box::new(CgroupFreezer::new(cfg.clone())),
        cfg.clone(),
    );
    ctx.set_uevent_source(uevents.clone());

    // Restore persisted compartments; create the management compartment on
    // first boot.
    let mut to_start = Vec::new();
    for (uuid, config, desired) in ctx.store.load_all().context("state restore failed")? {
        let name = config.name.clone();
        match ctx.add_compartment_with_uuid(uuid, config) {
            Ok(c) => {
                if name == DEFAULT_COMPARTMENT {
                    ctx.set_default_compartment(c.uuid());
                }
                if desired == Some(DesiredState::Running) {
                    to_start.push(c.uuid());
                }
            }
            Err(e) => warn!("skipping persisted compartment {}: {}", uuid, e),
        }
    }
    if ctx.by_name(DEFAULT_COMPARTMENT).is_none() {
        let c0 = ctx
            .add_compartment(CompartmentConfig::management(DEFAULT_COMPARTMENT))
            .context("management compartment setup failed")?;
        ctx.set_default_compartment(c0.uuid());
    }

    // Hotplug: initial interface sweep, then uevent subscription, then the
    // mapping tables from the restored configurations.
    let hotplug = Rc::new(Hotplug::new(
        Box::new(ContextSink::new(&ctx)),
        &cfg.sysfs_root,
        &cfg.dev_root,
    ));
    hotplug.rename_existing(&list_physical_ifaces(&cfg.sysfs_root));
    hotplug.subscribe(&uevents);
    for c in ctx.compartments() {
        let (usb, pnet) = {
            let config = c.config();
            (config.usb_devices.clone(), config.pnet.clone())
        };
        for mapping in usb {
            if let Err(e) = hotplug.register_usb(c.uuid(), mapping) {
                warn!("compartment {}: usb mapping rejected: {}", c.name(), e);
            }
        }
        for mapping in pnet {
            if let Err(e) = hotplug.register_net(c.uuid(), mapping) {
                warn!("compartment {}: net mapping rejected: {}", c.name(), e);
            }
        }
    }

    let facade = Rc::new(ControlFacade::new(ctx.clone(), hotplug.clone()));
    let _channel = ControlChannel::bind(
        &ev,
        &cfg.socket_dir,
        &cli.name,
        facade.clone(),
        Rc::new(JsonSurface),
    )
    .context("control socket setup failed")?;

    // Clean shutdown on SIGTERM/SIGINT.
    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        ev.add_signal(
            sig,
            Box::new(move |ev, sig| {
                info!("received {:?}, shutting down", sig);
                ev.shutdown();
            }),
        )
        .context("signal setup failed")?;
    }

    // Restart compartments that were running before the reboot.
    for uuid in to_start {
        info!("restoring previously running compartment {}", uuid);
        if let Err(e) = facade.start(uuid, Box::new(|_| {})) {
            warn!("restore start of {} failed: {}", uuid, e);
        }
    }

    info!("compartmentd ready ({} compartments)", ctx.compartments().len());
    ev.run().context("event loop failed")?;
    info!("compartmentd exiting");
    Ok(())
}
