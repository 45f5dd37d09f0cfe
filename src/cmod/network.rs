/// Network module: virtual interface pairs for each compartment, plus the
/// entry point the hotplug coordinator uses to move physical interfaces
/// into a compartment's net namespace.
use crate::compartment::config::VnetConfig;
use crate::compartment::Compartment;
use crate::daemon::Context;
use crate::lifecycle::module::{CModule, ChildPhase, HookOutcome, Phase};
use crate::net;
use crate::types::{Error, Result};
use log::{debug, info};
use std::rc::Rc;

/// Host-side veth endpoints created for this compartment.
struct NetState {
    host_ifaces: Vec<String>,
}

fn short_name(c: &Compartment) -> String {
    let name = c.name();
    name.chars().take(8).collect()
}

fn host_end(c: &Compartment, idx: usize) -> String {
    format!("r{}.{}", idx, short_name(c))
}

fn child_end(c: &Compartment, idx: usize) -> String {
    format!("c{}.{}", idx, short_name(c))
}

pub struct NetworkModule;

impl CModule for NetworkModule {
    fn name(&self) -> &'static str {
        "network"
    }

    fn hook(
        &self,
        phase: Phase,
        _ctx: &Rc<Context>,
        c: &Rc<Compartment>,
        slot: usize,
    ) -> Result<HookOutcome> {
        if phase != Phase::StartPreExec {
            return Ok(HookOutcome::Done);
        }
        let pid = c
            .pid()
            .ok_or_else(|| Error::Internal("network setup without child".to_string()))?;
        let mut state = NetState {
            host_ifaces: Vec::new(),
        };
        let vnet: Vec<VnetConfig> = c.config().vnet.clone();
        for (idx, _cfg) in vnet.iter().enumerate() {
            let host = host_end(c, idx);
            let child = child_end(c, idx);
            if let Err(e) = net::create_veth_pair(&host, &child) {
                // unwind the partial set before reporting
                for ifname in state.host_ifaces.iter().rev() {
                    let _ = net::delete_ifi(ifname);
                }
                return Err(e);
            }
            state.host_ifaces.push(host.clone());
            if let Err(e) = net::move_ifi_to_netns_pid(&child, pid) {
                for ifname in state.host_ifaces.iter().rev() {
                    let _ = net::delete_ifi(ifname);
                }
                return Err(e);
            }
            net::set_ifi_up(&host)?;
            debug!(
                "compartment {}: veth {} <-> {} (moved)",
                c.name(),
                host,
                child
            );
        }
        c.set_slot(slot, state);
        Ok(HookOutcome::Done)
    }

    fn child_hook(
        &self,
        phase: ChildPhase,
        _ctx: &Context,
        c: &Compartment,
        _slot: usize,
    ) -> Result<()> {
        if phase != ChildPhase::StartPreExecChild {
            return Ok(());
        }
        // Runs inside the compartment's net namespace.
        let _ = net::set_ifi_up("lo");
        for (idx, cfg) in c.config().vnet.iter().enumerate() {
            let tmp = child_end(c, idx);
            net::rename_ifi(&tmp, &cfg.name)?;
            if let Some(ip) = &cfg.addr {
                net::add_ipv4_addr(&cfg.name, ip.addr, ip.prefixlen)?;
            }
            net::set_ifi_up(&cfg.name)?;
        }
        Ok(())
    }

    fn cleanup(&self, _ctx: &Rc<Context>, c: &Rc<Compartment>, slot: usize) {
        if let Some(state) = c.take_slot::<NetState>(slot) {
            for ifname in state.host_ifaces.iter().rev() {
                if let Err(e) = net::delete_ifi(ifname) {
                    // the peer may already be gone with the namespace
                    debug!("veth {} removal: {}", ifname, e);
                }
            }
        }
    }
}

/// Move a physical interface into the compartment's net namespace; called
/// by the hotplug coordinator after rename.
pub fn move_phys_into(_ctx: &Rc<Context>, c: &Rc<Compartment>, ifname: &str) -> Result<()> {
    if !c.state().accepts_devices() {
        return Err(Error::PreconditionFailed(format!(
            "compartment {} is {}",
            c.name(),
            c.state()
        )));
    }
    let pid = c
        .pid()
        .ok_or_else(|| Error::PreconditionFailed(format!("compartment {} has no child", c.name())))?;
    net::move_ifi_to_netns_pid(ifname, pid)?;
    c.add_netif(ifname);
    info!(
        "moved physical interface {} into compartment {}",
        ifname,
        c.name()
    );
    Ok(())
}

