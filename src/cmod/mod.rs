/// Compartment subsystem modules.
///
/// `standard_registry` builds the canonical ordered set; the order encodes
/// the dependency chain (credentials before volumes, uid mapping before
/// ownership shifting, cgroups before capabilities) and is the unwind
/// order reversed.
pub mod audit;
pub mod caps;
pub mod cgroup;
pub mod network;
pub mod run;
pub mod seccomp;
pub mod service;
pub mod smartcard;
pub mod time;
pub mod uevent_fwd;
pub mod uidshift;
pub mod userns;
pub mod volumes;

use crate::lifecycle::module::ModuleRegistry;

pub fn standard_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(Box::new(smartcard::SmartcardModule));
    registry.register(Box::new(userns::UsernsModule));
    registry.register(Box::new(volumes::VolumesModule));
    registry.register(Box::new(uidshift::UidShiftModule));
    registry.register(Box::new(cgroup::CgroupModule));
    registry.register(Box::new(network::NetworkModule));
    registry.register(Box::new(service::ServiceModule));
    registry.register(Box::new(time::TimeModule));
    registry.register(Box::new(caps::CapsModule));
    registry.register(Box::new(seccomp::SeccompModule));
    registry.register(Box::new(run::RunModule));
    registry.register(Box::new(audit::AuditModule));
    registry.register(Box::new(uevent_fwd::UeventFwdModule::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_order_encodes_dependencies() {
        let registry = standard_registry();
        let order: Vec<&str> = registry.iter().map(|(_, m)| m.name()).collect();
        let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
        // credentials unlock before volumes consume the key
        assert!(pos("smartcard") < pos("volumes"));
        // uid mapping before ownership shifting and volumes
        assert!(pos("userns") < pos("volumes"));
        assert!(pos("userns") < pos("uidshift"));
        // cgroups before capabilities
        assert!(pos("cgroup") < pos("caps"));
    }
}
