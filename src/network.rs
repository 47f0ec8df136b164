//! # Network leases
//!
//! Every NIC of a VM holds an address leased from its virtual network. An
//! address is only given back by the VM that owns it: by the time a VM is
//! cleaned up the address may have been released and leased to another VM.
use tracing::{debug, error, instrument};

use crate::lease::{Lease, LeaseLog};
use crate::pool::Collaborators;
use crate::vm::{VirtualMachine, VmError};

/// Releases `ip` on network `network_id` if `vm_id` still owns it, then
/// persists the network. Returns whether the address was released.
pub(crate) fn release_nic_lease(
    ctx: &Collaborators<'_>,
    vm_id: i64,
    network_id: i64,
    ip: &str,
) -> bool {
    let mut network = match ctx.networks.get(network_id) {
        Some(network) => network,
        None => {
            debug!("Network {} of VM {} no longer exists", network_id, vm_id);
            return false;
        }
    };

    if !network.is_owner(ip, vm_id) {
        debug!(
            "IP {} of network {} is not leased to VM {}, keeping it",
            ip, network_id, vm_id
        );
        return false;
    }

    network.release_lease(ip);
    if let Err(e) = ctx.networks.update(&network) {
        error!("Cannot update network {}: {}", network_id, e);
    }
    true
}

impl VirtualMachine {
    pub(crate) fn acquire_network_leases(
        &mut self,
        ctx: &Collaborators<'_>,
        log: &mut LeaseLog,
    ) -> Result<(), VmError> {
        let (vm_id, uid) = (self.oid, self.uid);

        for nic in self.template.vectors_mut("NIC")? {
            ctx.networks.nic_attribute(nic, uid, vm_id)?;

            match (nic.get_parsed::<i64>("NETWORK_ID"), nic.get("IP")) {
                (Some(network_id), Some(ip)) => log.record(Lease::Nic {
                    network_id,
                    ip: ip.to_string(),
                }),
                _ => debug!("NIC of VM {} leased without NETWORK_ID or IP", vm_id),
            }
        }
        Ok(())
    }

    /// Leases an address for every NIC. Addresses leased here are given
    /// back when one of the NICs cannot be set up.
    #[instrument(skip(self, ctx), fields(id = %self.oid))]
    pub fn get_network_leases(&mut self, ctx: &Collaborators<'_>) -> Result<(), VmError> {
        let mut log = LeaseLog::new(self.oid);
        match self.acquire_network_leases(ctx, &mut log) {
            Ok(()) => {
                log.commit();
                Ok(())
            }
            Err(e) => {
                log.rollback(ctx);
                Err(e)
            }
        }
    }

    /// Gives back the address of every NIC still owned by the VM, returns
    /// how many were released
    pub fn release_network_leases(&self, ctx: &Collaborators<'_>) -> usize {
        self.template
            .get("NIC")
            .filter_map(|a| a.as_vector().ok())
            .filter_map(|nic| Some((nic.get_parsed::<i64>("NETWORK_ID")?, nic.get("IP")?)))
            .filter(|(network_id, ip)| release_nic_lease(ctx, self.oid, *network_id, ip))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use super::*;
    use crate::pool::memory::{MemoryDatastorePool, MemoryImagePool, MemoryNetworkPool};
    use crate::pool::NetworkPool;
    use nimbus_models::models::{Template, VectorAttribute, VirtualNetwork};
    use pretty_assertions::assert_eq;

    fn networks() -> MemoryNetworkPool {
        MemoryNetworkPool::new()
            .with_network(
                VirtualNetwork::new(0, "private", "br0").with_range(Ipv4Addr::new(10, 0, 0, 5), 2),
            )
            .with_network(
                VirtualNetwork::new(1, "public", "br1").with_range(Ipv4Addr::new(192, 168, 1, 1), 1),
            )
    }

    #[test]
    fn failed_nic_releases_the_others() {
        let datastores = Arc::new(MemoryDatastorePool::new());
        let images = MemoryImagePool::new(datastores.clone());
        let networks = networks();
        let ctx = Collaborators::new(&images, &networks, &*datastores);

        let template = Template::new()
            .with(VectorAttribute::new("NIC").with("NETWORK_ID", 0))
            .with(VectorAttribute::new("NIC").with("NETWORK_ID", 1))
            .with(VectorAttribute::new("NIC").with("NETWORK_ID", 1));
        let mut vm = VirtualMachine::new(42, 0, 0, "oneadmin", "oneadmin", template);

        assert!(matches!(
            vm.get_network_leases(&ctx),
            Err(VmError::Unavailable(_))
        ));
        assert_eq!(networks.get(0).unwrap().free_addresses(), 2);
        assert_eq!(networks.get(1).unwrap().free_addresses(), 1);
    }

    #[test]
    fn missing_network_or_ip_is_skipped() {
        let datastores = Arc::new(MemoryDatastorePool::new());
        let images = MemoryImagePool::new(datastores.clone());
        let networks = networks();
        let ctx = Collaborators::new(&images, &networks, &*datastores);

        let template = Template::new()
            .with(VectorAttribute::new("NIC").with("IP", "10.0.0.5"))
            .with(VectorAttribute::new("NIC").with("NETWORK_ID", 0))
            .with(
                VectorAttribute::new("NIC")
                    .with("NETWORK_ID", 7)
                    .with("IP", "10.0.0.5"),
            );
        let vm = VirtualMachine::new(42, 0, 0, "oneadmin", "oneadmin", template);
        assert_eq!(vm.release_network_leases(&ctx), 0);
        assert!(networks.updates().is_empty());
    }
}
