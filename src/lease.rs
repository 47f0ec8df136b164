//! Record of the leases taken during one acquisition, so that a failure can
//! give them back in reverse order.
use tracing::{debug, warn};
use uuid::Uuid;

use crate::network::release_nic_lease;
use crate::pool::Collaborators;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lease {
    Image(i64),
    Nic { network_id: i64, ip: String },
}

#[derive(Debug)]
pub(crate) struct LeaseLog {
    id: Uuid,
    vm_id: i64,
    entries: Vec<Lease>,
    settled: bool,
}

impl LeaseLog {
    pub(crate) fn new(vm_id: i64) -> LeaseLog {
        let id = Uuid::new_v4();
        debug!("Lease transaction {} opened for VM {}", id, vm_id);
        LeaseLog {
            id,
            vm_id,
            entries: Vec::new(),
            settled: false,
        }
    }

    pub(crate) fn record(&mut self, lease: Lease) {
        self.entries.push(lease);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Releases every recorded lease, last acquired first
    pub(crate) fn rollback(mut self, ctx: &Collaborators<'_>) {
        debug!(
            "Lease transaction {} rolled back for VM {}, {} leases to release",
            self.id,
            self.vm_id,
            self.entries.len()
        );

        while let Some(lease) = self.entries.pop() {
            match lease {
                Lease::Image(image_id) => ctx.images.release_image(self.vm_id, image_id, false),
                Lease::Nic { network_id, ip } => {
                    release_nic_lease(ctx, self.vm_id, network_id, &ip);
                }
            }
        }
        self.settled = true;
    }

    /// Keeps the recorded leases, they now belong to the VM
    pub(crate) fn commit(mut self) {
        debug!(
            "Lease transaction {} committed for VM {} with {} leases",
            self.id,
            self.vm_id,
            self.entries.len()
        );
        self.settled = true;
    }
}

impl Drop for LeaseLog {
    fn drop(&mut self) {
        if !self.settled && !self.entries.is_empty() {
            warn!(
                "Lease transaction {} for VM {} dropped with {} unsettled leases",
                self.id,
                self.vm_id,
                self.entries.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use super::*;
    use crate::pool::memory::{
        ImageRelease, MemoryDatastorePool, MemoryImagePool, MemoryNetworkPool,
    };
    use crate::pool::{ImagePool, NetworkPool};
    use nimbus_models::models::{Datastore, Image, ImageType, VectorAttribute, VirtualNetwork};
    use pretty_assertions::assert_eq;

    #[test]
    fn rollback_in_reverse_order() {
        let datastores = Arc::new(
            MemoryDatastorePool::new().with_datastore(Datastore::new(1, "default", "shared")),
        );
        let images = MemoryImagePool::new(datastores.clone())
            .with_image(Image::new(0, "a", ImageType::Os, 1))
            .with_image(Image::new(1, "b", ImageType::Datablock, 1));
        let networks = MemoryNetworkPool::new().with_network(
            VirtualNetwork::new(0, "private", "br0").with_range(Ipv4Addr::new(10, 0, 0, 5), 4),
        );
        let ctx = Collaborators::new(&images, &networks, &*datastores);

        let mut log = LeaseLog::new(7);
        for id in 0..2 {
            let mut disk = VectorAttribute::new("DISK").with("IMAGE_ID", id);
            images.disk_attribute(7, &mut disk, id as usize, 0).unwrap();
            log.record(Lease::Image(id));
        }
        let mut nic = VectorAttribute::new("NIC").with("NETWORK_ID", 0);
        networks.nic_attribute(&mut nic, 0, 7).unwrap();
        log.record(Lease::Nic {
            network_id: 0,
            ip: "10.0.0.5".to_string(),
        });
        assert_eq!(log.len(), 3);

        log.rollback(&ctx);

        assert_eq!(
            images.releases(),
            vec![
                ImageRelease {
                    vm_id: 7,
                    image_id: 1,
                    failed: false
                },
                ImageRelease {
                    vm_id: 7,
                    image_id: 0,
                    failed: false
                },
            ]
        );
        assert_eq!(images.total_leases(), 0);
        assert_eq!(networks.get(0).unwrap().free_addresses(), 4);
    }
}
