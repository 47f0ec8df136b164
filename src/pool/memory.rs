//! In-process pools keeping every object behind its own mutex.
//!
//! Objects are registered up front with the `with_*` methods, after which the
//! pools can be shared by reference between VM records.
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use nimbus_models::models::{
    Datastore, Image, ImageState, ImageType, VectorAttribute, VirtualNetwork,
};
use tracing::{debug, trace, warn};

use super::{
    AuthObject, AuthOperation, AuthRequest, DatastorePool, DiskAttachment, ImagePool, Locked,
    NetworkPool, PoolError,
};

pub const DEFAULT_DEV_PREFIX: &str = "hd";

fn lock<T>(object: &Mutex<T>) -> Locked<'_, T> {
    object.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MemoryDatastorePool {
    datastores: BTreeMap<i64, Mutex<Datastore>>,
}

impl MemoryDatastorePool {
    pub fn new() -> MemoryDatastorePool {
        MemoryDatastorePool::default()
    }

    pub fn with_datastore(mut self, datastore: Datastore) -> MemoryDatastorePool {
        self.datastores.insert(datastore.id, Mutex::new(datastore));
        self
    }
}

impl DatastorePool for MemoryDatastorePool {
    fn get(&self, id: i64) -> Option<Locked<'_, Datastore>> {
        self.datastores.get(&id).map(lock)
    }
}

/// A call to [ImagePool::release_image], kept for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRelease {
    pub vm_id: i64,
    pub image_id: i64,
    pub failed: bool,
}

#[derive(Debug)]
pub struct MemoryImagePool {
    images: BTreeMap<i64, Mutex<Image>>,
    datastores: Arc<dyn DatastorePool + Send + Sync>,
    default_dev_prefix: String,
    releases: Mutex<Vec<ImageRelease>>,
}

impl MemoryImagePool {
    pub fn new(datastores: Arc<dyn DatastorePool + Send + Sync>) -> MemoryImagePool {
        MemoryImagePool {
            images: BTreeMap::new(),
            datastores,
            default_dev_prefix: DEFAULT_DEV_PREFIX.to_string(),
            releases: Mutex::new(Vec::new()),
        }
    }

    pub fn with_image(mut self, image: Image) -> MemoryImagePool {
        self.images.insert(image.id, Mutex::new(image));
        self
    }

    pub fn with_default_dev_prefix(mut self, dev_prefix: &str) -> MemoryImagePool {
        self.default_dev_prefix = dev_prefix.to_string();
        self
    }

    /// Number of VMs holding a lease on the image
    pub fn running_vms(&self, image_id: i64) -> u32 {
        self.get(image_id).map_or(0, |image| image.running_vms)
    }

    /// Sum of the leases held on every image of the pool
    pub fn total_leases(&self) -> u32 {
        self.images.values().map(|image| lock(image).running_vms).sum()
    }

    /// Releases recorded since the pool was created or last drained
    pub fn releases(&self) -> Vec<ImageRelease> {
        lock(&self.releases).clone()
    }

    /// Returns the recorded releases and forgets them
    pub fn take_releases(&self) -> Vec<ImageRelease> {
        std::mem::take(&mut *lock(&self.releases))
    }

    fn image_id(&self, disk: &VectorAttribute, disk_id: usize, uid: i64) -> Result<Option<i64>, PoolError> {
        if let Some(raw) = disk.get("IMAGE_ID") {
            return raw.trim().parse::<i64>().map(Some).map_err(|_| {
                PoolError::Invalid(format!("Wrong IMAGE_ID {} in DISK {}", raw, disk_id))
            });
        }

        match disk.get("IMAGE") {
            Some(name) => {
                let owner = disk.get_parsed::<i64>("IMAGE_UID").unwrap_or(uid);
                let image = self.get_by_name(name, owner).ok_or_else(|| {
                    PoolError::NotFound(format!(
                        "User {} does not own an image with name: {}",
                        owner, name
                    ))
                })?;
                Ok(Some(image.id))
            }
            None => Ok(None),
        }
    }

    fn volatile_disk(
        &self,
        disk: &mut VectorAttribute,
        disk_id: usize,
    ) -> Result<DiskAttachment, PoolError> {
        let kind = disk.get("TYPE").map(str::to_ascii_lowercase);
        match kind.as_deref() {
            Some("fs") | Some("swap") => {}
            _ => {
                return Err(PoolError::Invalid(format!(
                    "DISK {} does not reference an image and is not a volatile disk",
                    disk_id
                )))
            }
        }

        let dev_prefix = disk
            .get("DEV_PREFIX")
            .unwrap_or(&self.default_dev_prefix)
            .to_string();
        disk.replace("DEV_PREFIX", &dev_prefix);
        disk.replace("DISK_ID", disk_id);

        Ok(DiskAttachment {
            image_type: ImageType::Datablock,
            dev_prefix,
            image_id: None,
        })
    }
}

impl ImagePool for MemoryImagePool {
    fn get(&self, id: i64) -> Option<Locked<'_, Image>> {
        self.images.get(&id).map(lock)
    }

    fn get_by_name(&self, name: &str, uid: i64) -> Option<Locked<'_, Image>> {
        self.images
            .values()
            .map(lock)
            .find(|image| image.name == name && image.uid == uid)
    }

    fn default_dev_prefix(&self) -> &str {
        &self.default_dev_prefix
    }

    fn disk_attribute(
        &self,
        vm_id: i64,
        disk: &mut VectorAttribute,
        disk_id: usize,
        uid: i64,
    ) -> Result<DiskAttachment, PoolError> {
        let image_id = match self.image_id(disk, disk_id, uid)? {
            Some(image_id) => image_id,
            None => return self.volatile_disk(disk, disk_id),
        };

        let mut image = self
            .get(image_id)
            .ok_or_else(|| PoolError::NotFound(format!("Image {} does not exist", image_id)))?;

        match image.image_type {
            ImageType::Os | ImageType::Cdrom | ImageType::Datablock => {}
            other => {
                return Err(PoolError::Invalid(format!(
                    "Image {} of type {} cannot be used as a DISK",
                    image_id, other
                )))
            }
        }

        if !image.is_available() {
            return Err(PoolError::Unavailable(format!(
                "Cannot acquire image {}, it is {:?} and persistent={}",
                image_id, image.state, image.persistent
            )));
        }

        let datastore = self.datastores.get(image.datastore_id).ok_or_else(|| {
            PoolError::NotFound("Associated datastore for image does not exist".to_string())
        })?;

        image.running_vms += 1;
        image.state = ImageState::Used;
        trace!(
            "Image {} acquired by VM {}, running VMs: {}",
            image_id,
            vm_id,
            image.running_vms
        );

        let dev_prefix = disk
            .get("DEV_PREFIX")
            .map(str::to_string)
            .or_else(|| image.dev_prefix.clone())
            .unwrap_or_else(|| self.default_dev_prefix.clone());

        disk.replace("IMAGE", &image.name);
        disk.replace("IMAGE_ID", image.id);
        disk.replace("IMAGE_UID", image.uid);
        disk.replace("SOURCE", &image.source);
        disk.replace("DATASTORE", &datastore.name);
        disk.replace("DATASTORE_ID", datastore.id);
        disk.replace("TM_MAD", &datastore.tm_mad);
        disk.replace("DEV_PREFIX", &dev_prefix);
        disk.replace("DISK_ID", disk_id);

        if image.image_type == ImageType::Cdrom {
            disk.replace("TYPE", "CDROM");
            disk.replace("READONLY", "YES");
        } else {
            disk.replace("TYPE", "DISK");
            if !disk.contains("READONLY") {
                disk.replace("READONLY", "NO");
            }
        }

        if image.persistent {
            disk.replace("PERSISTENT", "YES");
            disk.replace("SAVE", "YES");
        } else {
            disk.replace("SAVE", "NO");
        }

        if let Some(cluster_id) = datastore.cluster_id {
            disk.replace("CLUSTER_ID", cluster_id);
        }

        Ok(DiskAttachment {
            image_type: image.image_type,
            dev_prefix,
            image_id: Some(image.id),
        })
    }

    fn release_image(&self, vm_id: i64, image_id: i64, failed: bool) {
        match self.get(image_id) {
            Some(mut image) => {
                image.running_vms = image.running_vms.saturating_sub(1);
                if image.running_vms == 0 && image.state == ImageState::Used {
                    image.state = ImageState::Ready;
                }
                debug!(
                    "Image {} released by VM {} (failed: {}), running VMs: {}",
                    image_id, vm_id, failed, image.running_vms
                );
            }
            None => warn!("VM {} released image {} which no longer exists", vm_id, image_id),
        }

        lock(&self.releases).push(ImageRelease {
            vm_id,
            image_id,
            failed,
        });
    }

    fn authorize_disk(&self, disk: &VectorAttribute, uid: i64, request: &mut AuthRequest) {
        let image = match self.image_id(disk, 0, uid) {
            Ok(Some(image_id)) => self.get(image_id),
            _ => None,
        };

        if let Some(image) = image {
            let operation = if image.persistent {
                AuthOperation::Manage
            } else {
                AuthOperation::Use
            };
            request.add(AuthObject::Image, image.id, operation, image.uid);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryNetworkPool {
    networks: BTreeMap<i64, Mutex<VirtualNetwork>>,
    updates: Mutex<Vec<i64>>,
}

impl MemoryNetworkPool {
    pub fn new() -> MemoryNetworkPool {
        MemoryNetworkPool::default()
    }

    pub fn with_network(mut self, network: VirtualNetwork) -> MemoryNetworkPool {
        self.networks.insert(network.id, Mutex::new(network));
        self
    }

    /// Ids of the networks persisted through [NetworkPool::update], in order
    pub fn updates(&self) -> Vec<i64> {
        lock(&self.updates).clone()
    }

    /// Returns the recorded updates and forgets them
    pub fn take_updates(&self) -> Vec<i64> {
        std::mem::take(&mut *lock(&self.updates))
    }

    fn network_id(&self, nic: &VectorAttribute, uid: i64) -> Result<i64, PoolError> {
        if let Some(raw) = nic.get("NETWORK_ID") {
            return raw
                .trim()
                .parse::<i64>()
                .map_err(|_| PoolError::Invalid(format!("Wrong NETWORK_ID {} in NIC", raw)));
        }

        let name = nic
            .get("NETWORK")
            .ok_or_else(|| PoolError::Invalid("NIC does not reference a network".to_string()))?;
        let owner = nic.get_parsed::<i64>("NETWORK_UID").unwrap_or(uid);

        self.networks
            .values()
            .map(lock)
            .find(|network| network.name == name && network.uid == owner)
            .map(|network| network.id)
            .ok_or_else(|| {
                PoolError::NotFound(format!(
                    "User {} does not own a network with name: {}",
                    owner, name
                ))
            })
    }
}

impl NetworkPool for MemoryNetworkPool {
    fn get(&self, id: i64) -> Option<Locked<'_, VirtualNetwork>> {
        self.networks.get(&id).map(lock)
    }

    fn nic_attribute(
        &self,
        nic: &mut VectorAttribute,
        uid: i64,
        vm_id: i64,
    ) -> Result<(), PoolError> {
        let network_id = self.network_id(nic, uid)?;
        let requested = match nic.get("IP") {
            Some(ip) => Some(
                ip.trim()
                    .parse::<Ipv4Addr>()
                    .map_err(|_| PoolError::Invalid(format!("Wrong IP {} in NIC", ip)))?,
            ),
            None => None,
        };

        let mut network = self.get(network_id).ok_or_else(|| {
            PoolError::NotFound(format!("Virtual network {} does not exist", network_id))
        })?;

        let lease = network.get_lease(vm_id, requested).ok_or_else(|| {
            PoolError::Unavailable(format!(
                "Cannot get IP/MAC lease from virtual network {}.",
                network_id
            ))
        })?;

        nic.replace("NETWORK", &network.name);
        nic.replace("NETWORK_ID", network.id);
        nic.replace("BRIDGE", &network.bridge);
        nic.replace("IP", lease.ip);
        nic.replace("MAC", &lease.mac);
        if let Some(cluster_id) = network.cluster_id {
            nic.replace("CLUSTER_ID", cluster_id);
        }

        self.update(&network)
    }

    fn update(&self, network: &VirtualNetwork) -> Result<(), PoolError> {
        trace!("Persisting virtual network {}", network.id);
        lock(&self.updates).push(network.id);
        Ok(())
    }

    fn authorize_nic(&self, nic: &VectorAttribute, uid: i64, request: &mut AuthRequest) {
        if let Ok(network_id) = self.network_id(nic, uid) {
            if let Some(network) = self.get(network_id) {
                request.add(
                    AuthObject::Network,
                    network.id,
                    AuthOperation::Use,
                    network.uid,
                );
            }
        }
    }
}
