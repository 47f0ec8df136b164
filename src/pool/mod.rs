//! # Resource pools consumed by the VM record
//!
//! Images, virtual networks and datastores are owned by their pools, the VM
//! record only reaches them through the traits of this module. Lookups hand
//! out a [Locked] handle: the object stays exclusively locked for the caller
//! until the handle is dropped, on every exit path.
//!
//! [memory] provides in-process implementations of every pool.
use std::fmt::Debug;
use std::sync::MutexGuard;

use nimbus_models::models::{Datastore, Image, ImageType, VectorAttribute, VirtualNetwork};

use crate::config::CoreConfig;
use crate::parser::{ExpressionParser, VariableParser};

pub mod memory;

/// Exclusive access to a pool object, released when dropped
pub type Locked<'a, T> = MutexGuard<'a, T>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The referenced object does not exist in the pool
    #[error("{0}")]
    NotFound(String),
    /// The object exists but cannot be leased right now
    #[error("{0}")]
    Unavailable(String),
    /// The attribute referencing the object is malformed
    #[error("{0}")]
    Invalid(String),
}

/// Outcome of acquiring the image behind a DISK attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAttachment {
    pub image_type: ImageType,
    pub dev_prefix: String,
    /// Leased image, `None` for volatile disks
    pub image_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthObject {
    Image,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOperation {
    Use,
    Manage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthItem {
    pub object: AuthObject,
    pub id: i64,
    pub operation: AuthOperation,
    pub owner: i64,
}

/// Authorization requests gathered for a user before a template is admitted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequest {
    pub uid: i64,
    pub items: Vec<AuthItem>,
}

impl AuthRequest {
    pub fn new(uid: i64) -> AuthRequest {
        AuthRequest {
            uid,
            items: Vec::new(),
        }
    }

    pub fn add(&mut self, object: AuthObject, id: i64, operation: AuthOperation, owner: i64) {
        self.items.push(AuthItem {
            object,
            id,
            operation,
            owner,
        });
    }
}

pub trait ImagePool: Debug {
    fn get(&self, id: i64) -> Option<Locked<'_, Image>>;

    /// Image named `name` owned by `uid`
    fn get_by_name(&self, name: &str, uid: i64) -> Option<Locked<'_, Image>>;

    /// Device prefix of disks whose image does not set one
    fn default_dev_prefix(&self) -> &str;

    /// Acquires the image referenced by `disk` for `vm_id` and completes the
    /// DISK attribute with the image information
    fn disk_attribute(
        &self,
        vm_id: i64,
        disk: &mut VectorAttribute,
        disk_id: usize,
        uid: i64,
    ) -> Result<DiskAttachment, PoolError>;

    /// Returns an image lease. `failed` is set when the VM is being cleaned
    /// up after a failure, so pending snapshots are not persisted.
    fn release_image(&self, vm_id: i64, image_id: i64, failed: bool);

    fn authorize_disk(&self, disk: &VectorAttribute, uid: i64, request: &mut AuthRequest);
}

pub trait NetworkPool: Debug {
    fn get(&self, id: i64) -> Option<Locked<'_, VirtualNetwork>>;

    /// Leases an address for the NIC and completes the NIC attribute
    fn nic_attribute(&self, nic: &mut VectorAttribute, uid: i64, vm_id: i64)
        -> Result<(), PoolError>;

    /// Persists the state of a network after a lease change
    fn update(&self, network: &VirtualNetwork) -> Result<(), PoolError>;

    fn authorize_nic(&self, nic: &VectorAttribute, uid: i64, request: &mut AuthRequest);
}

pub trait DatastorePool: Debug {
    fn get(&self, id: i64) -> Option<Locked<'_, Datastore>>;
}

/// Everything a VM record talks to while acquiring or releasing resources
#[derive(Debug, Clone)]
pub struct Collaborators<'a> {
    pub images: &'a dyn ImagePool,
    pub networks: &'a dyn NetworkPool,
    pub datastores: &'a dyn DatastorePool,
    pub parser: &'a dyn ExpressionParser,
    pub config: CoreConfig,
}

static DEFAULT_PARSER: VariableParser = VariableParser;

impl<'a> Collaborators<'a> {
    /// Collaborators with the builtin expression parser and the default
    /// configuration
    pub fn new(
        images: &'a dyn ImagePool,
        networks: &'a dyn NetworkPool,
        datastores: &'a dyn DatastorePool,
    ) -> Collaborators<'a> {
        Collaborators {
            images,
            networks,
            datastores,
            parser: &DEFAULT_PARSER,
            config: CoreConfig::default(),
        }
    }

    pub fn with_parser(mut self, parser: &'a dyn ExpressionParser) -> Collaborators<'a> {
        self.parser = parser;
        self
    }

    pub fn with_config(mut self, config: CoreConfig) -> Collaborators<'a> {
        self.config = config;
        self
    }
}
