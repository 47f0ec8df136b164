//! # VM Template Builder Pattern
//!
//! This module provides a builder pattern to make writing VM templates
//! easier. For each component, all fields are optional and are validated once
//! you run the [`Builder::try_build`] method. Once the build is successful the
//! resulting attribute can be added to a [Configuration], which builds the
//! [Template] handed to [VirtualMachine::new](crate::vm::VirtualMachine::new).
//!
//! ## Example
//!
//! ```rust
//! use nimbus::builder::{Builder, Configuration};
//! use nimbus::builder::{disk::DiskBuilder, nic::NicBuilder, os::OsBuilder};
//!
//! // Boot from a kernel stored in a files datastore
//! let os = OsBuilder::new()
//!     .with_kernel_image_id(4)
//!     .with_boot_args("console=ttyS0".to_string())
//!     .try_build()
//!     .unwrap();
//! // Root disk, its target is picked when the VM is admitted
//! let root = DiskBuilder::new()
//!     .with_image("debian".to_string())
//!     .try_build()
//!     .unwrap();
//! let nic = NicBuilder::new()
//!     .with_network_id(0)
//!     .try_build()
//!     .unwrap();
//! let template = Configuration::new()
//!     .with_name("web".to_string())
//!     .with_memory(512)
//!     .with_cpu(0.5)
//!     .with_os(os)
//!     .with_disk(root)
//!     .with_nic(nic)
//!     .with_context("HOSTNAME", "$NAME".to_string())
//!     .try_build()
//!     .unwrap();
//! assert_eq!(template.get_string("MEMORY"), Some("512"));
//! ```
use nimbus_models::models::{SingleAttribute, Template, VectorAttribute};

pub mod disk;
pub mod nic;
pub mod os;
pub mod placement;

fn assert_not_none<T>(key: &str, value: Option<T>) -> Result<T, BuilderError> {
    value.ok_or_else(|| BuilderError::MissingRequiredField(key.to_string()))
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuilderError {
    /// The field is required but was not provided in the builder object
    MissingRequiredField(String),
    /// The field was provided with a value the template cannot hold
    InvalidField(String),
}

/// Generic trait which all builder components must implement in order to be
/// part of [Configuration]
pub trait Builder<T> {
    /// Validate all the fields from the builder object and apply it to the
    /// final object
    ///
    /// ## Example
    ///
    /// ```rust
    /// use nimbus::builder::Builder;
    /// use nimbus::builder::nic::NicBuilder;
    ///
    /// NicBuilder::new()
    ///     .with_network("private".to_string())
    ///     .try_build()
    ///     .unwrap();
    /// ```
    fn try_build(self) -> Result<T, BuilderError>;
}

/// VM template under construction, when using the [Builder] the final object
/// is a [Template].
#[derive(Debug, Default)]
pub struct Configuration {
    pub name: Option<String>,
    pub memory: Option<u64>,
    pub cpu: Option<f32>,
    pub vcpu: Option<u32>,
    pub os: Option<VectorAttribute>,
    pub disks: Vec<VectorAttribute>,
    pub nics: Vec<VectorAttribute>,
    pub context: Option<VectorAttribute>,
    pub requirements: Option<String>,
    pub graphics: Option<VectorAttribute>,
}

impl Configuration {
    pub fn new() -> Configuration {
        Configuration::default()
    }

    pub fn with_name(mut self, name: String) -> Configuration {
        self.name = Some(name);
        self
    }

    /// Memory in MiB
    pub fn with_memory(mut self, memory: u64) -> Configuration {
        self.memory = Some(memory);
        self
    }

    /// Share of physical CPU, 1.0 being a whole CPU
    pub fn with_cpu(mut self, cpu: f32) -> Configuration {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_vcpu(mut self, vcpu: u32) -> Configuration {
        self.vcpu = Some(vcpu);
        self
    }

    pub fn with_os(mut self, os: VectorAttribute) -> Configuration {
        self.os = Some(os);
        self
    }

    pub fn with_disk(mut self, disk: VectorAttribute) -> Configuration {
        self.disks.push(disk);
        self
    }

    pub fn with_nic(mut self, nic: VectorAttribute) -> Configuration {
        self.nics.push(nic);
        self
    }

    /// Adds a context variable, expressions are expanded at admission
    pub fn with_context(mut self, key: &str, value: String) -> Configuration {
        self.context
            .get_or_insert_with(|| VectorAttribute::new("CONTEXT"))
            .replace(key, value);
        self
    }

    pub fn with_requirements(mut self, requirements: String) -> Configuration {
        self.requirements = Some(requirements);
        self
    }

    /// VNC console, its port is picked at admission
    pub fn with_vnc(mut self) -> Configuration {
        self.graphics = Some(
            VectorAttribute::new("GRAPHICS")
                .with("TYPE", "vnc")
                .with("LISTEN", "0.0.0.0"),
        );
        self
    }
}

impl Builder<Template> for Configuration {
    fn try_build(self) -> Result<Template, BuilderError> {
        let memory = assert_not_none(stringify!(self.memory), self.memory)?;
        let cpu = assert_not_none(stringify!(self.cpu), self.cpu)?;
        if memory == 0 {
            return Err(BuilderError::InvalidField(stringify!(self.memory).to_string()));
        }
        if !(cpu > 0.0) {
            return Err(BuilderError::InvalidField(stringify!(self.cpu).to_string()));
        }

        let mut template = Template::new();
        if let Some(name) = self.name {
            template.set(SingleAttribute::new("NAME", name));
        }
        template.set(SingleAttribute::new("MEMORY", memory));
        template.set(SingleAttribute::new("CPU", cpu));
        if let Some(vcpu) = self.vcpu {
            template.set(SingleAttribute::new("VCPU", vcpu));
        }

        let vectors = self
            .os
            .into_iter()
            .chain(self.disks)
            .chain(self.nics)
            .chain(self.context)
            .chain(self.graphics);
        for vector in vectors {
            template.set(vector);
        }

        if let Some(requirements) = self.requirements {
            template.set(SingleAttribute::new("REQUIREMENTS", requirements));
        }
        Ok(template)
    }
}
