//! Validation and expansion of the VM template done at admission.
use nimbus_models::models::{Attribute, ImageType, VectorAttribute};
use tracing::{debug, trace};

use crate::config::CoreConfig;
use crate::parser::{parse_file_attribute, parse_template_attribute, ParseScope};
use crate::pool::Collaborators;

use super::{VirtualMachine, VmError, MAX_MEMORY};

impl VirtualMachine {
    fn parse_scope<'a>(&'a self, ctx: &Collaborators<'a>) -> ParseScope<'a> {
        ParseScope {
            vm_id: self.oid,
            uid: self.uid,
            template: &self.template,
            images: ctx.images,
        }
    }

    /// Sets `VMID`, defaults `NAME` and checks the capacity attributes
    pub(crate) fn prepare_template(&mut self, config: &CoreConfig) -> Result<(), VmError> {
        self.template.replace("VMID", self.oid);

        let name = match self.template.get_string("NAME").map(str::to_string) {
            Some(name) if name.len() > config.max_name_length => {
                return Err(VmError::Validation(format!(
                    "NAME is too long; max length is {} chars.",
                    config.max_name_length
                )))
            }
            Some(name) => name,
            None => {
                let prefix = self
                    .template
                    .get_string("TEMPLATE_NAME")
                    .map(str::to_string)
                    .unwrap_or_else(|| config.default_name_prefix.clone());
                let name = format!("{}-{}", prefix, self.oid);
                self.template.replace("NAME", &name);
                name
            }
        };
        self.name = name;

        match self.template.get_parsed::<i64>("MEMORY") {
            Some(memory) if memory > 0 && memory as u64 <= MAX_MEMORY => {}
            Some(memory) if memory > 0 => {
                return Err(VmError::Validation(format!(
                    "MEMORY attribute cannot exceed {} MB.",
                    MAX_MEMORY
                )))
            }
            _ => {
                return Err(VmError::Validation(
                    "MEMORY attribute must be a positive integer value.".to_string(),
                ))
            }
        }

        if !matches!(self.template.get_parsed::<f32>("CPU"), Some(cpu) if cpu > 0.0) {
            return Err(VmError::Validation(
                "CPU attribute must be a positive float or integer value.".to_string(),
            ));
        }

        if self.template.get_string("VCPU").is_some()
            && !matches!(self.template.get_parsed::<i64>("VCPU"), Some(vcpu) if vcpu > 0)
        {
            return Err(VmError::Validation(
                "VCPU attribute must be a positive integer value.".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolves the `KERNEL_DS` and `INITRD_DS` files of the OS attribute
    pub fn parse_os(&mut self, ctx: &Collaborators<'_>) -> Result<(), VmError> {
        match self.template.count("OS") {
            0 => return Ok(()),
            1 => {}
            _ => {
                return Err(VmError::Validation(
                    "Only one OS attribute can be defined.".to_string(),
                ))
            }
        }

        let mut os = self
            .template
            .vector("OS")
            .ok()
            .flatten()
            .cloned()
            .ok_or_else(|| VmError::Internal("Internal error parsing OS attribute.".to_string()))?;

        self.set_os_file(ctx, &mut os, "KERNEL", ImageType::Kernel)?;
        self.set_os_file(ctx, &mut os, "INITRD", ImageType::Ramdisk)?;

        if let Some(target) = self.template.vector_mut("OS")? {
            *target = os;
        }
        Ok(())
    }

    fn set_os_file(
        &self,
        ctx: &Collaborators<'_>,
        os: &mut VectorAttribute,
        base: &str,
        expected: ImageType,
    ) -> Result<(), VmError> {
        let attribute = format!("{}_DS", base);
        let value = match os.get(&attribute) {
            Some(value) => value.to_string(),
            None => return Ok(()),
        };

        let ids = parse_file_attribute(ctx.parser, &self.parse_scope(ctx), &attribute, &value)?;
        let image_id = match ids.as_slice() {
            [image_id] => *image_id,
            _ => {
                return Err(VmError::Validation(format!(
                    "Only one FILE variable can be used in: {}",
                    value
                )))
            }
        };

        let (image_type, datastore_id) = {
            let image = ctx.images.get(image_id).ok_or_else(|| {
                VmError::NotFound(format!("Image no longer exists in attribute: {}", value))
            })?;

            os.remove(base);
            os.replace(&format!("{}_DS_ID", base), image.id);
            os.replace(&format!("{}_DS_SOURCE", base), &image.source);
            os.replace(&format!("{}_DS_DSID", base), image.datastore_id);

            (image.image_type, image.datastore_id)
        };

        if image_type != expected {
            return Err(VmError::Validation(format!(
                "{} needs an image of type {} and not {}",
                base, expected, image_type
            )));
        }

        let datastore = ctx.datastores.get(datastore_id).ok_or_else(|| {
            VmError::NotFound("Associated datastore for image does not exist".to_string())
        })?;

        os.replace(&format!("{}_DS_TM", base), &datastore.tm_mad);
        if let Some(cluster_id) = datastore.cluster_id {
            os.replace(&format!("{}_DS_CLUSTER_ID", base), cluster_id);
        }

        trace!("{} of VM {} resolved to image {}", base, self.oid, image_id);
        Ok(())
    }

    /// Expands the CONTEXT variables and resolves its `FILES_DS` images
    pub fn parse_context(&mut self, ctx: &Collaborators<'_>) -> Result<(), VmError> {
        match self.template.count("CONTEXT") {
            0 => return Ok(()),
            1 => {}
            _ => {
                return Err(VmError::Validation(
                    "Only one CONTEXT attribute can be defined.".to_string(),
                ))
            }
        }

        let mut context = self
            .template
            .vector("CONTEXT")
            .ok()
            .flatten()
            .cloned()
            .ok_or_else(|| {
                VmError::Validation("Wrong format for CONTEXT attribute.".to_string())
            })?;
        let files_ds = context.remove("FILES_DS");

        let scope = self.parse_scope(ctx);
        let mut parsed = VectorAttribute::new("CONTEXT");
        for (key, value) in context.iter() {
            parsed.replace(key, parse_template_attribute(ctx.parser, &scope, key, value)?);
        }

        if let Some(files_ds) = files_ds.filter(|files| !files.trim().is_empty()) {
            let mut sources = Vec::new();
            for image_id in parse_file_attribute(ctx.parser, &scope, "FILES_DS", &files_ds)? {
                if let Some(image) = ctx.images.get(image_id) {
                    if image.image_type != ImageType::Context {
                        return Err(VmError::Validation(
                            "Only images of type CONTEXT can be used in FILE_DS attribute."
                                .to_string(),
                        ));
                    }
                    sources.push(image.source.clone());
                }
            }

            if !sources.is_empty() {
                parsed.replace("FILES_DS", sources.join(" "));
            }
        }

        if let Some(target) = self.template.vector_mut("CONTEXT")? {
            *target = parsed;
        }
        Ok(())
    }

    /// Expands the REQUIREMENTS expression
    pub fn parse_requirements(&mut self, ctx: &Collaborators<'_>) -> Result<(), VmError> {
        match self.template.count("REQUIREMENTS") {
            0 => return Ok(()),
            1 => {}
            _ => {
                return Err(VmError::Validation(
                    "Only one REQUIREMENTS attribute can be defined.".to_string(),
                ))
            }
        }

        let requirements = match self.template.get("REQUIREMENTS").next().map(Attribute::as_single) {
            Some(Ok(requirements)) => requirements.to_string(),
            _ => {
                return Err(VmError::Validation(
                    "Wrong format for REQUIREMENTS attribute.".to_string(),
                ))
            }
        };

        let parsed = parse_template_attribute(
            ctx.parser,
            &self.parse_scope(ctx),
            "REQUIREMENTS",
            &requirements,
        )?;
        debug!("REQUIREMENTS of VM {}: {}", self.oid, parsed);
        self.template.replace("REQUIREMENTS", parsed);
        Ok(())
    }

    /// Gives the GRAPHICS attribute a VNC port when it has none
    pub fn parse_graphics(&mut self, config: &CoreConfig) {
        if let Ok(Some(graphics)) = self.template.vector_mut("GRAPHICS") {
            if graphics.get("PORT").is_none() {
                graphics.replace("PORT", i64::from(config.vnc_base_port) + self.oid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pool::memory::{MemoryDatastorePool, MemoryImagePool, MemoryNetworkPool};
    use nimbus_models::models::{Datastore, Image, SingleAttribute, Template};
    use pretty_assertions::assert_eq;

    fn vm(template: Template) -> VirtualMachine {
        VirtualMachine::new(7, 3, 0, "alice", "users", template)
    }

    fn capacity() -> Template {
        Template::new()
            .with(SingleAttribute::new("MEMORY", 512))
            .with(SingleAttribute::new("CPU", 1))
    }

    struct Pools {
        datastores: Arc<MemoryDatastorePool>,
        images: MemoryImagePool,
        networks: MemoryNetworkPool,
    }

    fn pools() -> Pools {
        let datastores = Arc::new(
            MemoryDatastorePool::new()
                .with_datastore(Datastore::new(2, "files", "ssh").with_cluster(100)),
        );
        let images = MemoryImagePool::new(datastores.clone())
            .with_image(
                Image::new(10, "vmlinuz", ImageType::Kernel, 2)
                    .with_owner(3)
                    .with_source("/files/vmlinuz"),
            )
            .with_image(Image::new(11, "initrd", ImageType::Ramdisk, 2).with_owner(3))
            .with_image(
                Image::new(12, "init.sh", ImageType::Context, 2)
                    .with_owner(3)
                    .with_source("/files/init.sh"),
            )
            .with_image(Image::new(13, "orphan", ImageType::Kernel, 8).with_owner(3));
        Pools {
            datastores,
            images,
            networks: MemoryNetworkPool::new(),
        }
    }

    #[test]
    fn default_name() {
        let mut vm = vm(capacity());
        vm.prepare_template(&CoreConfig::default()).unwrap();
        assert_eq!(vm.name(), "one-7");
        assert_eq!(vm.template().get_string("VMID"), Some("7"));

        let mut vm = self::vm(capacity().with(SingleAttribute::new("TEMPLATE_NAME", "web")));
        vm.prepare_template(&CoreConfig::default()).unwrap();
        assert_eq!(vm.name(), "web-7");
    }

    #[test]
    fn invalid_capacity() {
        let config = CoreConfig::default();
        let cases = vec![
            (
                Template::new().with(SingleAttribute::new("NAME", "x".repeat(129))),
                "NAME is too long; max length is 128 chars.",
            ),
            (
                Template::new().with(SingleAttribute::new("CPU", 1)),
                "MEMORY attribute must be a positive integer value.",
            ),
            (
                Template::new()
                    .with(SingleAttribute::new("MEMORY", 512))
                    .with(SingleAttribute::new("CPU", "-1")),
                "CPU attribute must be a positive float or integer value.",
            ),
            (
                capacity().with(SingleAttribute::new("VCPU", "two")),
                "VCPU attribute must be a positive integer value.",
            ),
        ];
        let mut cases: Vec<(Template, String)> = cases
            .into_iter()
            .map(|(template, message)| (template, message.to_string()))
            .collect();
        cases.push((
            Template::new()
                .with(SingleAttribute::new("MEMORY", i64::MAX))
                .with(SingleAttribute::new("CPU", 1)),
            format!("MEMORY attribute cannot exceed {} MB.", MAX_MEMORY),
        ));

        for (template, message) in cases {
            let mut vm = vm(template);
            assert_eq!(
                vm.prepare_template(&config),
                Err(VmError::Validation(message))
            );
        }
    }

    #[test]
    fn os_files_are_resolved() {
        let pools = pools();
        let ctx = Collaborators::new(&pools.images, &pools.networks, &*pools.datastores);
        let mut vm = vm(capacity().with(
            VectorAttribute::new("OS")
                .with("KERNEL", "/boot/vmlinuz")
                .with("KERNEL_DS", "$FILE[IMAGE=vmlinuz]")
                .with("INITRD_DS", "$FILE[IMAGE_ID=11]"),
        ));

        vm.parse_os(&ctx).unwrap();

        let os = vm.template().vector("OS").unwrap().unwrap();
        assert_eq!(os.get("KERNEL"), None);
        assert_eq!(os.get("KERNEL_DS_ID"), Some("10"));
        assert_eq!(os.get("KERNEL_DS_SOURCE"), Some("/files/vmlinuz"));
        assert_eq!(os.get("KERNEL_DS_DSID"), Some("2"));
        assert_eq!(os.get("KERNEL_DS_TM"), Some("ssh"));
        assert_eq!(os.get("KERNEL_DS_CLUSTER_ID"), Some("100"));
        assert_eq!(os.get("INITRD_DS_ID"), Some("11"));
    }

    #[test]
    fn os_errors() {
        let pools = pools();
        let ctx = Collaborators::new(&pools.images, &pools.networks, &*pools.datastores);
        let cases = vec![
            (
                capacity()
                    .with(VectorAttribute::new("OS"))
                    .with(VectorAttribute::new("OS")),
                VmError::Validation("Only one OS attribute can be defined.".to_string()),
            ),
            (
                capacity().with(
                    VectorAttribute::new("OS")
                        .with("KERNEL_DS", "$FILE[IMAGE_ID=10] $FILE[IMAGE_ID=11]"),
                ),
                VmError::Validation(
                    "Only one FILE variable can be used in: $FILE[IMAGE_ID=10] $FILE[IMAGE_ID=11]"
                        .to_string(),
                ),
            ),
            (
                capacity().with(VectorAttribute::new("OS").with("KERNEL_DS", "$FILE[IMAGE_ID=99]")),
                VmError::NotFound(
                    "Image no longer exists in attribute: $FILE[IMAGE_ID=99]".to_string(),
                ),
            ),
            (
                capacity().with(VectorAttribute::new("OS").with("KERNEL_DS", "$FILE[IMAGE_ID=11]")),
                VmError::Validation("KERNEL needs an image of type KERNEL and not RAMDISK".to_string()),
            ),
            (
                capacity().with(VectorAttribute::new("OS").with("KERNEL_DS", "$FILE[IMAGE_ID=13]")),
                VmError::NotFound("Associated datastore for image does not exist".to_string()),
            ),
        ];

        for (template, expected) in cases {
            let mut vm = vm(template);
            assert_eq!(vm.parse_os(&ctx), Err(expected));
        }
    }

    #[test]
    fn context_is_expanded() {
        let pools = pools();
        let ctx = Collaborators::new(&pools.images, &pools.networks, &*pools.datastores);
        let mut vm = vm(capacity()
            .with(SingleAttribute::new("NAME", "web"))
            .with(
                VectorAttribute::new("CONTEXT")
                    .with("HOSTNAME", "$NAME")
                    .with("FILES_DS", "$FILE[IMAGE=\"init.sh\"]"),
            ));

        vm.parse_context(&ctx).unwrap();

        let context = vm.template().vector("CONTEXT").unwrap().unwrap();
        assert_eq!(context.get("HOSTNAME"), Some("web"));
        assert_eq!(context.get("FILES_DS"), Some("/files/init.sh"));
    }

    #[test]
    fn context_files_must_be_context_images() {
        let pools = pools();
        let ctx = Collaborators::new(&pools.images, &pools.networks, &*pools.datastores);
        let mut vm = vm(capacity().with(
            VectorAttribute::new("CONTEXT").with("FILES_DS", "$FILE[IMAGE_ID=10]"),
        ));
        assert_eq!(
            vm.parse_context(&ctx),
            Err(VmError::Validation(
                "Only images of type CONTEXT can be used in FILE_DS attribute.".to_string()
            ))
        );

        let mut vm = self::vm(capacity().with(SingleAttribute::new("CONTEXT", "flat")));
        assert_eq!(
            vm.parse_context(&ctx),
            Err(VmError::Validation(
                "Wrong format for CONTEXT attribute.".to_string()
            ))
        );
    }

    #[test]
    fn requirements_are_parsed() {
        let pools = pools();
        let ctx = Collaborators::new(&pools.images, &pools.networks, &*pools.datastores);
        let mut vm = vm(capacity()
            .with(SingleAttribute::new("ARCH", "x86_64"))
            .with(SingleAttribute::new("REQUIREMENTS", "ARCH = \"$ARCH\"")));
        vm.parse_requirements(&ctx).unwrap();
        assert_eq!(
            vm.template().get_string("REQUIREMENTS"),
            Some("ARCH = \"x86_64\"")
        );

        let mut vm = self::vm(capacity().with(VectorAttribute::new("REQUIREMENTS")));
        assert_eq!(
            vm.parse_requirements(&ctx),
            Err(VmError::Validation(
                "Wrong format for REQUIREMENTS attribute.".to_string()
            ))
        );
    }

    #[test]
    fn graphics_port_defaults_to_base_plus_id() {
        let mut vm = vm(capacity()
            .with(VectorAttribute::new("GRAPHICS").with("TYPE", "vnc")));
        vm.parse_graphics(&CoreConfig::default());
        assert_eq!(
            vm.template().vector("GRAPHICS").unwrap().unwrap().get("PORT"),
            Some("5907")
        );

        let mut vm = self::vm(capacity().with(
            VectorAttribute::new("GRAPHICS")
                .with("TYPE", "vnc")
                .with("PORT", 6000),
        ));
        vm.parse_graphics(&CoreConfig::default());
        assert_eq!(
            vm.template().vector("GRAPHICS").unwrap().unwrap().get("PORT"),
            Some("6000")
        );
    }
}
