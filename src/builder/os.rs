use nimbus_models::models::VectorAttribute;

use super::{Builder, BuilderError};

/// OS attribute: kernel, initrd and boot settings
///
/// Kernel and initrd are either a path on the host or a file image, which is
/// resolved when the VM is admitted.
#[derive(Debug, Default)]
pub struct OsBuilder {
    kernel: Option<String>,
    kernel_ds: Option<String>,
    initrd: Option<String>,
    initrd_ds: Option<String>,
    boot_args: Option<String>,
    root: Option<String>,
    boot: Option<String>,
}

fn file_by_id(image_id: i64) -> String {
    format!("$FILE[IMAGE_ID={}]", image_id)
}

fn file_by_name(image: &str) -> String {
    format!("$FILE[IMAGE=\"{}\"]", image)
}

impl OsBuilder {
    pub fn new() -> OsBuilder {
        OsBuilder::default()
    }

    pub fn with_kernel_path(mut self, kernel: String) -> OsBuilder {
        self.kernel = Some(kernel);
        self
    }

    pub fn with_kernel_image_id(mut self, image_id: i64) -> OsBuilder {
        self.kernel_ds = Some(file_by_id(image_id));
        self
    }

    pub fn with_kernel_image(mut self, image: String) -> OsBuilder {
        self.kernel_ds = Some(file_by_name(&image));
        self
    }

    pub fn with_initrd_path(mut self, initrd: String) -> OsBuilder {
        self.initrd = Some(initrd);
        self
    }

    pub fn with_initrd_image_id(mut self, image_id: i64) -> OsBuilder {
        self.initrd_ds = Some(file_by_id(image_id));
        self
    }

    pub fn with_initrd_image(mut self, image: String) -> OsBuilder {
        self.initrd_ds = Some(file_by_name(&image));
        self
    }

    pub fn with_boot_args(mut self, boot_args: String) -> OsBuilder {
        self.boot_args = Some(boot_args);
        self
    }

    /// Root device, e.g. `vda`
    pub fn with_root(mut self, root: String) -> OsBuilder {
        self.root = Some(root);
        self
    }

    pub fn with_boot(mut self, boot: String) -> OsBuilder {
        self.boot = Some(boot);
        self
    }
}

impl Builder<VectorAttribute> for OsBuilder {
    fn try_build(self) -> Result<VectorAttribute, BuilderError> {
        let has_kernel = self.kernel.is_some() || self.kernel_ds.is_some();
        let has_initrd = self.initrd.is_some() || self.initrd_ds.is_some();
        if has_initrd && !has_kernel {
            return Err(BuilderError::MissingRequiredField(
                stringify!(self.kernel).to_string(),
            ));
        }

        let mut os = VectorAttribute::new("OS");
        let values = [
            ("KERNEL", self.kernel),
            ("KERNEL_DS", self.kernel_ds),
            ("INITRD", self.initrd),
            ("INITRD_DS", self.initrd_ds),
            ("KERNEL_CMD", self.boot_args),
            ("ROOT", self.root),
            ("BOOT", self.boot),
        ];
        for (key, value) in values {
            if let Some(value) = value {
                os.replace(key, value);
            }
        }
        Ok(os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_builder() {
        let os = OsBuilder::new()
            .with_kernel_image("vmlinuz".to_string())
            .with_initrd_image_id(11)
            .with_boot_args("console=ttyS0 reboot=k".to_string())
            .with_root("vda".to_string())
            .try_build()
            .unwrap();
        assert_eq!(os.get("KERNEL_DS"), Some("$FILE[IMAGE=\"vmlinuz\"]"));
        assert_eq!(os.get("INITRD_DS"), Some("$FILE[IMAGE_ID=11]"));
        assert_eq!(os.get("KERNEL_CMD"), Some("console=ttyS0 reboot=k"));
        assert_eq!(os.get("ROOT"), Some("vda"));
        assert_eq!(os.get("KERNEL"), None);
    }

    #[test]
    fn test_os_boot_only() {
        let os = OsBuilder::new()
            .with_boot("hd".to_string())
            .try_build()
            .unwrap();
        assert_eq!(os.get("BOOT"), Some("hd"));
    }

    #[test]
    fn test_os_initrd_without_kernel() {
        let os = OsBuilder::new()
            .with_initrd_path("/boot/initrd.img".to_string())
            .try_build();
        assert_eq!(
            os.err().unwrap(),
            BuilderError::MissingRequiredField(stringify!(self.kernel).to_string())
        );
    }
}
