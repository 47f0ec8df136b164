use nimbus_models::models::VectorAttribute;

use super::{Builder, BuilderError};

/// DISK attribute referencing an image, or a volatile disk created on the
/// host
#[derive(Debug, Default)]
pub struct DiskBuilder {
    image_id: Option<i64>,
    image: Option<String>,
    image_uid: Option<i64>,
    target: Option<String>,
    dev_prefix: Option<String>,
    volatile_type: Option<String>,
    size: Option<u64>,
}

impl DiskBuilder {
    pub fn new() -> DiskBuilder {
        DiskBuilder::default()
    }

    pub fn with_image_id(mut self, image_id: i64) -> DiskBuilder {
        self.image_id = Some(image_id);
        self
    }

    /// Image looked up by name, in the images of the VM owner unless
    /// [DiskBuilder::with_image_uid] is used
    pub fn with_image(mut self, image: String) -> DiskBuilder {
        self.image = Some(image);
        self
    }

    pub fn with_image_uid(mut self, image_uid: i64) -> DiskBuilder {
        self.image_uid = Some(image_uid);
        self
    }

    pub fn with_target(mut self, target: String) -> DiskBuilder {
        self.target = Some(target);
        self
    }

    pub fn with_dev_prefix(mut self, dev_prefix: String) -> DiskBuilder {
        self.dev_prefix = Some(dev_prefix);
        self
    }

    /// Volatile disk of `size` MiB, `volatile_type` is `fs` or `swap`
    pub fn as_volatile(mut self, volatile_type: String, size: u64) -> DiskBuilder {
        self.volatile_type = Some(volatile_type);
        self.size = Some(size);
        self
    }
}

impl Builder<VectorAttribute> for DiskBuilder {
    fn try_build(self) -> Result<VectorAttribute, BuilderError> {
        let mut disk = VectorAttribute::new("DISK");

        match (self.image_id, self.image, self.volatile_type) {
            (Some(image_id), _, None) => disk.replace("IMAGE_ID", image_id),
            (None, Some(image), None) => {
                disk.replace("IMAGE", image);
                if let Some(image_uid) = self.image_uid {
                    disk.replace("IMAGE_UID", image_uid);
                }
            }
            (None, None, Some(volatile_type)) => {
                if !matches!(volatile_type.as_str(), "fs" | "swap") {
                    return Err(BuilderError::InvalidField(
                        stringify!(self.volatile_type).to_string(),
                    ));
                }
                disk.replace("TYPE", volatile_type);
                disk.replace("SIZE", self.size.unwrap_or_default());
            }
            (None, None, None) => {
                return Err(BuilderError::MissingRequiredField(
                    stringify!(self.image_id).to_string(),
                ))
            }
            _ => {
                return Err(BuilderError::InvalidField(
                    stringify!(self.volatile_type).to_string(),
                ))
            }
        }

        if let Some(target) = self.target {
            disk.replace("TARGET", target);
        }
        if let Some(dev_prefix) = self.dev_prefix {
            disk.replace("DEV_PREFIX", dev_prefix);
        }
        Ok(disk)
    }
}
