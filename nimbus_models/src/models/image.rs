use std::fmt;
use std::str::FromStr;

/// Image purpose, decides how a disk built from it is targeted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageType {
    Os,
    Cdrom,
    Datablock,
    Kernel,
    Ramdisk,
    Context,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Os => "OS",
            ImageType::Cdrom => "CDROM",
            ImageType::Datablock => "DATABLOCK",
            ImageType::Kernel => "KERNEL",
            ImageType::Ramdisk => "RAMDISK",
            ImageType::Context => "CONTEXT",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OS" => Ok(ImageType::Os),
            "CDROM" => Ok(ImageType::Cdrom),
            "DATABLOCK" => Ok(ImageType::Datablock),
            "KERNEL" => Ok(ImageType::Kernel),
            "RAMDISK" => Ok(ImageType::Ramdisk),
            "CONTEXT" => Ok(ImageType::Context),
            other => Err(format!("Unknown image type {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageState {
    Init,
    Ready,
    Used,
    Disabled,
    Locked,
    Error,
}

/// Disk image registered in an image datastore
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub uid: i64,
    pub name: String,
    pub image_type: ImageType,
    pub state: ImageState,
    /// Persistent images can only be used by one VM at a time
    pub persistent: bool,
    /// Location of the image inside its datastore
    pub source: String,
    pub datastore_id: i64,
    pub dev_prefix: Option<String>,
    /// Number of VMs currently holding a lease on this image
    pub running_vms: u32,
}

impl Image {
    pub fn new(id: i64, name: &str, image_type: ImageType, datastore_id: i64) -> Image {
        Image {
            id,
            uid: 0,
            name: name.to_string(),
            image_type,
            state: ImageState::Ready,
            persistent: false,
            source: format!("{}/{}", datastore_id, name),
            datastore_id,
            dev_prefix: None,
            running_vms: 0,
        }
    }

    pub fn with_owner(mut self, uid: i64) -> Image {
        self.uid = uid;
        self
    }

    pub fn with_source(mut self, source: &str) -> Image {
        self.source = source.to_string();
        self
    }

    pub fn with_dev_prefix(mut self, dev_prefix: &str) -> Image {
        self.dev_prefix = Some(dev_prefix.to_string());
        self
    }

    pub fn as_persistent(mut self) -> Image {
        self.persistent = true;
        self
    }

    /// Whether a new VM can take a lease on this image
    pub fn is_available(&self) -> bool {
        match self.state {
            ImageState::Ready => true,
            ImageState::Used => !self.persistent,
            _ => false,
        }
    }
}
