pub mod attribute;
pub use self::attribute::{Attribute, AttributeError, SingleAttribute, VectorAttribute};
pub mod datastore;
pub use self::datastore::Datastore;
pub mod image;
pub use self::image::{Image, ImageState, ImageType};
pub mod network;
pub use self::network::{Lease, VirtualNetwork};
pub mod template;
pub use self::template::Template;
