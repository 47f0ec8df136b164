use std::path::PathBuf;

use crate::config::DEFAULT_DS_LOCATION;

use super::{assert_not_none, Builder, BuilderError};

/// Host and system datastore chosen by the scheduler for a VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub hid: i64,
    pub hostname: String,
    pub vmm_mad: String,
    pub vnm_mad: String,
    pub tm_mad: String,
    /// Where datastores are mounted on the host
    pub ds_location: PathBuf,
    pub ds_id: i64,
}

#[derive(Debug, Default)]
pub struct PlacementBuilder {
    host: Option<(i64, String)>,
    drivers: Option<(String, String, String)>,
    ds_location: Option<PathBuf>,
    ds_id: Option<i64>,
}

impl PlacementBuilder {
    pub fn new() -> PlacementBuilder {
        PlacementBuilder::default()
    }

    pub fn with_host(mut self, hid: i64, hostname: &str) -> PlacementBuilder {
        self.host = Some((hid, hostname.to_string()));
        self
    }

    /// Virtualization, networking and transfer drivers of the host
    pub fn with_drivers(mut self, vmm: &str, vnm: &str, tm: &str) -> PlacementBuilder {
        self.drivers = Some((vmm.to_string(), vnm.to_string(), tm.to_string()));
        self
    }

    pub fn with_datastore(mut self, location: impl Into<PathBuf>, ds_id: i64) -> PlacementBuilder {
        self.ds_location = Some(location.into());
        self.ds_id = Some(ds_id);
        self
    }

    /// System datastore mounted at the default location
    pub fn with_datastore_id(mut self, ds_id: i64) -> PlacementBuilder {
        self.ds_id = Some(ds_id);
        self
    }
}

impl Builder<Placement> for PlacementBuilder {
    fn try_build(self) -> Result<Placement, BuilderError> {
        let (hid, hostname) = assert_not_none(stringify!(self.host), self.host)?;
        let (vmm_mad, vnm_mad, tm_mad) = assert_not_none(stringify!(self.drivers), self.drivers)?;
        let ds_id = assert_not_none(stringify!(self.ds_id), self.ds_id)?;
        if hostname.is_empty() {
            return Err(BuilderError::InvalidField(stringify!(self.host).to_string()));
        }

        Ok(Placement {
            hid,
            hostname,
            vmm_mad,
            vnm_mad,
            tm_mad,
            ds_location: self
                .ds_location
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DS_LOCATION)),
            ds_id,
        })
    }
}
