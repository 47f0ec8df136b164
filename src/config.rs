//! # Core settings
//!
//! Values the VM record needs from the daemon configuration. They all have
//! defaults, and [CoreConfig::from_env] lets a deployment override them
//! through environment variables:
//!
//! - `NIMBUS_VNC_BASE_PORT`: first VNC port, a VM gets `base + id`
//! - `NIMBUS_DS_LOCATION`: where datastores are mounted on the hosts
//! - `NIMBUS_NAME_PREFIX`: prefix of generated VM names
use std::{env::var_os, path::PathBuf};

use tracing::warn;

pub const DEFAULT_VNC_BASE_PORT: u32 = 5900;
pub const DEFAULT_DS_LOCATION: &str = "/var/lib/one/datastores";
pub const DEFAULT_NAME_PREFIX: &str = "one";
pub const MAX_NAME_LENGTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    pub vnc_base_port: u32,
    pub ds_location: PathBuf,
    /// Used to name VMs whose template has neither NAME nor TEMPLATE_NAME
    pub default_name_prefix: String,
    pub max_name_length: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            vnc_base_port: DEFAULT_VNC_BASE_PORT,
            ds_location: PathBuf::from(DEFAULT_DS_LOCATION),
            default_name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            max_name_length: MAX_NAME_LENGTH,
        }
    }
}

impl CoreConfig {
    /// Default configuration overridden by the `NIMBUS_*` variables which are
    /// set. Invalid values are reported and ignored.
    pub fn from_env() -> CoreConfig {
        let mut config = CoreConfig::default();

        if let Some(port) = var_os("NIMBUS_VNC_BASE_PORT") {
            match port.to_str().and_then(|p| p.parse::<u32>().ok()) {
                Some(port) => config.vnc_base_port = port,
                None => warn!(
                    "NIMBUS_VNC_BASE_PORT is set but is not a valid port: {:?}",
                    port
                ),
            }
        }

        if let Some(location) = var_os("NIMBUS_DS_LOCATION") {
            if location.is_empty() {
                warn!("NIMBUS_DS_LOCATION is set but empty");
            } else {
                config.ds_location = PathBuf::from(location);
            }
        }

        if let Some(prefix) = var_os("NIMBUS_NAME_PREFIX") {
            match prefix.into_string() {
                Ok(prefix) if !prefix.is_empty() => config.default_name_prefix = prefix,
                Ok(_) => warn!("NIMBUS_NAME_PREFIX is set but empty"),
                Err(prefix) => warn!("NIMBUS_NAME_PREFIX is not valid unicode: {:?}", prefix),
            }
        }

        config
    }
}
