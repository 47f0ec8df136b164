use std::net::Ipv4Addr;

use nimbus_models::models::VectorAttribute;

use super::{assert_not_none, Builder, BuilderError};

#[derive(Debug, Default)]
pub struct NicBuilder {
    network_id: Option<i64>,
    network: Option<String>,
    network_uid: Option<i64>,
    ip: Option<Ipv4Addr>,
    model: Option<String>,
}

impl NicBuilder {
    pub fn new() -> NicBuilder {
        NicBuilder::default()
    }

    pub fn with_network_id(mut self, network_id: i64) -> NicBuilder {
        self.network_id = Some(network_id);
        self
    }

    pub fn with_network(mut self, network: String) -> NicBuilder {
        self.network = Some(network);
        self
    }

    pub fn with_network_uid(mut self, network_uid: i64) -> NicBuilder {
        self.network_uid = Some(network_uid);
        self
    }

    /// Asks for this address instead of the first free one
    pub fn with_ip(mut self, ip: Ipv4Addr) -> NicBuilder {
        self.ip = Some(ip);
        self
    }

    pub fn with_model(mut self, model: String) -> NicBuilder {
        self.model = Some(model);
        self
    }
}

impl Builder<VectorAttribute> for NicBuilder {
    fn try_build(self) -> Result<VectorAttribute, BuilderError> {
        let mut nic = VectorAttribute::new("NIC");

        match self.network_id {
            Some(network_id) => nic.replace("NETWORK_ID", network_id),
            None => {
                nic.replace(
                    "NETWORK",
                    assert_not_none(stringify!(self.network), self.network)?,
                );
                if let Some(network_uid) = self.network_uid {
                    nic.replace("NETWORK_UID", network_uid);
                }
            }
        }

        if let Some(ip) = self.ip {
            nic.replace("IP", ip);
        }
        if let Some(model) = self.model {
            nic.replace("MODEL", model);
        }
        Ok(nic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nic_builder() {
        let nic = NicBuilder::new()
            .with_network("private".to_string())
            .with_network_uid(2)
            .with_ip(Ipv4Addr::new(10, 0, 0, 5))
            .with_model("virtio".to_string())
            .try_build()
            .unwrap();
        assert_eq!(nic.get("NETWORK"), Some("private"));
        assert_eq!(nic.get("NETWORK_UID"), Some("2"));
        assert_eq!(nic.get("IP"), Some("10.0.0.5"));
        assert_eq!(nic.get("MODEL"), Some("virtio"));
    }

    #[test]
    #[should_panic]
    fn test_nic_incomplete() {
        let _ = NicBuilder::new().try_build().unwrap();
    }

    #[test]
    #[should_panic]
    fn test_nic_no_network() {
        let _ = NicBuilder::new()
            .with_ip(Ipv4Addr::new(10, 0, 0, 5))
            .try_build()
            .unwrap();
    }
}
