use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// MAC prefix used to derive a lease MAC address from its IP
pub const MAC_PREFIX: &str = "02:00";

/// An address of a virtual network held by a VM
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub vm_id: i64,
}

/// Virtual network with a contiguous range of leasable addresses
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNetwork {
    pub id: i64,
    pub uid: i64,
    pub name: String,
    pub bridge: String,
    pub cluster_id: Option<i64>,
    addresses: Vec<Ipv4Addr>,
    leases: BTreeMap<Ipv4Addr, Lease>,
}

impl VirtualNetwork {
    pub fn new(id: i64, name: &str, bridge: &str) -> VirtualNetwork {
        VirtualNetwork {
            id,
            uid: 0,
            name: name.to_string(),
            bridge: bridge.to_string(),
            cluster_id: None,
            addresses: Vec::new(),
            leases: BTreeMap::new(),
        }
    }

    /// Adds `size` consecutive addresses starting at `first`
    pub fn with_range(mut self, first: Ipv4Addr, size: u32) -> VirtualNetwork {
        let first = u32::from(first);
        self.addresses
            .extend((0..size).map(|offset| Ipv4Addr::from(first.wrapping_add(offset))));
        self
    }

    pub fn with_cluster(mut self, cluster_id: i64) -> VirtualNetwork {
        self.cluster_id = Some(cluster_id);
        self
    }

    pub fn mac_for(ip: Ipv4Addr) -> String {
        let [a, b, c, d] = ip.octets();
        format!("{}:{:02x}:{:02x}:{:02x}:{:02x}", MAC_PREFIX, a, b, c, d)
    }

    /// Leases the requested address, or the first free one, to `vm_id`
    pub fn get_lease(&mut self, vm_id: i64, requested: Option<Ipv4Addr>) -> Option<Lease> {
        let ip = match requested {
            Some(ip) if self.addresses.contains(&ip) && !self.leases.contains_key(&ip) => ip,
            Some(_) => return None,
            None => *self
                .addresses
                .iter()
                .find(|ip| !self.leases.contains_key(ip))?,
        };
        let lease = Lease {
            ip,
            mac: Self::mac_for(ip),
            vm_id,
        };
        self.leases.insert(ip, lease.clone());
        Some(lease)
    }

    /// Whether `ip` is currently leased to `vm_id`
    pub fn is_owner(&self, ip: &str, vm_id: i64) -> bool {
        ip.parse::<Ipv4Addr>()
            .ok()
            .and_then(|ip| self.leases.get(&ip))
            .map_or(false, |lease| lease.vm_id == vm_id)
    }

    pub fn release_lease(&mut self, ip: &str) -> Option<Lease> {
        let ip = ip.parse::<Ipv4Addr>().ok()?;
        self.leases.remove(&ip)
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    pub fn free_addresses(&self) -> usize {
        self.addresses.len() - self.leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn network() -> VirtualNetwork {
        VirtualNetwork::new(0, "private", "br0").with_range(Ipv4Addr::new(10, 0, 0, 5), 2)
    }

    #[test]
    fn leases_in_range_order() {
        let mut network = network();
        let first = network.get_lease(42, None).unwrap();
        let second = network.get_lease(42, None).unwrap();
        assert_eq!(first.ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(first.mac, "02:00:0a:00:00:05");
        assert_eq!(second.ip, Ipv4Addr::new(10, 0, 0, 6));
        assert!(network.get_lease(42, None).is_none());
    }

    #[test]
    fn requested_address_must_be_free() {
        let mut network = network();
        assert!(network
            .get_lease(1, Some(Ipv4Addr::new(10, 0, 0, 6)))
            .is_some());
        assert!(network
            .get_lease(2, Some(Ipv4Addr::new(10, 0, 0, 6)))
            .is_none());
        assert!(network
            .get_lease(2, Some(Ipv4Addr::new(192, 168, 0, 1)))
            .is_none());
    }

    #[test]
    fn ownership() {
        let mut network = network();
        network.get_lease(42, None);
        assert!(network.is_owner("10.0.0.5", 42));
        assert!(!network.is_owner("10.0.0.5", 99));
        assert!(!network.is_owner("not an ip", 42));
        assert!(network.release_lease("10.0.0.5").is_some());
        assert!(!network.is_owner("10.0.0.5", 42));
        assert_eq!(network.free_addresses(), 2);
    }
}
