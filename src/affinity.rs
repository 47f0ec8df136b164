//! # Cluster affinity
//!
//! Disks, kernel files and networks each belong to at most one cluster. A VM
//! can only run where all of them are reachable, so the clusters they report
//! must agree and the VM requirements are narrowed down to that cluster.
use nimbus_models::models::{Template, VectorAttribute};
use tracing::debug;

use crate::vm::{VirtualMachine, VmError};

#[derive(Debug, Default)]
struct ClusterResolver {
    cluster_id: Option<String>,
}

impl ClusterResolver {
    /// Takes the cluster set in `key`, false if it differs from the one
    /// already found
    fn check(&mut self, vector: &VectorAttribute, key: &str) -> bool {
        let id = match vector.get(key) {
            Some(id) => id,
            None => return true,
        };

        if let Some(cluster_id) = &self.cluster_id {
            return cluster_id == id;
        }
        self.cluster_id = Some(id.to_string());
        true
    }

    fn cluster(&self) -> &str {
        self.cluster_id.as_deref().unwrap_or_default()
    }
}

fn vectors<'a>(template: &'a Template, name: &'a str) -> impl Iterator<Item = (usize, &'a VectorAttribute)> + 'a {
    template
        .get(name)
        .enumerate()
        .filter_map(|(i, attribute)| attribute.as_vector().ok().map(|vector| (i, vector)))
}

/// Cluster shared by every resource of `template`, `None` when no resource
/// is bound to a cluster
pub fn resolve_cluster(template: &Template) -> Result<Option<String>, VmError> {
    let mut resolver = ClusterResolver::default();

    for (i, disk) in vectors(template, "DISK") {
        if !resolver.check(disk, "CLUSTER_ID") {
            return Err(VmError::Conflict(format!(
                "Incompatible clusters in DISK. Datastore for DISK {} is not the same as the one used by other VM elements (cluster {})",
                i,
                resolver.cluster()
            )));
        }
    }

    if let Some((_, os)) = vectors(template, "OS").next() {
        if !resolver.check(os, "KERNEL_DS_CLUSTER_ID") {
            return Err(VmError::Conflict(format!(
                "Incompatible cluster in KERNEL datastore, it should be in cluster {}.",
                resolver.cluster()
            )));
        }

        if !resolver.check(os, "INITRD_DS_CLUSTER_ID") {
            return Err(VmError::Conflict(format!(
                "Incompatible cluster in INITRD datastore, it should be in cluster {}.",
                resolver.cluster()
            )));
        }
    }

    for (i, nic) in vectors(template, "NIC") {
        if !resolver.check(nic, "CLUSTER_ID") {
            return Err(VmError::Conflict(format!(
                "Incompatible clusters in NIC. Network for NIC {} is not the same as the one used by other VM elements (cluster {})",
                i,
                resolver.cluster()
            )));
        }
    }

    Ok(resolver.cluster_id)
}

/// Placement expression restricting `requirements` to `cluster_id`
pub fn requirements_expression(cluster_id: &str, requirements: Option<&str>) -> String {
    match requirements {
        Some(requirements) => format!("CLUSTER_ID = {} & ( {} )", cluster_id, requirements),
        None => format!("CLUSTER_ID = {}", cluster_id),
    }
}

impl VirtualMachine {
    /// Narrows `REQUIREMENTS` down to the cluster of the VM resources. The
    /// template is left untouched when the resources disagree.
    pub fn automatic_requirements(&mut self) -> Result<(), VmError> {
        if let Some(cluster_id) = resolve_cluster(&self.template)? {
            let requirements =
                requirements_expression(&cluster_id, self.template.get_string("REQUIREMENTS"));
            debug!("VM {} bound to cluster {}", self.oid, cluster_id);
            self.template.replace("REQUIREMENTS", requirements);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_models::models::SingleAttribute;
    use pretty_assertions::assert_eq;

    fn disk(cluster: Option<i64>) -> VectorAttribute {
        match cluster {
            Some(cluster) => VectorAttribute::new("DISK").with("CLUSTER_ID", cluster),
            None => VectorAttribute::new("DISK"),
        }
    }

    #[test]
    fn single_cluster() {
        let template = Template::new()
            .with(disk(Some(100)))
            .with(disk(None))
            .with(VectorAttribute::new("OS").with("KERNEL_DS_CLUSTER_ID", 100))
            .with(VectorAttribute::new("NIC").with("CLUSTER_ID", 100));
        assert_eq!(resolve_cluster(&template), Ok(Some("100".to_string())));
        assert_eq!(resolve_cluster(&Template::new()), Ok(None));
    }

    #[test]
    fn conflicts_name_the_resource() {
        let template = Template::new().with(disk(Some(100))).with(disk(Some(101)));
        assert_eq!(
            resolve_cluster(&template),
            Err(VmError::Conflict(
                "Incompatible clusters in DISK. Datastore for DISK 1 is not the same as the one used by other VM elements (cluster 100)".to_string()
            ))
        );

        let template = Template::new()
            .with(disk(Some(100)))
            .with(VectorAttribute::new("OS").with("INITRD_DS_CLUSTER_ID", 101));
        assert_eq!(
            resolve_cluster(&template),
            Err(VmError::Conflict(
                "Incompatible cluster in INITRD datastore, it should be in cluster 100.".to_string()
            ))
        );

        let template = Template::new()
            .with(VectorAttribute::new("OS").with("KERNEL_DS_CLUSTER_ID", 100))
            .with(VectorAttribute::new("NIC"))
            .with(VectorAttribute::new("NIC").with("CLUSTER_ID", 101));
        assert_eq!(
            resolve_cluster(&template),
            Err(VmError::Conflict(
                "Incompatible clusters in NIC. Network for NIC 1 is not the same as the one used by other VM elements (cluster 100)".to_string()
            ))
        );
    }

    #[test]
    fn expression() {
        assert_eq!(requirements_expression("100", None), "CLUSTER_ID = 100");
        assert_eq!(
            requirements_expression("100", Some("FREE_CPU > 50")),
            "CLUSTER_ID = 100 & ( FREE_CPU > 50 )"
        );
    }

    #[test]
    fn requirements_untouched_on_conflict() {
        let template = Template::new()
            .with(SingleAttribute::new("REQUIREMENTS", "FREE_CPU > 50"))
            .with(disk(Some(100)))
            .with(VectorAttribute::new("NIC").with("CLUSTER_ID", 101));
        let mut vm = VirtualMachine::new(1, 0, 0, "oneadmin", "oneadmin", template);
        assert!(matches!(
            vm.automatic_requirements(),
            Err(VmError::Conflict(_))
        ));
        assert_eq!(
            vm.template().get_string("REQUIREMENTS"),
            Some("FREE_CPU > 50")
        );
    }

    #[test]
    fn requirements_anded_with_cluster() {
        let template = Template::new()
            .with(SingleAttribute::new("REQUIREMENTS", "FREE_CPU > 50"))
            .with(disk(Some(100)));
        let mut vm = VirtualMachine::new(1, 0, 0, "oneadmin", "oneadmin", template);
        vm.automatic_requirements().unwrap();
        assert_eq!(
            vm.template().get_string("REQUIREMENTS"),
            Some("CLUSTER_ID = 100 & ( FREE_CPU > 50 )")
        );
    }
}
