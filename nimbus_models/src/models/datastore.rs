/// Storage backend holding images, reached through a transfer driver
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datastore {
    pub id: i64,
    pub name: String,
    /// Transfer manager driver used to move images to hosts
    pub tm_mad: String,
    pub base_path: String,
    /// Cluster the datastore belongs to, `None` when shared by every cluster
    pub cluster_id: Option<i64>,
}

impl Datastore {
    pub fn new(id: i64, name: &str, tm_mad: &str) -> Datastore {
        Datastore {
            id,
            name: name.to_string(),
            tm_mad: tm_mad.to_string(),
            base_path: format!("/var/lib/one/datastores/{}", id),
            cluster_id: None,
        }
    }

    pub fn with_cluster(mut self, cluster_id: i64) -> Datastore {
        self.cluster_id = Some(cluster_id);
        self
    }
}
