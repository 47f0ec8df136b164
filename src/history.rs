//! # Placement history
//!
//! Every time a VM is placed on a host (deploy, migration, resume) a new
//! [History] record is appended to its chain. Records are never modified
//! once appended: sequence numbers start at 0 and are contiguous, the last
//! record is the current placement and the one before it the previous
//! placement.
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, error, instrument};

use crate::builder::placement::Placement;
use crate::vm::{now, VirtualMachine, VmError};

/// How much of the history chain is carried along a VM snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryDepth {
    None,
    /// Only the current placement
    Last,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub oid: i64,
    pub seq: u32,
    pub hid: i64,
    pub hostname: String,
    pub vmm_mad: String,
    pub vnm_mad: String,
    pub tm_mad: String,
    pub ds_location: PathBuf,
    pub ds_id: i64,
    pub stime: u64,
    /// Snapshot of the VM, without its history, when the record was created
    pub vm_snapshot: String,
}

impl History {
    fn new(oid: i64, seq: u32, placement: &Placement, vm_snapshot: String) -> History {
        History {
            oid,
            seq,
            hid: placement.hid,
            hostname: placement.hostname.clone(),
            vmm_mad: placement.vmm_mad.clone(),
            vnm_mad: placement.vnm_mad.clone(),
            tm_mad: placement.tm_mad.clone(),
            ds_location: placement.ds_location.clone(),
            ds_id: placement.ds_id,
            stime: now(),
            vm_snapshot,
        }
    }

    /// Host and datastore of this record
    pub fn placement(&self) -> Placement {
        Placement {
            hid: self.hid,
            hostname: self.hostname.clone(),
            vmm_mad: self.vmm_mad.clone(),
            vnm_mad: self.vnm_mad.clone(),
            tm_mad: self.tm_mad.clone(),
            ds_location: self.ds_location.clone(),
            ds_id: self.ds_id,
        }
    }

    /// `<ds_location>/<ds_id>/<oid>` on the host
    pub fn system_dir(&self) -> PathBuf {
        self.ds_location
            .join(self.ds_id.to_string())
            .join(self.oid.to_string())
    }

    pub fn context_file(&self) -> PathBuf {
        self.system_dir().join("context.sh")
    }

    pub fn deployment_file(&self) -> PathBuf {
        self.system_dir().join(format!("deployment.{}", self.seq))
    }
}

/// Records known for a VM, indexed by sequence number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryChain {
    records: BTreeMap<u32, History>,
    current: Option<u32>,
    previous: Option<u32>,
}

impl HistoryChain {
    /// Sequence number of the next record
    pub fn next_seq(&self) -> u32 {
        self.current.map_or(0, |seq| seq + 1)
    }

    pub fn current(&self) -> Option<&History> {
        self.current.and_then(|seq| self.records.get(&seq))
    }

    pub fn previous(&self) -> Option<&History> {
        self.previous.and_then(|seq| self.records.get(&seq))
    }

    /// Loaded records, oldest first
    pub fn records(&self) -> impl Iterator<Item = &History> {
        self.records.values()
    }

    fn append(&mut self, record: History) -> &History {
        let seq = record.seq;
        self.previous = self.current;
        self.current = Some(seq);
        self.records.entry(seq).or_insert(record)
    }

    /// Chain whose current record is the last of `records`
    pub(crate) fn from_records(records: Vec<History>) -> HistoryChain {
        let current = records.iter().map(|record| record.seq).max();
        let records: BTreeMap<u32, History> =
            records.into_iter().map(|record| (record.seq, record)).collect();
        let previous = current
            .and_then(|seq| seq.checked_sub(1))
            .filter(|seq| records.contains_key(seq));

        HistoryChain {
            records,
            current,
            previous,
        }
    }

    /// Loads from `store` every record older than the current one
    pub(crate) fn load_all(&mut self, store: &dyn HistoryStore, oid: i64) -> Result<(), VmError> {
        let last_seq = match self.current.and_then(|seq| seq.checked_sub(1)) {
            Some(seq) => seq,
            None => return Ok(()),
        };

        for seq in (0..=last_seq).rev() {
            let record = store.select(oid, seq).map_err(|e| {
                error!("Cannot load history record {} of VM {}: {}", seq, oid, e);
                VmError::Unavailable(format!(
                    "Cannot get previous history record (seq:{}) for VM id: {}",
                    last_seq + 1,
                    oid
                ))
            })?;
            self.records.insert(seq, record);
        }
        self.previous = Some(last_seq);
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("History record {seq} of VM {oid} does not exist")]
    NotFound { oid: i64, seq: u32 },
    #[error("History record {seq} of VM {oid} already exists")]
    Duplicate { oid: i64, seq: u32 },
    #[error("History store error: {0}")]
    Backend(String),
}

/// Persistence of history records
pub trait HistoryStore: Debug {
    fn select(&self, oid: i64, seq: u32) -> Result<History, StoreError>;

    fn insert(&self, record: &History) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Mutex<BTreeMap<(i64, u32), History>>,
}

impl MemoryHistoryStore {
    pub fn new() -> MemoryHistoryStore {
        MemoryHistoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn select(&self, oid: i64, seq: u32) -> Result<History, StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(oid, seq))
            .cloned()
            .ok_or(StoreError::NotFound { oid, seq })
    }

    fn insert(&self, record: &History) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (record.oid, record.seq);
        if records.contains_key(&key) {
            return Err(StoreError::Duplicate {
                oid: record.oid,
                seq: record.seq,
            });
        }
        records.insert(key, record.clone());
        Ok(())
    }
}

impl VirtualMachine {
    /// Appends a record for a new placement of the VM
    #[instrument(skip(self, placement), fields(id = %self.oid))]
    pub fn add_history(&mut self, placement: Placement) -> Result<&History, VmError> {
        let seq = self.history.next_seq();
        let record = History::new(self.oid, seq, &placement, self.history_snapshot()?);
        debug!(
            "VM {} placed on host {} ({}), seq {}",
            self.oid, placement.hostname, placement.hid, seq
        );
        Ok(self.history.append(record))
    }

    /// Appends a copy of the current placement. Nothing is done when the VM
    /// has never been placed.
    pub fn cp_history(&mut self) -> Result<Option<&History>, VmError> {
        let placement = match self.history.current() {
            Some(current) => current.placement(),
            None => return Ok(None),
        };
        self.add_history(placement).map(Some)
    }

    /// Appends a copy of the previous placement, used to go back to the
    /// source host of a migration. Needs both a current and a previous
    /// placement.
    pub fn cp_previous_history(&mut self) -> Result<Option<&History>, VmError> {
        let placement = match (self.history.current(), self.history.previous()) {
            (Some(_), Some(previous)) => previous.placement(),
            _ => return Ok(None),
        };
        self.add_history(placement).map(Some)
    }

    /// Current placement
    pub fn history(&self) -> Option<&History> {
        self.history.current()
    }

    pub fn previous_history(&self) -> Option<&History> {
        self.history.previous()
    }

    pub fn history_chain(&self) -> &HistoryChain {
        &self.history
    }

    /// Stores the current record
    pub fn persist_history(&self, store: &dyn HistoryStore) -> Result<(), VmError> {
        match self.history.current() {
            Some(current) => Ok(store.insert(current)?),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::placement::PlacementBuilder;
    use crate::builder::Builder;
    use nimbus_models::models::Template;
    use pretty_assertions::assert_eq;

    fn placement(hid: i64, hostname: &str) -> Placement {
        PlacementBuilder::new()
            .with_host(hid, hostname)
            .with_drivers("kvm", "dummy", "shared")
            .with_datastore("/var/lib/one/datastores", 0)
            .try_build()
            .unwrap()
    }

    #[test]
    fn derived_paths() {
        let mut vm = VirtualMachine::new(5, 0, 0, "oneadmin", "oneadmin", Template::new());
        vm.add_history(placement(1, "node1")).unwrap();
        let history = vm.history().unwrap();
        assert_eq!(
            history.system_dir(),
            PathBuf::from("/var/lib/one/datastores/0/5")
        );
        assert_eq!(
            history.context_file(),
            PathBuf::from("/var/lib/one/datastores/0/5/context.sh")
        );
        assert_eq!(
            history.deployment_file(),
            PathBuf::from("/var/lib/one/datastores/0/5/deployment.0")
        );
    }

    #[test]
    fn copies() {
        let mut vm = VirtualMachine::new(5, 0, 0, "oneadmin", "oneadmin", Template::new());
        assert_eq!(vm.cp_history().unwrap(), None);

        vm.add_history(placement(1, "node1")).unwrap();
        assert_eq!(vm.cp_previous_history().unwrap(), None);

        vm.add_history(placement(2, "node2")).unwrap();
        let copy = vm.cp_previous_history().unwrap().unwrap();
        assert_eq!((copy.seq, copy.hid), (2, 1));
        assert_eq!(vm.previous_history().unwrap().hid, 2);

        let copy = vm.cp_history().unwrap().unwrap();
        assert_eq!((copy.seq, copy.hid), (3, 1));
        assert_eq!(vm.previous_history().unwrap().seq, 2);
    }

    #[test]
    fn memory_store_rejects_duplicates() {
        let store = MemoryHistoryStore::new();
        let mut vm = VirtualMachine::new(5, 0, 0, "oneadmin", "oneadmin", Template::new());
        vm.add_history(placement(1, "node1")).unwrap();
        vm.persist_history(&store).unwrap();
        assert!(matches!(
            vm.persist_history(&store),
            Err(VmError::Unavailable(_))
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.select(5, 1),
            Err(StoreError::NotFound { oid: 5, seq: 1 })
        );
    }

    #[test]
    fn chain_from_records() {
        let records = (0..3)
            .map(|seq| History::new(9, seq, &placement(seq as i64, "node"), String::new()))
            .collect();
        let chain = HistoryChain::from_records(records);
        assert_eq!(chain.current().unwrap().seq, 2);
        assert_eq!(chain.previous().unwrap().seq, 1);
        assert_eq!(chain.next_seq(), 3);
        assert_eq!(chain.records().count(), 3);
    }
}
