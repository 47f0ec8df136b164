//! JSON snapshots of a VM record.
//!
//! A snapshot carries the record and, depending on the [HistoryDepth] it
//! was taken with, some of its placement history. The current placement is
//! always the last history entry of a snapshot.
use tracing::trace;

use crate::history::{History, HistoryChain, HistoryDepth, HistoryStore};

use super::{VirtualMachine, VmError};

#[derive(Serialize)]
struct SnapshotRef<'a> {
    vm: &'a VirtualMachine,
    history: Vec<&'a History>,
}

#[derive(Deserialize)]
struct Snapshot {
    vm: VirtualMachine,
    #[serde(default)]
    history: Vec<History>,
}

impl VirtualMachine {
    pub fn to_snapshot(&self, depth: HistoryDepth) -> Result<String, VmError> {
        let history = match depth {
            HistoryDepth::None => Vec::new(),
            HistoryDepth::Last => self.history.current().into_iter().collect(),
            HistoryDepth::All => self.history.records().collect(),
        };

        Ok(serde_json::to_string(&SnapshotRef { vm: self, history })?)
    }

    /// Snapshot embedded in new history records
    pub(crate) fn history_snapshot(&self) -> Result<String, VmError> {
        self.to_snapshot(HistoryDepth::None)
    }

    pub fn from_snapshot(blob: &str) -> Result<VirtualMachine, VmError> {
        let snapshot: Snapshot = serde_json::from_str(blob)?;
        let mut vm = snapshot.vm;
        vm.history = HistoryChain::from_records(snapshot.history);
        Ok(vm)
    }

    /// Rebuilds a VM from `blob` and reloads its history from `store` down to
    /// `depth`
    pub fn load(
        blob: &str,
        store: &dyn HistoryStore,
        depth: HistoryDepth,
    ) -> Result<VirtualMachine, VmError> {
        let snapshot: Snapshot = serde_json::from_str(blob)?;
        let mut vm = snapshot.vm;
        let current = snapshot.history.into_iter().max_by_key(|record| record.seq);

        vm.history = match (depth, current) {
            (HistoryDepth::None, _) | (_, None) => HistoryChain::default(),
            (HistoryDepth::Last, Some(current)) => HistoryChain::from_records(vec![current]),
            (HistoryDepth::All, Some(current)) => {
                let mut chain = HistoryChain::from_records(vec![current]);
                chain.load_all(store, vm.oid)?;
                chain
            }
        };

        trace!(
            "VM {} loaded with {} history records",
            vm.oid,
            vm.history.records().count()
        );
        Ok(vm)
    }
}
