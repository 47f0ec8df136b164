//! # Virtual machine record
//!
//! [VirtualMachine] is the aggregate every VM operation goes through: it owns
//! the VM template, the placement history and the leases taken on shared
//! resources. Callers are expected to hold the record under their own
//! exclusive lock, every operation here is synchronous.
//!
//! Admission of a new VM is done with [VirtualMachine::admit], which
//! validates the template and acquires every image and network lease it
//! references. Either all leases are acquired or none is held on return.
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use nimbus_models::models::{AttributeError, Template};
use tracing::{debug, error, info, instrument};

use crate::config::CoreConfig;
use crate::history::{HistoryChain, StoreError};
use crate::lease::LeaseLog;
use crate::parser::ParseError;
use crate::pool::{AuthRequest, Collaborators, PoolError};

pub mod snapshot;
pub mod state;
mod template;

pub use state::{LcmState, VmState};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// The template or the request is malformed
    #[error("{0}")]
    Validation(String),
    /// Two resources ask for incompatible things
    #[error("{0}")]
    Conflict(String),
    /// A resource cannot be leased
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    NotFound(String),
}

impl From<PoolError> for VmError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Invalid(message) => VmError::Validation(message),
            PoolError::NotFound(message) | PoolError::Unavailable(message) => {
                VmError::Unavailable(message)
            }
        }
    }
}

/// A template attribute of the wrong shape is a malformed template
impl From<AttributeError> for VmError {
    fn from(e: AttributeError) -> Self {
        VmError::Validation(e.to_string())
    }
}

impl From<ParseError> for VmError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::ScanBuffer => VmError::Internal(e.to_string()),
            _ => VmError::Validation(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for VmError {
    fn from(e: serde_json::Error) -> Self {
        VmError::Internal(format!("Cannot serialize VM: {}", e))
    }
}

impl From<StoreError> for VmError {
    fn from(e: StoreError) -> Self {
        VmError::Unavailable(e.to_string())
    }
}

/// Largest MEMORY, in MB, whose size in KB still fits a `u64`
pub const MAX_MEMORY: u64 = u64::MAX / 1024;

/// Seconds since the epoch
pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Context of a VM rendered for its context disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedContext {
    /// Where the rendered variables go on the host
    pub path: PathBuf,
    pub contents: String,
    /// `FILES` and `FILES_DS` of the context, blank separated
    pub files: String,
    pub disk_id: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub(crate) oid: i64,
    pub(crate) uid: i64,
    pub(crate) gid: i64,
    pub(crate) uname: String,
    pub(crate) gname: String,
    pub(crate) name: String,
    pub(crate) state: VmState,
    pub(crate) lcm_state: LcmState,
    pub(crate) resched: bool,
    pub(crate) last_poll: u64,
    pub(crate) deploy_id: String,
    pub(crate) memory: u64,
    pub(crate) cpu: u32,
    pub(crate) net_tx: u64,
    pub(crate) net_rx: u64,
    pub(crate) stime: u64,
    pub(crate) etime: u64,
    pub(crate) template: Template,
    #[serde(skip)]
    pub(crate) history: HistoryChain,
}

impl VirtualMachine {
    pub fn new(
        oid: i64,
        uid: i64,
        gid: i64,
        uname: &str,
        gname: &str,
        template: Template,
    ) -> VirtualMachine {
        VirtualMachine {
            oid,
            uid,
            gid,
            uname: uname.to_string(),
            gname: gname.to_string(),
            name: String::new(),
            state: VmState::Init,
            lcm_state: LcmState::LcmInit,
            resched: false,
            last_poll: 0,
            deploy_id: String::new(),
            memory: 0,
            cpu: 0,
            net_tx: 0,
            net_rx: 0,
            stime: now(),
            etime: 0,
            template,
            history: HistoryChain::default(),
        }
    }

    pub fn oid(&self) -> i64 {
        self.oid
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn gid(&self) -> i64 {
        self.gid
    }

    pub fn uname(&self) -> &str {
        &self.uname
    }

    pub fn gname(&self) -> &str {
        &self.gname
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn set_state(&mut self, state: VmState) {
        debug!("VM {} state {} -> {}", self.oid, self.state, state);
        self.state = state;
    }

    pub fn lcm_state(&self) -> LcmState {
        self.lcm_state
    }

    pub fn set_lcm_state(&mut self, lcm_state: LcmState) {
        self.lcm_state = lcm_state;
    }

    pub fn resched(&self) -> bool {
        self.resched
    }

    pub fn set_resched(&mut self, resched: bool) {
        self.resched = resched;
    }

    pub fn deploy_id(&self) -> &str {
        &self.deploy_id
    }

    pub fn set_deploy_id(&mut self, deploy_id: &str) {
        self.deploy_id = deploy_id.to_string();
    }

    pub fn stime(&self) -> u64 {
        self.stime
    }

    pub fn etime(&self) -> u64 {
        self.etime
    }

    pub fn set_etime(&mut self, etime: u64) {
        self.etime = etime;
    }

    pub fn last_poll(&self) -> u64 {
        self.last_poll
    }

    /// Records the usage reported by the hypervisor
    pub fn update_monitoring(&mut self, memory: u64, cpu: u32, net_tx: u64, net_rx: u64) {
        self.memory = memory;
        self.cpu = cpu;
        self.net_tx = net_tx;
        self.net_rx = net_rx;
        self.last_poll = now();
    }

    /// `(memory, cpu, net_tx, net_rx)` as last reported
    pub fn monitoring(&self) -> (u64, u32, u64, u64) {
        (self.memory, self.cpu, self.net_tx, self.net_rx)
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Validates the template and acquires the images and network addresses
    /// it references.
    ///
    /// On failure no lease taken here is kept. Defaults written into the
    /// template (`VMID`, `NAME`, OS files) stay in place.
    #[instrument(skip(self, ctx), fields(id = %self.oid))]
    pub fn admit(&mut self, ctx: &Collaborators<'_>) -> Result<(), VmError> {
        let result = self.try_admit(ctx);
        if let Err(e) = &result {
            error!("Cannot admit VM {}: {}", self.oid, e);
        }
        result
    }

    fn try_admit(&mut self, ctx: &Collaborators<'_>) -> Result<(), VmError> {
        self.prepare_template(&ctx.config)?;
        self.parse_os(ctx)?;

        let mut log = LeaseLog::new(self.oid);
        match self.acquire_leases(ctx, &mut log) {
            Ok(()) => log.commit(),
            Err(e) => {
                log.rollback(ctx);
                return Err(e);
            }
        }

        self.parse_graphics(&ctx.config);
        info!("VM {} admitted as {}", self.oid, self.name);
        Ok(())
    }

    fn acquire_leases(&mut self, ctx: &Collaborators<'_>, log: &mut LeaseLog) -> Result<(), VmError> {
        self.acquire_disk_images(ctx, log)?;
        self.acquire_network_leases(ctx, log)?;
        debug!("VM {} holds {} leases", self.oid, log.len());

        self.parse_context(ctx)?;
        self.parse_requirements(ctx)?;
        self.automatic_requirements()
    }

    /// Capacity asked to a host: CPU in percent, memory in KiB and disk.
    /// All zero when `MEMORY` or `CPU` are missing or out of range.
    pub fn get_requirements(&self) -> (u32, u64, u64) {
        let memory = self
            .template
            .get_parsed::<u64>("MEMORY")
            .filter(|memory| *memory != 0)
            .and_then(|memory| memory.checked_mul(1024));
        match (self.template.get_parsed::<f32>("CPU"), memory) {
            (Some(cpu), Some(memory)) => ((cpu * 100.0) as u32, memory, 0),
            _ => (0, 0, 0),
        }
    }

    /// Adds to `request` the authorization needed by `uid` to use the
    /// images and networks referenced by `template`
    pub fn set_auth_request(
        ctx: &Collaborators<'_>,
        uid: i64,
        request: &mut AuthRequest,
        template: &Template,
    ) {
        for disk in template.get("DISK").filter_map(|a| a.as_vector().ok()) {
            ctx.images.authorize_disk(disk, uid, request);
        }

        for nic in template.get("NIC").filter_map(|a| a.as_vector().ok()) {
            ctx.networks.authorize_nic(nic, uid, request);
        }
    }

    /// Renders the context variables of the VM. `None` when the VM has no
    /// context.
    pub fn generate_context(&self) -> Result<Option<GeneratedContext>, VmError> {
        let history = self.history().ok_or_else(|| {
            VmError::NotFound(format!("VM {} has no history record", self.oid))
        })?;

        if self.template.count("CONTEXT") != 1 {
            info!("Virtual Machine {} has no context", self.oid);
            return Ok(None);
        }

        let context = match self.template.vector("CONTEXT")? {
            Some(context) => context,
            None => return Ok(None),
        };

        let files = [context.get("FILES"), context.get("FILES_DS")]
            .iter()
            .flatten()
            .copied()
            .collect::<Vec<_>>()
            .join(" ");

        let mut contents = String::from("# Context variables generated by nimbus\n");
        for (key, value) in context.iter() {
            contents.push_str(&format!("{}=\"{}\"\n", key, value));
        }

        Ok(Some(GeneratedContext {
            path: history.context_file(),
            contents,
            files,
            disk_id: context.get_parsed("DISK_ID"),
        }))
    }

    /// Directory of the VM in the system datastore of its current placement
    pub fn system_dir(&self, config: &CoreConfig) -> Result<PathBuf, VmError> {
        let history = self.history().ok_or_else(|| {
            VmError::NotFound(format!("VM {} has no history record", self.oid))
        })?;

        Ok(config
            .ds_location
            .join(history.ds_id.to_string())
            .join(self.oid.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_models::models::{SingleAttribute, VectorAttribute};
    use pretty_assertions::assert_eq;

    #[test]
    fn error_conversions() {
        assert_eq!(
            VmError::from(PoolError::Invalid("bad".to_string())),
            VmError::Validation("bad".to_string())
        );
        assert_eq!(
            VmError::from(PoolError::NotFound("gone".to_string())),
            VmError::Unavailable("gone".to_string())
        );
        assert!(matches!(
            VmError::from(ParseError::ScanBuffer),
            VmError::Internal(_)
        ));
        assert_eq!(
            VmError::from(AttributeError::NotVector("OS".to_string())),
            VmError::Validation(
                "Wrong format for OS attribute, expected a vector attribute".to_string()
            )
        );
    }

    #[test]
    fn requirements_in_percent_and_kilobytes() {
        let vm = VirtualMachine::new(
            1,
            0,
            0,
            "oneadmin",
            "oneadmin",
            Template::new()
                .with(SingleAttribute::new("MEMORY", 512))
                .with(SingleAttribute::new("CPU", "0.5")),
        );
        assert_eq!(vm.get_requirements(), (50, 524288, 0));

        let vm = VirtualMachine::new(
            2,
            0,
            0,
            "oneadmin",
            "oneadmin",
            Template::new().with(SingleAttribute::new("CPU", 1)),
        );
        assert_eq!(vm.get_requirements(), (0, 0, 0));
    }

    #[test]
    fn requirements_of_oversized_memory() {
        let vm = VirtualMachine::new(
            3,
            0,
            0,
            "oneadmin",
            "oneadmin",
            Template::new()
                .with(SingleAttribute::new("MEMORY", i64::MAX))
                .with(SingleAttribute::new("CPU", 1)),
        );
        assert_eq!(vm.get_requirements(), (0, 0, 0));

        let vm = VirtualMachine::new(
            4,
            0,
            0,
            "oneadmin",
            "oneadmin",
            Template::new()
                .with(SingleAttribute::new("MEMORY", MAX_MEMORY))
                .with(SingleAttribute::new("CPU", 1)),
        );
        assert_eq!(vm.get_requirements(), (100, MAX_MEMORY * 1024, 0));
    }

    #[test]
    fn context_needs_history() {
        let vm = VirtualMachine::new(
            3,
            0,
            0,
            "oneadmin",
            "oneadmin",
            Template::new().with(VectorAttribute::new("CONTEXT").with("HOSTNAME", "web")),
        );
        assert!(matches!(vm.generate_context(), Err(VmError::NotFound(_))));
        assert!(matches!(
            vm.system_dir(&CoreConfig::default()),
            Err(VmError::NotFound(_))
        ));
    }

    #[test]
    fn monitoring_updates_last_poll() {
        let mut vm = VirtualMachine::new(4, 0, 0, "oneadmin", "oneadmin", Template::new());
        assert_eq!(vm.last_poll(), 0);
        vm.update_monitoring(1024, 25, 10, 20);
        assert_eq!(vm.monitoring(), (1024, 25, 10, 20));
        assert!(vm.last_poll() > 0);
    }
}
