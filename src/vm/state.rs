use std::fmt;

/// Dispatch state of a VM
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    #[default]
    Init,
    Pending,
    Hold,
    Active,
    Stopped,
    Suspended,
    Done,
    Failed,
}

impl VmState {
    /// A VM in these states no longer owns resources that can be changed
    pub fn is_final(&self) -> bool {
        matches!(self, VmState::Done | VmState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Init => "INIT",
            VmState::Pending => "PENDING",
            VmState::Hold => "HOLD",
            VmState::Active => "ACTIVE",
            VmState::Stopped => "STOPPED",
            VmState::Suspended => "SUSPENDED",
            VmState::Done => "DONE",
            VmState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Life-cycle sub-state of an active VM
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LcmState {
    #[default]
    LcmInit,
    Prolog,
    Boot,
    Running,
    Migrate,
    SaveStop,
    SaveSuspend,
    SaveMigrate,
    PrologMigrate,
    PrologResume,
    EpilogStop,
    Epilog,
    Shutdown,
    Cancel,
    Failure,
    Cleanup,
    Unknown,
    Hotplug,
}
