use serde::Serialize;

/// Snapshot of one lease, as reported by `get_current_state()`.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ChangeFeedProcessorState {
    /// `None` while no host owns the lease
    pub host_name: Option<String>,
    pub lease_token: String,
    pub continuation_token: Option<String>,
    pub estimated_lag: u64,
}

/// Processor lifecycle: `Created -> Started -> Stopped`, never backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Stopped,
}
