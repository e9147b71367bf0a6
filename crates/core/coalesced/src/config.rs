use tokio::runtime::Handle;

#[derive(Clone, Debug, Default)]
/// Config values for [`Coalescer`](crate::Coalescer).
pub struct CoalescerConfig {
    /// Name attached to log events, useful when several coalescers run side by side
    pub label: Option<String>,
    /// Runtime operations are spawned on, defaults to the runtime of the initiating caller
    pub runtime: Option<Handle>,
}
