//! Engine configuration.

use caravel_core::limits::MAX_ENTRIES_PER_APPEND;
use caravel_core::Address;

/// Default width of the majority-reachability probe window, measured in
/// heartbeat epochs. A peer the leader has not heard from within this many
/// epochs is considered unreachable when admitting client commands.
pub const REACHABILITY_PROBE_EPOCHS: u64 = 2;

/// Configuration for a consensus engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's own address.
    pub local: Address,
    /// Width of the majority-reachability probe window, in heartbeat epochs.
    pub probe_epochs: u64,
    /// Maximum number of entries sent in one append request.
    pub max_entries_per_append: usize,
}

impl EngineConfig {
    /// Creates an engine configuration with default tunables.
    #[must_use]
    pub const fn new(local: Address) -> Self {
        Self {
            local,
            probe_epochs: REACHABILITY_PROBE_EPOCHS,
            max_entries_per_append: MAX_ENTRIES_PER_APPEND,
        }
    }

    /// Overrides the reachability probe window.
    #[must_use]
    pub const fn with_probe_epochs(mut self, epochs: u64) -> Self {
        self.probe_epochs = epochs;
        self
    }
}
