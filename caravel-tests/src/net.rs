//! In-memory transport for integration tests.
//!
//! Routes messages straight into each node's dispatcher instead of over
//! TCP, with per-node severing to simulate partitions. The server loops
//! under test are the real thing; only the wire is fake.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use caravel_core::Address;
use caravel_raft::Message;
use caravel_runtime::{IncomingDispatcher, Transport, TransportResult};

/// The shared fake network: dispatchers by address, plus severed nodes.
#[derive(Default)]
pub struct MemoryNetwork {
    inner: Mutex<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    dispatchers: HashMap<Address, Arc<IncomingDispatcher>>,
    severed: HashSet<Address>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node's dispatcher and returns its transport endpoint.
    pub fn join(self: &Arc<Self>, local: Address, dispatcher: Arc<IncomingDispatcher>) -> MemoryTransport {
        self.inner
            .lock()
            .expect("network lock poisoned")
            .dispatchers
            .insert(local.clone(), dispatcher);
        MemoryTransport {
            network: Arc::clone(self),
            local,
        }
    }

    /// Severs a node in both directions.
    pub fn sever(&self, address: &Address) {
        self.inner
            .lock()
            .expect("network lock poisoned")
            .severed
            .insert(address.clone());
    }

    /// Reconnects a node.
    pub fn heal(&self, address: &Address) {
        self.inner
            .lock()
            .expect("network lock poisoned")
            .severed
            .remove(address);
    }

    /// Routes one message, dropping it silently when either end is
    /// severed or the target is unknown.
    fn route(&self, from: &Address, message: Message) {
        let inner = self.inner.lock().expect("network lock poisoned");
        if inner.severed.contains(from) || inner.severed.contains(message.to()) {
            return;
        }
        if let Some(dispatcher) = inner.dispatchers.get(message.to()) {
            dispatcher.accept(message);
        }
    }
}

/// One node's endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: Address,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: Message) -> TransportResult<()> {
        self.network.route(&self.local, message);
        Ok(())
    }
}
