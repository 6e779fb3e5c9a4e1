//! Cluster membership: the pool of peer nodes.
//!
//! The [`NodePool`] is the authoritative, mutable set of peer addresses for
//! a cluster, excluding the local node. The engine reads a snapshot of the
//! membership whenever it computes a majority, so a peer added or removed
//! mid-round never corrupts an in-flight quorum count.
//!
//! Observers learn of membership changes without polling: each actual state
//! change produces exactly one [`MembershipChange`] on the pool's broadcast
//! channel, delivered after the change is applied.

use caravel_core::{Address, AddressInput};
use tokio::sync::broadcast;

/// Capacity of the membership-change broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A membership change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    /// A peer joined the pool.
    Added(Address),
    /// A peer left the pool.
    Removed(Address),
}

/// The pool of remote cluster members.
///
/// The optional local address is never listed as a member, but membership
/// checks treat the local node as always part of the cluster.
#[derive(Debug)]
pub struct NodePool {
    local: Option<Address>,
    members: Vec<Address>,
    events: broadcast::Sender<MembershipChange>,
}

impl NodePool {
    /// Creates a pool from an initial set of addresses.
    ///
    /// Every initial address is normalized; inputs that fail to normalize,
    /// duplicates (first occurrence kept), and entries equal to the local
    /// address are dropped silently.
    pub fn new<I, A>(initial: I, local: Option<A>) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AddressInput>,
    {
        let local = local.and_then(|input| Address::normalize(input).ok());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut pool = Self {
            local,
            members: Vec::new(),
            events,
        };

        for input in initial {
            // Construction is silent: no events for the initial set.
            let _ = pool.insert(input);
        }

        pool
    }

    /// Creates an empty pool with no local address.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::<Address>::new(), None::<Address>)
    }

    /// Returns the local address, if one was configured.
    #[must_use]
    pub const fn local(&self) -> Option<&Address> {
        self.local.as_ref()
    }

    /// Returns a fresh snapshot of the member addresses.
    ///
    /// The returned list is a defensive copy: mutating it never affects the
    /// pool, and later pool mutations never affect it.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        self.members.clone()
    }

    /// Returns the number of remote members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the pool has no remote members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns the strict majority of the full cluster (members plus the
    /// local node when configured).
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        let cluster = self.members.len() + usize::from(self.local.is_some());
        cluster / 2 + 1
    }

    /// Returns true if `candidate` selects a node of this cluster.
    ///
    /// The local address always counts as part of the cluster. Inputs that
    /// fail to normalize select nothing; this never fails.
    pub fn has(&self, candidate: impl Into<AddressInput>) -> bool {
        let Ok(address) = Address::normalize(candidate) else {
            return false;
        };
        self.is_local(&address) || self.members.contains(&address)
    }

    /// Adds a peer to the pool.
    ///
    /// No-op when the input does not normalize, equals the local address,
    /// or is already a member. Returns the normalized address when the pool
    /// actually changed, in which case exactly one
    /// [`MembershipChange::Added`] is broadcast.
    pub fn add(&mut self, candidate: impl Into<AddressInput>) -> Option<Address> {
        let added = self.insert(candidate)?;
        let _ = self.events.send(MembershipChange::Added(added.clone()));
        Some(added)
    }

    /// Removes a peer from the pool.
    ///
    /// No-op when the input does not normalize, equals the local address,
    /// or is not a member. Returns the normalized address when the pool
    /// actually changed, in which case exactly one
    /// [`MembershipChange::Removed`] is broadcast.
    pub fn remove(&mut self, candidate: impl Into<AddressInput>) -> Option<Address> {
        let address = Address::normalize(candidate).ok()?;
        if self.is_local(&address) {
            return None;
        }
        let position = self.members.iter().position(|m| *m == address)?;
        let removed = self.members.remove(position);
        let _ = self.events.send(MembershipChange::Removed(removed.clone()));
        Some(removed)
    }

    /// Subscribes to membership-change notifications.
    ///
    /// Only changes made after the subscription are observed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipChange> {
        self.events.subscribe()
    }

    fn is_local(&self, address: &Address) -> bool {
        self.local.as_ref() == Some(address)
    }

    /// Normalizes and inserts without emitting an event.
    fn insert(&mut self, candidate: impl Into<AddressInput>) -> Option<Address> {
        let address = Address::normalize(candidate).ok()?;
        if self.is_local(&address) || self.members.contains(&address) {
            return None;
        }
        self.members.push(address.clone());
        Some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> String {
        format!("/ip4/127.0.0.1/tcp/{port}")
    }

    #[test]
    fn test_empty_pool() {
        let pool = NodePool::empty();
        assert!(pool.is_empty());
        assert!(pool.addresses().is_empty());
        assert!(pool.local().is_none());
    }

    #[test]
    fn test_initial_addresses_are_normalized() {
        let pool = NodePool::new(
            vec![
                AddressInput::Raw(addr(1)),
                AddressInput::Id { id: addr(2) },
                AddressInput::Endpoint { address: addr(3) },
                AddressInput::HostPort {
                    address: "127.0.0.1".to_string(),
                    port: 4,
                },
                AddressInput::Parsed(Address::parse(&addr(5)).unwrap()),
            ],
            None::<AddressInput>,
        );

        let addresses = pool.addresses();
        assert_eq!(addresses.len(), 5);
        for (i, address) in addresses.iter().enumerate() {
            assert_eq!(address.id(), addr(i as u16 + 1));
        }
    }

    #[test]
    fn test_initial_set_drops_local_and_duplicates() {
        let pool = NodePool::new(
            vec![addr(1), addr(2), addr(3), addr(2)],
            Some(addr(3)),
        );

        let addresses = pool.addresses();
        assert_eq!(addresses.len(), 2);
        assert!(!addresses.iter().any(|a| a.matches(addr(3).as_str())));
    }

    #[test]
    fn test_initial_set_drops_unparsable() {
        let pool = NodePool::new(vec![addr(1), String::new(), "junk".to_string()], None::<String>);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_addresses_snapshot_is_defensive() {
        let mut pool = NodePool::new(vec![addr(1)], None::<String>);

        let mut snapshot = pool.addresses();
        snapshot.clear();
        assert_eq!(pool.len(), 1);

        let snapshot = pool.addresses();
        pool.add(addr(2).as_str());
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_has_accepts_every_shape() {
        let mut pool = NodePool::new(vec![addr(1)], None::<String>);
        pool.add(AddressInput::Id { id: addr(2) });

        assert!(pool.has(addr(1).as_str()));
        assert!(pool.has(AddressInput::Id { id: addr(2) }));
        assert!(pool.has(AddressInput::Endpoint { address: addr(1) }));
        assert!(pool.has(("127.0.0.1", 2)));
        assert!(pool.has(Address::parse(&addr(1)).unwrap()));

        assert!(!pool.has(addr(3).as_str()));
        assert!(!pool.has(("127.0.0.1", 4)));
    }

    #[test]
    fn test_has_rejects_unparsable_without_panicking() {
        let pool = NodePool::new(vec![addr(1)], None::<String>);

        assert!(!pool.has(""));
        assert!(!pool.has("not-an-address"));
        assert!(!pool.has("/udp/127.0.0.1/tcp/1"));
    }

    #[test]
    fn test_local_is_always_part_of_the_cluster() {
        let pool = NodePool::new(Vec::<String>::new(), Some(addr(1)));

        assert!(pool.has(addr(1).as_str()));
        assert!(pool.has(("127.0.0.1", 1)));
        assert!(pool.addresses().is_empty());
    }

    #[test]
    fn test_add_notifies_with_normalized_address() {
        let mut pool = NodePool::empty();
        let mut events = pool.subscribe();

        pool.add(("127.0.0.1", 9));

        let event = events.try_recv().unwrap();
        assert_eq!(
            event,
            MembershipChange::Added(Address::parse("/ip4/127.0.0.1/tcp/9").unwrap())
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_add_existing_member_emits_nothing() {
        let mut pool = NodePool::new(vec![addr(1)], None::<String>);
        let mut events = pool.subscribe();

        assert!(pool.add(addr(1).as_str()).is_none());
        assert_eq!(pool.len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_double_add_emits_exactly_one_event() {
        let mut pool = NodePool::empty();
        let mut events = pool.subscribe();

        pool.add("/ip4/10.0.0.1/tcp/9");
        pool.add("/ip4/10.0.0.1/tcp/9");

        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_add_local_address_emits_nothing() {
        let mut pool = NodePool::new(Vec::<String>::new(), Some(addr(1)));
        let mut events = pool.subscribe();

        assert!(pool.add(addr(1).as_str()).is_none());
        assert!(pool.addresses().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_add_unparsable_is_a_noop() {
        let mut pool = NodePool::empty();
        let mut events = pool.subscribe();

        assert!(pool.add("").is_none());
        assert!(pool.add("bogus").is_none());
        assert!(pool.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_remove_notifies_with_normalized_address() {
        let mut pool = NodePool::new(vec![addr(1)], None::<String>);
        let mut events = pool.subscribe();

        pool.remove(("127.0.0.1", 1));

        let event = events.try_recv().unwrap();
        assert_eq!(
            event,
            MembershipChange::Removed(Address::parse(&addr(1)).unwrap())
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn test_remove_missing_member_emits_nothing() {
        let mut pool = NodePool::empty();
        let mut events = pool.subscribe();

        assert!(pool.remove(addr(1).as_str()).is_none());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_remove_local_address_emits_nothing() {
        let mut pool = NodePool::new(Vec::<String>::new(), Some(addr(1)));
        let mut events = pool.subscribe();

        assert!(pool.remove(addr(1).as_str()).is_none());
        assert!(pool.has(addr(1).as_str()));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_quorum_size() {
        // Local only: cluster of 1.
        let pool = NodePool::new(Vec::<String>::new(), Some(addr(1)));
        assert_eq!(pool.quorum_size(), 1);

        // Local + 2 peers: cluster of 3.
        let pool = NodePool::new(vec![addr(2), addr(3)], Some(addr(1)));
        assert_eq!(pool.quorum_size(), 2);

        // Local + 4 peers: cluster of 5.
        let pool = NodePool::new(vec![addr(2), addr(3), addr(4), addr(5)], Some(addr(1)));
        assert_eq!(pool.quorum_size(), 3);
    }
}
