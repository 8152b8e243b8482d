//! Generic timeout registry.
//!
//! A single [`TimeoutQueue`] keeps `(TimeoutId → deadline)` entries that each
//! carry an opaque `user_data` word. The transport runs two of them: one for
//! connection liveness (user data is the connection id) and one for packet
//! acks (user data is a packed [`PacketTimeoutKey`]). The queue knows nothing
//! about either domain; the sweep functor decides what an expiry means.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use super::connection_set::ConnectionId;
use super::window::PacketId;

/// Opaque handle to a registered timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutId(u64);

impl TimeoutId {
    /// Raw id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// What a sweep functor wants done with an expired item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Remove the item.
    Delete,
    /// Re-arm the item for another full timeout.
    Refresh,
}

/// One registered timeout.
#[derive(Debug, Clone)]
pub struct TimeoutItem {
    /// Caller-defined payload.
    pub user_data: u64,
    /// Duration the item is re-armed with.
    pub timeout: Duration,
    /// When the item next expires.
    pub next_timeout: Instant,
}

impl TimeoutItem {
    /// Push the deadline to `now + timeout` in place.
    pub fn update_timeout_time(&mut self, now: Instant) {
        self.next_timeout = now + self.timeout;
    }
}

/// Registry of deadlines swept once per update.
///
/// Deadlines live in a min-heap; refreshing an item only rewrites its
/// `next_timeout`, and stale heap entries are re-queued lazily when popped.
#[derive(Debug, Default)]
pub struct TimeoutQueue {
    next_id: u64,
    items: HashMap<TimeoutId, TimeoutItem>,
    heap: BinaryHeap<Reverse<(Instant, TimeoutId)>>,
}

impl TimeoutQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an item expiring at `now + timeout`.
    pub fn register_item(&mut self, user_data: u64, timeout: Duration, now: Instant) -> TimeoutId {
        let id = TimeoutId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        let next_timeout = now + timeout;
        self.items.insert(
            id,
            TimeoutItem {
                user_data,
                timeout,
                next_timeout,
            },
        );
        self.heap.push(Reverse((next_timeout, id)));
        id
    }

    /// Look up an item; `None` if it expired or was removed.
    pub fn retrieve_item(&mut self, id: TimeoutId) -> Option<&mut TimeoutItem> {
        self.items.get_mut(&id)
    }

    /// Remove an item. Removing an unknown id is a no-op returning `false`.
    pub fn remove_item(&mut self, id: TimeoutId) -> bool {
        self.items.remove(&id).is_some()
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue has no live items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Invoke `functor` for every item whose deadline has passed.
    ///
    /// At most `max_per_sweep` expirations are handed to the functor; the rest
    /// stay queued for the next sweep. Items refreshed during the sweep are
    /// not revisited until a later call. Returns the number of expirations
    /// processed.
    pub fn update_timeouts<F>(&mut self, now: Instant, max_per_sweep: usize, mut functor: F) -> usize
    where
        F: FnMut(TimeoutId, &mut TimeoutItem) -> TimeoutAction,
    {
        let mut processed = 0;
        let mut requeue = Vec::new();

        while processed < max_per_sweep {
            let Some(Reverse((deadline, id))) = self.heap.peek().copied() else {
                break;
            };
            if deadline > now {
                break;
            }
            self.heap.pop();

            let Some(item) = self.items.get_mut(&id) else {
                // Removed since it was queued.
                continue;
            };
            if item.next_timeout != deadline {
                // Refreshed since it was queued; requeue at its real deadline.
                requeue.push(Reverse((item.next_timeout, id)));
                continue;
            }

            processed += 1;
            match functor(id, item) {
                TimeoutAction::Refresh => {
                    item.update_timeout_time(now);
                    requeue.push(Reverse((item.next_timeout, id)));
                }
                TimeoutAction::Delete => {
                    self.items.remove(&id);
                }
            }
        }

        self.heap.extend(requeue);
        processed
    }
}

/// Packs `(reliable:1, connection_id:31, packet_id:32)` into a timeout's
/// user data so one queue can serve every connection's packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketTimeoutKey {
    /// Whether the packet was sent reliably.
    pub reliable: bool,
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Packet being timed.
    pub packet_id: PacketId,
}

impl PacketTimeoutKey {
    /// Pack into a 64-bit word.
    pub fn pack(&self) -> u64 {
        let reliable = u64::from(self.reliable) << 63;
        let connection = u64::from(self.connection_id.as_u32() & 0x7FFF_FFFF) << 32;
        reliable | connection | u64::from(self.packet_id)
    }

    /// Unpack from a 64-bit word.
    pub fn unpack(word: u64) -> Self {
        Self {
            reliable: word >> 63 != 0,
            connection_id: ConnectionId::from_u32(((word >> 32) & 0x7FFF_FFFF) as u32),
            packet_id: word as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_retrieve() {
        let now = Instant::now();
        let mut queue = TimeoutQueue::new();
        let id = queue.register_item(42, Duration::from_secs(1), now);

        let item = queue.retrieve_item(id).unwrap();
        assert_eq!(item.user_data, 42);
        assert_eq!(item.next_timeout, now + Duration::from_secs(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let now = Instant::now();
        let mut queue = TimeoutQueue::new();
        let id = queue.register_item(1, Duration::from_millis(10), now);

        assert!(queue.remove_item(id));
        assert!(!queue.remove_item(id));
        assert!(queue.retrieve_item(id).is_none());

        // A removed item never reaches the functor
        let mut calls = 0;
        queue.update_timeouts(now + Duration::from_secs(1), usize::MAX, |_, _| {
            calls += 1;
            TimeoutAction::Delete
        });
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_expiry_order_and_delete() {
        let now = Instant::now();
        let mut queue = TimeoutQueue::new();
        queue.register_item(3, Duration::from_millis(30), now);
        queue.register_item(1, Duration::from_millis(10), now);
        queue.register_item(2, Duration::from_millis(20), now);
        queue.register_item(9, Duration::from_secs(10), now);

        let mut seen = Vec::new();
        let processed = queue.update_timeouts(now + Duration::from_millis(25), usize::MAX, |_, item| {
            seen.push(item.user_data);
            TimeoutAction::Delete
        });

        assert_eq!(processed, 2);
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_refresh_rearms() {
        let now = Instant::now();
        let mut queue = TimeoutQueue::new();
        let id = queue.register_item(7, Duration::from_millis(100), now);

        let t1 = now + Duration::from_millis(100);
        let processed = queue.update_timeouts(t1, usize::MAX, |_, _| TimeoutAction::Refresh);
        assert_eq!(processed, 1);
        assert_eq!(queue.retrieve_item(id).unwrap().next_timeout, t1 + Duration::from_millis(100));

        // Not yet expired again
        let processed = queue.update_timeouts(t1 + Duration::from_millis(50), usize::MAX, |_, _| {
            TimeoutAction::Delete
        });
        assert_eq!(processed, 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_refresh_with_zero_timeout_terminates() {
        let now = Instant::now();
        let mut queue = TimeoutQueue::new();
        queue.register_item(0, Duration::ZERO, now);

        let processed = queue.update_timeouts(now, usize::MAX, |_, _| TimeoutAction::Refresh);
        assert_eq!(processed, 1);
    }

    #[test]
    fn test_update_timeout_time_defers_expiry() {
        let now = Instant::now();
        let mut queue = TimeoutQueue::new();
        let id = queue.register_item(5, Duration::from_millis(100), now);

        let later = now + Duration::from_millis(80);
        queue.retrieve_item(id).unwrap().update_timeout_time(later);

        let mut calls = 0;
        queue.update_timeouts(now + Duration::from_millis(120), usize::MAX, |_, _| {
            calls += 1;
            TimeoutAction::Delete
        });
        assert_eq!(calls, 0);

        queue.update_timeouts(now + Duration::from_millis(180), usize::MAX, |_, _| {
            calls += 1;
            TimeoutAction::Delete
        });
        assert_eq!(calls, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_max_per_sweep() {
        let now = Instant::now();
        let mut queue = TimeoutQueue::new();
        for i in 0..10 {
            queue.register_item(i, Duration::from_millis(1), now);
        }

        let later = now + Duration::from_millis(5);
        assert_eq!(queue.update_timeouts(later, 4, |_, _| TimeoutAction::Delete), 4);
        assert_eq!(queue.len(), 6);
        assert_eq!(queue.update_timeouts(later, 4, |_, _| TimeoutAction::Delete), 4);
        assert_eq!(queue.update_timeouts(later, 4, |_, _| TimeoutAction::Delete), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_packet_timeout_key_packing() {
        let key = PacketTimeoutKey {
            reliable: true,
            connection_id: ConnectionId::from_u32(0x7ABC_1234),
            packet_id: 0xDEAD_BEEF,
        };
        let word = key.pack();
        assert_eq!(word, 0xFABC_1234_DEAD_BEEF);
        assert_eq!(PacketTimeoutKey::unpack(word), key);

        let key = PacketTimeoutKey {
            reliable: false,
            connection_id: ConnectionId::from_u32(3),
            packet_id: 9,
        };
        assert_eq!(PacketTimeoutKey::unpack(key.pack()), key);
    }
}
