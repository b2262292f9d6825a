//! Outbound packet identifier allocation.

use std::num::NonZeroU16;
use std::sync::atomic::{AtomicU16, Ordering};

/// A nonzero MQTT packet identifier.
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash, Debug)]
pub struct PacketId(NonZeroU16);

impl PacketId {
    pub fn new(id: u16) -> Option<PacketId> {
        NonZeroU16::new(id).map(Self)
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }
}

/// Hands out identifiers for outbound QoS > 0 publishes: 1, 2, ... 65535,
/// then wrapping back to 1.
///
/// Allocation happens on registry fan-out threads, so this is lock-free.
/// Acked identifiers are not reclaimed; with a realistic
/// `max-pending-messages` bound the id space cannot collide with an
/// in-flight publish before wrapping all the way around.
#[derive(Debug)]
pub struct PacketIdAllocator {
    next: AtomicU16,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        PacketIdAllocator {
            next: AtomicU16::new(1),
        }
    }

    pub fn allocate(&self) -> PacketId {
        loop {
            // The u16 wraps on its own; we only have to skip the reserved 0.
            let id = self.next.fetch_add(1, Ordering::Relaxed);

            if let Some(id) = PacketId::new(id) {
                return id;
            }
        }
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::PacketIdAllocator;

    #[test]
    fn allocates_sequentially_from_one() {
        let ids = PacketIdAllocator::new();

        assert_eq!(ids.allocate().get(), 1);
        assert_eq!(ids.allocate().get(), 2);
        assert_eq!(ids.allocate().get(), 3);
    }

    #[test]
    fn wraps_past_the_end_skipping_zero() {
        let ids = PacketIdAllocator::new();

        for _ in 0..u16::MAX {
            ids.allocate();
        }

        // The 65536th allocation lands where 0 would be and must skip it.
        assert_eq!(ids.allocate().get(), 1);
    }
}
