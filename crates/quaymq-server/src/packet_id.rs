//! Packet identifier allocation for broker-to-client deliveries.
//!
//! An identifier stays reserved from the moment its PUBLISH is first sent
//! until the PUBACK or PUBCOMP that completes it arrives. Zero is never
//! handed out.

use ahash::AHashSet;

/// Hands out non-zero packet identifiers that are not currently in flight.
#[derive(Debug)]
pub struct PacketIdAllocator {
    next_id: u16,
    in_use: AHashSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_use: AHashSet::new(),
        }
    }

    /// Reserve the next free identifier, scanning forward from the last one
    /// handed out. Returns `None` only when all 65535 identifiers are taken.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.in_use.len() >= u16::MAX as usize {
            return None;
        }
        loop {
            let id = self.next_id;
            self.advance();
            if self.in_use.insert(id) {
                return Some(id);
            }
        }
    }

    /// Mark an identifier as taken, used when restoring a stored session.
    pub fn reserve(&mut self, id: u16) -> bool {
        id != 0 && self.in_use.insert(id)
    }

    pub fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    fn advance(&mut self) {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.in_use_count(), 2);
    }

    #[test]
    fn test_in_use_ids_are_skipped() {
        let mut ids = PacketIdAllocator::new();
        assert!(ids.reserve(2));
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(3));
        ids.release(1);
        assert!(!ids.is_in_use(1));
        assert!(ids.is_in_use(2));
    }

    #[test]
    fn test_wraps_past_zero() {
        let mut ids = PacketIdAllocator::new();
        ids.next_id = u16::MAX;
        assert_eq!(ids.allocate(), Some(u16::MAX));
        assert_eq!(ids.allocate(), Some(1));
    }

    #[test]
    fn test_exhaustion() {
        let mut ids = PacketIdAllocator::new();
        for _ in 0..u16::MAX {
            assert!(ids.allocate().is_some());
        }
        assert_eq!(ids.allocate(), None);
        ids.release(500);
        assert_eq!(ids.allocate(), Some(500));
    }

    #[test]
    fn test_reserve_rejects_zero_and_duplicates() {
        let mut ids = PacketIdAllocator::new();
        assert!(!ids.reserve(0));
        assert!(ids.reserve(7));
        assert!(!ids.reserve(7));
    }
}
