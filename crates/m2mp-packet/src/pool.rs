use std::sync::Mutex;

use tracing::{debug, trace};

use crate::packet::Packet;

/// Thread-safe free list of reusable [`Packet`]s.
///
/// The pool grows on demand and never shrinks. One lock serializes
/// [`allocate`](Self::allocate) and [`deallocate`](Self::deallocate).
#[derive(Debug, Default)]
pub struct PacketPool {
    free: Mutex<Vec<Packet>>,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a packet from the free list, or construct a fresh one.
    ///
    /// The returned packet has an empty payload; its header bytes may be
    /// left over from a previous use.
    pub fn allocate(&self) -> Packet {
        if let Some(packet) = self.lock().pop() {
            trace!("reusing pooled packet");
            return packet;
        }
        debug!("packet pool empty: creating new packet");
        Packet::new()
    }

    /// Return a packet to the free list.
    pub fn deallocate(&self, mut packet: Packet) {
        packet.reset();
        self.lock().push(packet);
    }

    /// Number of packets currently on the free list.
    pub fn free_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Packet>> {
        // A panic while holding the lock cannot leave the free list torn.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::packet::{HEADER_SIZE, MAXIMUM_SIZE};

    #[test]
    fn empty_pool_returns_fresh_packet() {
        let pool = PacketPool::new();
        let packet = pool.allocate();
        assert!(Packet::is_valid_length(packet.limit()));
        assert_eq!(packet.limit(), HEADER_SIZE);
        assert_eq!(packet.payload_len(), 0);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn deallocated_packet_is_reused_next() {
        let pool = PacketPool::new();
        let mut packet = pool.allocate();
        packet.clear();
        packet.put_slice(b"marker").unwrap();
        packet.flip();
        let addr = packet.buffer_mut().as_ptr();

        pool.deallocate(packet);
        assert_eq!(pool.free_count(), 1);

        let mut again = pool.allocate();
        assert_eq!(again.buffer_mut().as_ptr(), addr);
        assert_eq!(again.payload_len(), 0);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn free_list_is_lifo() {
        let pool = PacketPool::new();
        let mut first = pool.allocate();
        let mut second = pool.allocate();
        let first_addr = first.buffer_mut().as_ptr();
        let second_addr = second.buffer_mut().as_ptr();

        pool.deallocate(first);
        pool.deallocate(second);

        assert_eq!(pool.allocate().buffer_mut().as_ptr(), second_addr);
        assert_eq!(pool.allocate().buffer_mut().as_ptr(), first_addr);
    }

    #[test]
    fn concurrent_allocate_and_deallocate() {
        let pool = Arc::new(PacketPool::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let mut packet = pool.allocate();
                        packet.clear();
                        assert_eq!(packet.remaining(), MAXIMUM_SIZE - HEADER_SIZE);
                        pool.deallocate(packet);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(pool.free_count() >= 1);
        assert!(pool.free_count() <= 4);
    }
}
