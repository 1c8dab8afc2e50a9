use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use m2mp_packet::{Packet, PacketPool};
use tracing::trace;

use crate::error::{ChannelError, Result};
use crate::traits::Channel;

/// Header summary of one packet that crossed a [`MemoryHub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub message_id: u32,
    pub fragment_number: u32,
    pub last: bool,
    pub payload_len: usize,
}

/// An in-process broadcast medium.
///
/// Every packet transmitted on any attached [`MemoryChannel`] is copied to
/// every attached channel, the sender included, in transmission order.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    pool: Arc<PacketPool>,
    members: Mutex<Vec<Weak<Member>>>,
    frames: Mutex<Vec<FrameRecord>>,
}

struct Member {
    queue: Mutex<MemberQueue>,
    ready: Condvar,
}

struct MemberQueue {
    packets: VecDeque<Packet>,
    closed: bool,
}

/// One station attached to a [`MemoryHub`].
pub struct MemoryChannel {
    hub: Arc<HubInner>,
    member: Arc<Member>,
}

impl MemoryHub {
    pub fn new(pool: Arc<PacketPool>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                pool,
                members: Mutex::new(Vec::new()),
                frames: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach a new station to the medium.
    pub fn attach(&self) -> MemoryChannel {
        let member = Arc::new(Member {
            queue: Mutex::new(MemberQueue {
                packets: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        });
        lock(&self.inner.members).push(Arc::downgrade(&member));
        MemoryChannel {
            hub: Arc::clone(&self.inner),
            member,
        }
    }

    /// Every packet transmitted so far, in order.
    pub fn frames(&self) -> Vec<FrameRecord> {
        lock(&self.inner.frames).clone()
    }

    /// Number of packets transmitted so far.
    pub fn transmitted(&self) -> usize {
        lock(&self.inner.frames).len()
    }
}

impl Channel for MemoryChannel {
    fn receive_packet(&self) -> Result<Packet> {
        let mut queue = lock(&self.member.queue);
        loop {
            if queue.closed {
                return Err(ChannelError::Closed);
            }
            if let Some(packet) = queue.packets.pop_front() {
                return Ok(packet);
            }
            queue = self
                .member
                .ready
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn transmit_packet(&self, packet: &Packet) -> Result<()> {
        if lock(&self.member.queue).closed {
            return Err(ChannelError::Closed);
        }

        lock(&self.hub.frames).push(FrameRecord {
            message_id: packet.message_id(),
            fragment_number: packet.fragment_number(),
            last: packet.is_last_packet(),
            payload_len: packet.payload_len(),
        });

        let mut members = lock(&self.hub.members);
        members.retain(|member| member.strong_count() > 0);
        for member in members.iter().filter_map(Weak::upgrade) {
            let mut queue = lock(&member.queue);
            if queue.closed {
                continue;
            }
            let mut copy = self.hub.pool.allocate();
            copy.copy_from(packet);
            queue.packets.push_back(copy);
            member.ready.notify_all();
        }
        trace!(
            message_id = packet.message_id(),
            fragment = packet.fragment_number(),
            "memory hub broadcast"
        );
        Ok(())
    }

    fn close(&self) {
        let mut queue = lock(&self.member.queue);
        queue.closed = true;
        for packet in queue.packets.drain(..) {
            self.hub.pool.deallocate(packet);
        }
        self.member.ready.notify_all();
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
