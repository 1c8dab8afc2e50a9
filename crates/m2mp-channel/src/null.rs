use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use m2mp_packet::{Packet, PacketPool};

use crate::error::{ChannelError, Result};
use crate::traits::Channel;

/// A channel with no external medium: transmitted packets only loop back.
///
/// Holds at most one looped-back copy; a second transmit blocks until the
/// first copy has been received.
pub struct NullChannel {
    pool: Arc<PacketPool>,
    state: Mutex<NullState>,
    ready: Condvar,
}

struct NullState {
    slot: Option<Packet>,
    closed: bool,
}

impl NullChannel {
    pub fn new(pool: Arc<PacketPool>) -> Self {
        Self {
            pool,
            state: Mutex::new(NullState {
                slot: None,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NullState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Channel for NullChannel {
    fn receive_packet(&self) -> Result<Packet> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if let Some(packet) = state.slot.take() {
                self.ready.notify_all();
                return Ok(packet);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn transmit_packet(&self, packet: &Packet) -> Result<()> {
        let mut state = self.lock();
        while state.slot.is_some() && !state.closed {
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.closed {
            return Err(ChannelError::Closed);
        }
        let mut copy = self.pool.allocate();
        copy.copy_from(packet);
        state.slot = Some(copy);
        self.ready.notify_all();
        Ok(())
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        if let Some(packet) = state.slot.take() {
            self.pool.deallocate(packet);
        }
        self.ready.notify_all();
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
