use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use m2mp_packet::{Packet, PacketPool, HEADER_SIZE};
use tracing::{debug, warn};

use crate::error::{ChannelError, Result};
use crate::traits::{Channel, Verbosity};

/// Flow-control cycle of the single outgoing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Idle: the next transmit may start.
    WaitingForOutgoing,
    /// A packet was sent; waiting for its copy to loop back.
    WaitingForLoopback,
    /// Loopback seen; draining packets that were queued behind it.
    WaitingForProcessing,
}

struct FlowState {
    phase: Phase,
    pending: Option<[u8; HEADER_SIZE]>,
    /// Incremented per transmit so a sender can tell its own cycle ended.
    cycle: u64,
    closed: bool,
}

struct Incoming {
    packets: VecDeque<Packet>,
    closed: bool,
    failure: Option<ChannelError>,
}

struct FlowInner {
    external: Arc<dyn Channel>,
    pool: Arc<PacketPool>,
    flow_timeout: Duration,
    debug_receiver: Verbosity,
    state: Mutex<FlowState>,
    state_changed: Condvar,
    incoming: Mutex<Incoming>,
    incoming_ready: Condvar,
}

/// Channel decorator that allows one unconfirmed outgoing packet at a time.
///
/// [`transmit_packet`](Channel::transmit_packet) sends immediately and then
/// blocks until the packet's own loopback has been seen on the receive side,
/// or until the flow timeout expires. A timeout silently frees the slot;
/// delivery stays best effort. Concurrent transmits are serialized.
///
/// A background thread pulls packets from the wrapped channel into a FIFO;
/// [`receive_packet`](Channel::receive_packet) drains that FIFO, consumes the
/// matching loopback, and hands every other packet to the caller.
pub struct FlowController {
    inner: Arc<FlowInner>,
}

impl FlowController {
    /// Wrap `external` and start the receiver thread.
    pub fn new(
        pool: Arc<PacketPool>,
        external: Arc<dyn Channel>,
        flow_timeout: Duration,
        debug_receiver: Verbosity,
    ) -> Result<Self> {
        let inner = Arc::new(FlowInner {
            external,
            pool,
            flow_timeout,
            debug_receiver,
            state: Mutex::new(FlowState {
                phase: Phase::WaitingForOutgoing,
                pending: None,
                cycle: 0,
                closed: false,
            }),
            state_changed: Condvar::new(),
            incoming: Mutex::new(Incoming {
                packets: VecDeque::new(),
                closed: false,
                failure: None,
            }),
            incoming_ready: Condvar::new(),
        });

        let worker = Arc::clone(&inner);
        thread::Builder::new()
            .name("m2mp-flow-receiver".to_string())
            .spawn(move || worker.run_receiver())?;

        debug!(external = inner.external.name(), timeout = ?flow_timeout, "flow controller started");
        Ok(Self { inner })
    }
}

impl FlowInner {
    fn run_receiver(&self) {
        loop {
            match self.external.receive_packet() {
                Ok(packet) => {
                    let mut incoming = lock(&self.incoming);
                    if incoming.closed {
                        self.pool.deallocate(packet);
                        return;
                    }
                    incoming.packets.push_back(packet);
                    self.incoming_ready.notify_all();
                }
                Err(err) => {
                    if self.debug_receiver.summary() {
                        warn!(
                            channel = self.external.name(),
                            error = %err,
                            "flow controller receiver thread stopping"
                        );
                    }
                    self.shut(Some(err));
                    return;
                }
            }
        }
    }

    /// Mark both sides closed and wake everyone.
    fn shut(&self, failure: Option<ChannelError>) {
        {
            let mut incoming = lock(&self.incoming);
            if !incoming.closed {
                incoming.closed = true;
                incoming.failure = failure;
            }
            self.incoming_ready.notify_all();
        }
        let mut state = lock(&self.state);
        state.closed = true;
        state.pending = None;
        self.state_changed.notify_all();
    }

    /// Pop the next queued packet and whether the queue is now empty.
    fn next_incoming(&self) -> Result<(Packet, bool)> {
        let mut incoming = lock(&self.incoming);
        loop {
            if let Some(packet) = incoming.packets.pop_front() {
                let drained = incoming.packets.is_empty();
                return Ok((packet, drained));
            }
            if incoming.closed {
                return Err(incoming.failure.take().unwrap_or(ChannelError::Closed));
            }
            incoming = self
                .incoming_ready
                .wait(incoming)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn release_slot(&self, state: &mut FlowState) {
        state.phase = Phase::WaitingForOutgoing;
        state.pending = None;
        self.state_changed.notify_all();
    }
}

impl Channel for FlowController {
    fn receive_packet(&self) -> Result<Packet> {
        let inner = &self.inner;
        loop {
            let (packet, drained) = inner.next_incoming()?;

            let mut state = lock(&inner.state);
            match state.phase {
                Phase::WaitingForOutgoing => return Ok(packet),
                Phase::WaitingForLoopback => {
                    if state.pending != Some(packet.header()) {
                        return Ok(packet);
                    }
                    inner.pool.deallocate(packet);
                    if drained {
                        inner.release_slot(&mut state);
                    } else {
                        state.pending = None;
                        state.phase = Phase::WaitingForProcessing;
                    }
                }
                Phase::WaitingForProcessing => {
                    if drained {
                        inner.release_slot(&mut state);
                    }
                    return Ok(packet);
                }
            }
        }
    }

    fn transmit_packet(&self, packet: &Packet) -> Result<()> {
        let inner = &self.inner;
        let cycle = {
            let mut state = lock(&inner.state);
            while state.phase != Phase::WaitingForOutgoing && !state.closed {
                state = inner
                    .state_changed
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if state.closed {
                return Err(ChannelError::Closed);
            }
            state.phase = Phase::WaitingForLoopback;
            state.pending = Some(packet.header());
            state.cycle = state.cycle.wrapping_add(1);
            state.cycle
        };

        if let Err(err) = inner.external.transmit_packet(packet) {
            let mut state = lock(&inner.state);
            if state.cycle == cycle && state.phase == Phase::WaitingForLoopback {
                inner.release_slot(&mut state);
            }
            return Err(err);
        }

        let deadline = Instant::now() + inner.flow_timeout;
        let mut state = lock(&inner.state);
        loop {
            if state.cycle != cycle || state.phase == Phase::WaitingForOutgoing {
                return Ok(());
            }
            if state.closed {
                return Err(ChannelError::Closed);
            }
            match state.phase {
                Phase::WaitingForLoopback => {
                    let now = Instant::now();
                    if now >= deadline {
                        if inner.debug_receiver.detailed() {
                            debug!(
                                message_id = packet.message_id(),
                                fragment = packet.fragment_number(),
                                "flow control timeout; releasing send slot"
                            );
                        }
                        inner.release_slot(&mut state);
                        return Ok(());
                    }
                    state = inner
                        .state_changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
                _ => {
                    state = inner
                        .state_changed
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    fn close(&self) {
        self.inner.external.close();
        self.inner.shut(None);
        let mut incoming = lock(&self.inner.incoming);
        for packet in incoming.packets.drain(..) {
            self.inner.pool.deallocate(packet);
        }
    }

    fn name(&self) -> &'static str {
        "flow-controller"
    }
}

impl Drop for FlowController {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
