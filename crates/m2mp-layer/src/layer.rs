use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use m2mp_channel::{Channel, ChannelRegistry, DaemonChannel, FlowController, Verbosity};
use m2mp_packet::{hex, Packet, PacketPool};
use tracing::{debug, warn};

use crate::config::{M2mpConfig, MAX_FILTER_PREFIX};
use crate::error::{LayerError, Result};
use crate::id::MessageIdGenerator;
use crate::input::{IncomingMessage, MessageInputStream, StreamMap};
use crate::output::{MessageOutputStream, Transmitter};
use crate::queue::MessageQueue;
use crate::router::MessageRouter;

/// Emit one packet event when packet diagnostics are enabled.
pub(crate) fn log_packet(level: Verbosity, event: &str, packet: &Packet) {
    if level.detailed() {
        debug!(
            message_id = packet.message_id(),
            fragment = packet.fragment_number(),
            last = packet.is_last_packet(),
            len = packet.payload_len(),
            payload = %hex(packet.payload()),
            "{event}"
        );
    } else if level.summary() {
        debug!(
            message_id = packet.message_id(),
            fragment = packet.fragment_number(),
            last = packet.is_last_packet(),
            len = packet.payload_len(),
            "{event}"
        );
    }
}

struct LayerInner {
    config: M2mpConfig,
    pool: Arc<PacketPool>,
    router: MessageRouter,
    streams: Arc<StreamMap>,
    queue: MessageQueue<IncomingMessage>,
    channel: Arc<dyn Channel>,
    shut_down: AtomicBool,
}

/// The M2MP layer of one process.
///
/// Owns the packet pool, the message filters, the in-flight reassembly
/// entries and the channel, plus a receiver thread that sorts incoming
/// packets into messages:
///
/// - fragment 0 of an unknown message is offered to the filters and, if
///   accepted, starts a new incoming message;
/// - a later fragment of a known message is appended to it;
/// - anything else is dropped.
///
/// ```no_run
/// use std::io::{Read, Write};
/// use std::time::Duration;
/// use m2mp_layer::{M2mp, M2mpConfig};
///
/// let layer = M2mp::new(M2mpConfig {
///     daemon_port: 5600,
///     ..M2mpConfig::default()
/// })?;
/// layer.add_message_filter(b"greeting/")?;
///
/// let mut out = layer.create_outgoing_message();
/// out.write_all(b"greeting/hello")?;
/// out.close()?;
///
/// if let Some(mut message) = layer.accept_incoming_message_timeout(Duration::from_secs(1))? {
///     let mut text = String::new();
///     message.read_to_string(&mut text)?;
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct M2mp {
    inner: Arc<LayerInner>,
    ids: MessageIdGenerator,
    transmitter: Arc<Transmitter>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl M2mp {
    /// Start a layer using the built-in channel registry.
    pub fn new(config: M2mpConfig) -> Result<Self> {
        Self::with_registry(config, &ChannelRegistry::with_builtins())
    }

    /// Start a layer, resolving the external channel through `registry`.
    ///
    /// With a daemon port configured the layer connects to the local daemon
    /// instead and runs no flow control of its own.
    pub fn with_registry(config: M2mpConfig, registry: &ChannelRegistry) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(PacketPool::new());
        let channel: Arc<dyn Channel> = if config.daemon_port == 0 {
            let external = registry.create(&config.channel, &pool)?;
            Arc::new(FlowController::new(
                Arc::clone(&pool),
                external,
                config.flow_timeout,
                config.debug.receiver_thread,
            )?)
        } else {
            Arc::new(DaemonChannel::connect(
                Arc::clone(&pool),
                config.daemon_port,
                config.debug.receiver_thread,
            )?)
        };
        Self::with_channel(config, pool, channel)
    }

    /// Start a layer on an already assembled channel.
    ///
    /// The channel must honor the loopback contract and allocate from `pool`.
    pub fn with_channel(
        config: M2mpConfig,
        pool: Arc<PacketPool>,
        channel: Arc<dyn Channel>,
    ) -> Result<Self> {
        config.validate()?;
        let ids = MessageIdGenerator::new(config.device_id);
        let transmitter = Arc::new(Transmitter::new(
            Arc::clone(&channel),
            config.redundancy,
            config.debug.packets,
        ));
        let inner = Arc::new(LayerInner {
            router: MessageRouter::new(config.debug.message_filters),
            config,
            pool,
            streams: Arc::new(StreamMap::default()),
            queue: MessageQueue::new(),
            channel,
            shut_down: AtomicBool::new(false),
        });

        let worker = Arc::clone(&inner);
        let receiver = thread::Builder::new()
            .name("m2mp-receiver".to_string())
            .spawn(move || worker.run_receiver())?;

        debug!(
            channel = inner.channel.name(),
            redundancy = inner.config.redundancy,
            "m2mp layer started"
        );
        Ok(Self {
            inner,
            ids,
            transmitter,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn config(&self) -> &M2mpConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.inner.pool
    }

    /// Begin a new outgoing message with a fresh message ID.
    pub fn create_outgoing_message(&self) -> MessageOutputStream {
        MessageOutputStream::new(
            Arc::clone(&self.transmitter),
            Arc::clone(&self.inner.pool),
            self.ids.next_id(),
        )
    }

    /// Deliver incoming messages whose payload starts with `prefix`.
    pub fn add_message_filter(&self, prefix: &[u8]) -> Result<()> {
        check_prefix(prefix)?;
        self.inner.router.add_message_filter(prefix);
        Ok(())
    }

    pub fn remove_message_filter(&self, prefix: &[u8]) -> Result<()> {
        check_prefix(prefix)?;
        self.inner.router.remove_message_filter(prefix);
        Ok(())
    }

    /// Wait for the next accepted incoming message.
    pub fn accept_incoming_message(&self) -> Result<IncomingMessage> {
        self.inner.queue.get()
    }

    /// Wait at most `timeout` for the next accepted incoming message.
    pub fn accept_incoming_message_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<IncomingMessage>> {
        self.inner.queue.get_timeout(timeout)
    }

    /// Number of messages currently being reassembled.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.streams).len()
    }

    /// Close the channel and stop the receiver thread. Blocked acceptors
    /// fail with [`LayerError::Closed`]; open incoming messages are aborted.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.channel.close();
        self.inner.close_streams();
        if let Some(handle) = lock(&self.receiver).take() {
            let _ = handle.join();
        }
        debug!("m2mp layer shut down");
    }
}

impl Drop for M2mp {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for M2mp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("M2mp")
            .field("channel", &self.inner.channel.name())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl LayerInner {
    fn run_receiver(&self) {
        loop {
            match self.channel.receive_packet() {
                Ok(packet) => self.receive_incoming_packet(packet),
                Err(err) => {
                    if !self.shut_down.load(Ordering::SeqCst)
                        && self.config.debug.receiver_thread.summary()
                    {
                        warn!(
                            channel = self.channel.name(),
                            error = %err,
                            "m2mp receiver thread stopping"
                        );
                    }
                    break;
                }
            }
        }
        self.close_streams();
    }

    fn receive_incoming_packet(&self, mut packet: Packet) {
        log_packet(self.config.debug.packets, "incoming packet received", &packet);
        let message_id = packet.message_id();
        let existing = lock(&self.streams).get(&message_id).cloned();
        let fragment = packet.fragment_number();

        match existing {
            None if fragment == 0 => {
                if !self.router.accept_message(&mut packet) {
                    self.pool.deallocate(packet);
                    return;
                }
                let stream = MessageInputStream::register(
                    &self.streams,
                    message_id,
                    Arc::clone(&self.pool),
                    self.config.message_timeout,
                );
                stream.add_packet(packet);
                // A closed queue hands the message back; dropping it closes it.
                let _ = self.queue.put(IncomingMessage::new(stream));
            }
            Some(stream) if fragment > 0 => stream.add_packet(packet),
            _ => self.pool.deallocate(packet),
        }
    }

    /// Close the accept queue and abort every in-flight message.
    fn close_streams(&self) {
        drop(self.queue.close());
        let streams: Vec<_> = lock(&self.streams).drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.abort(ErrorKind::Other, "message input stream aborted: m2mp layer closed");
        }
    }
}

fn check_prefix(prefix: &[u8]) -> Result<()> {
    if prefix.len() > MAX_FILTER_PREFIX {
        return Err(LayerError::FilterTooLong {
            len: prefix.len(),
            max: MAX_FILTER_PREFIX,
        });
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::time::Instant;

    use m2mp_channel::MemoryHub;

    use super::*;

    fn config() -> M2mpConfig {
        M2mpConfig {
            message_timeout: Duration::from_millis(500),
            flow_timeout: Duration::from_millis(200),
            ..M2mpConfig::default()
        }
    }

    fn send(layer: &M2mp, payload: &[u8]) {
        let mut out = layer.create_outgoing_message();
        out.write_all(payload).unwrap();
        out.close().unwrap();
    }

    fn receive(layer: &M2mp) -> Vec<u8> {
        let mut message = layer
            .accept_incoming_message_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("message should arrive");
        let mut body = Vec::new();
        message.read_to_end(&mut body).unwrap();
        body
    }

    fn station(hub: &MemoryHub, pool: &Arc<PacketPool>) -> M2mp {
        let external: Arc<dyn Channel> = Arc::new(hub.attach());
        let channel = FlowController::new(
            Arc::clone(pool),
            external,
            Duration::from_millis(200),
            Verbosity::QUIET,
        )
        .unwrap();
        M2mp::with_channel(config(), Arc::clone(pool), Arc::new(channel)).unwrap()
    }

    fn pair() -> (M2mp, M2mp) {
        let pool = Arc::new(PacketPool::new());
        let hub = MemoryHub::new(Arc::clone(&pool));
        (station(&hub, &pool), station(&hub, &pool))
    }

    #[test]
    fn null_channel_never_delivers_own_messages() {
        let layer = M2mp::new(config()).unwrap();
        layer.add_message_filter(b"").unwrap();

        let start = Instant::now();
        send(&layer, b"hello");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(layer
            .accept_incoming_message_timeout(Duration::from_millis(50))
            .unwrap()
            .is_none());
    }

    #[test]
    fn unmatched_messages_are_not_delivered() {
        let (alice, bob) = pair();
        bob.add_message_filter(b"keep/").unwrap();
        send(&alice, b"drop/this");
        send(&alice, b"keep/this");

        assert_eq!(receive(&bob), b"keep/this");
        assert!(bob
            .accept_incoming_message_timeout(Duration::from_millis(50))
            .unwrap()
            .is_none());
    }

    #[test]
    fn filters_can_be_removed() {
        let (alice, bob) = pair();
        bob.add_message_filter(b"a").unwrap();
        bob.remove_message_filter(b"a").unwrap();
        send(&alice, b"abc");
        assert!(bob
            .accept_incoming_message_timeout(Duration::from_millis(100))
            .unwrap()
            .is_none());
    }

    #[test]
    fn oversized_filter_is_rejected() {
        let layer = M2mp::new(config()).unwrap();
        let prefix = vec![0u8; MAX_FILTER_PREFIX + 1];
        assert!(matches!(
            layer.add_message_filter(&prefix),
            Err(LayerError::FilterTooLong { len, max }) if len == 489 && max == 488
        ));
        layer.add_message_filter(&prefix[..MAX_FILTER_PREFIX]).unwrap();
    }

    #[test]
    fn unknown_channel_fails_startup() {
        let config = M2mpConfig {
            channel: "carrier-pigeon".to_string(),
            ..config()
        };
        assert!(matches!(
            M2mp::new(config),
            Err(LayerError::Channel(m2mp_channel::ChannelError::UnknownChannel(_)))
        ));
    }

    #[test]
    fn shutdown_wakes_blocked_acceptor() {
        let layer = Arc::new(M2mp::new(config()).unwrap());
        let acceptor = {
            let layer = Arc::clone(&layer);
            thread::spawn(move || layer.accept_incoming_message().map(|m| m.message_id()))
        };
        thread::sleep(Duration::from_millis(50));
        layer.shutdown();
        assert!(matches!(acceptor.join().unwrap(), Err(LayerError::Closed)));
        assert!(matches!(
            layer.accept_incoming_message_timeout(Duration::ZERO),
            Err(LayerError::Closed)
        ));
    }

    #[test]
    fn stations_on_a_hub_exchange_messages() {
        let (alice, bob) = pair();
        bob.add_message_filter(b"to-bob:").unwrap();

        let start = Instant::now();
        send(&alice, b"to-bob: lunch?");
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(receive(&bob), b"to-bob: lunch?");
        assert!(alice
            .accept_incoming_message_timeout(Duration::from_millis(50))
            .unwrap()
            .is_none());
    }

    #[test]
    fn partial_message_times_out_for_reader() {
        let pool = Arc::new(PacketPool::new());
        let hub = MemoryHub::new(Arc::clone(&pool));
        let listener = M2mp::with_channel(
            M2mpConfig {
                message_timeout: Duration::from_millis(50),
                ..config()
            },
            Arc::clone(&pool),
            Arc::new(hub.attach()),
        )
        .unwrap();
        listener.add_message_filter(b"").unwrap();

        let raw = hub.attach();
        let mut packet = Packet::new();
        packet.clear();
        packet.put_slice(b"first half").unwrap();
        packet.flip();
        packet.set_message_id(99);
        packet.set_last_packet_and_fragment_number(false, 0);
        raw.transmit_packet(&packet).unwrap();

        let mut message = listener
            .accept_incoming_message_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(message.message_id(), 99);
        let mut body = Vec::new();
        let err = message.read_to_end(&mut body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(body, b"first half");
        assert_eq!(listener.in_flight(), 0);
    }

    #[test]
    fn stations_in_one_process_pick_distinct_ids() {
        let (alice, bob) = pair();
        let ours: Vec<u32> = (0..4)
            .map(|_| alice.create_outgoing_message().message_id())
            .collect();
        let theirs: Vec<u32> = (0..4)
            .map(|_| bob.create_outgoing_message().message_id())
            .collect();
        assert_ne!(ours, theirs);
    }

    #[test]
    fn dropped_partial_messages_leave_no_entries() {
        let pool = Arc::new(PacketPool::new());
        let hub = MemoryHub::new(Arc::clone(&pool));
        let listener = M2mp::with_channel(config(), Arc::clone(&pool), Arc::new(hub.attach()))
            .unwrap();
        listener.add_message_filter(b"").unwrap();

        let raw = hub.attach();
        for id in 1..=20u32 {
            let mut packet = Packet::new();
            packet.clear();
            packet.put_slice(b"never finished").unwrap();
            packet.flip();
            packet.set_message_id(id);
            packet.set_last_packet_and_fragment_number(false, 0);
            raw.transmit_packet(&packet).unwrap();

            let message = listener
                .accept_incoming_message_timeout(Duration::from_secs(5))
                .unwrap()
                .expect("message should arrive");
            assert_eq!(message.message_id(), id);
            drop(message);
        }
        assert_eq!(listener.in_flight(), 0);
    }
}
