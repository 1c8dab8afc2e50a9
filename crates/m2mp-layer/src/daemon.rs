use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use m2mp_channel::{
    Channel, ChannelError, ChannelRegistry, DaemonChannel, FlowController, Verbosity,
};
use m2mp_packet::{Packet, PacketPool};
use tracing::{debug, info, warn};

use crate::config::M2mpConfig;
use crate::error::{LayerError, Result};

/// Relay set member ID of the external channel.
const EXTERNAL: u64 = 0;

struct Member {
    id: u64,
    channel: Arc<dyn Channel>,
}

struct Relay {
    pool: Arc<PacketPool>,
    members: Mutex<Vec<Member>>,
    debug_receiver: Verbosity,
}

/// Local relay that lets several client processes share one external
/// channel.
///
/// Every packet received from one member (a connected client or the
/// flow-controlled external channel) is forwarded to all other members,
/// never back to its source. A member whose channel fails is dropped from
/// the relay set. The daemon runs no flow control for its clients; each
/// client's own layer does that.
pub struct Daemon {
    listener: TcpListener,
    local_addr: SocketAddr,
    relay: Arc<Relay>,
    packets: Sender<(u64, Packet)>,
    next_id: AtomicU64,
}

impl Daemon {
    /// Bind `127.0.0.1:daemon_port` and start relaying to the configured
    /// external channel.
    pub fn bind(config: &M2mpConfig, registry: &ChannelRegistry) -> Result<Self> {
        config.validate()?;
        if config.daemon_port == 0 {
            return Err(LayerError::InvalidConfig(
                "daemon port must be non-zero".to_string(),
            ));
        }
        let pool = Arc::new(PacketPool::new());
        let external = registry.create(&config.channel, &pool)?;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.daemon_port));
        Self::bind_addr(addr, config, pool, external)
    }

    /// Bind `addr` and relay to `external`, which is wrapped in a flow
    /// controller. `external` must allocate from `pool`.
    pub fn bind_addr(
        addr: SocketAddr,
        config: &M2mpConfig,
        pool: Arc<PacketPool>,
        external: Arc<dyn Channel>,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).map_err(|source| ChannelError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let external: Arc<dyn Channel> = Arc::new(FlowController::new(
            Arc::clone(&pool),
            external,
            config.flow_timeout,
            config.debug.receiver_thread,
        )?);
        let relay = Arc::new(Relay {
            pool,
            members: Mutex::new(Vec::new()),
            debug_receiver: config.debug.receiver_thread,
        });

        let (packets, queue) = mpsc::channel();
        {
            let relay = Arc::clone(&relay);
            thread::Builder::new()
                .name("m2mp-daemon-sender".to_string())
                .spawn(move || relay.run_sender(queue))?;
        }

        let daemon = Self {
            listener,
            local_addr,
            relay,
            packets,
            next_id: AtomicU64::new(EXTERNAL + 1),
        };
        daemon.add_member(EXTERNAL, external)?;
        info!(addr = %local_addr, "m2mp daemon listening");
        Ok(daemon)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected client processes.
    pub fn client_count(&self) -> usize {
        self.relay
            .lock()
            .iter()
            .filter(|member| member.id != EXTERNAL)
            .count()
    }

    /// Accept one client connection and add it to the relay set.
    pub fn accept(&self) -> Result<SocketAddr> {
        let (stream, peer) = self.listener.accept().map_err(ChannelError::Accept)?;
        let channel = DaemonChannel::new(
            Arc::clone(&self.relay.pool),
            stream,
            self.relay.debug_receiver,
        )?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.add_member(id, Arc::new(channel))?;
        info!(%peer, client = id, "m2mp client connected");
        Ok(peer)
    }

    /// Accept clients until the listener fails.
    ///
    /// A client whose connection cannot be set up is skipped.
    pub fn serve(&self) -> Result<()> {
        loop {
            match self.accept() {
                Ok(_) => {}
                Err(LayerError::Channel(ChannelError::Accept(err))) => {
                    return Err(ChannelError::Accept(err).into());
                }
                Err(err) => warn!(error = %err, "m2mp client setup failed"),
            }
        }
    }

    /// Close every member channel; relay threads exit once drained.
    pub fn shutdown(&self) {
        let members: Vec<Member> = self.relay.lock().drain(..).collect();
        for member in members {
            member.channel.close();
        }
        debug!(addr = %self.local_addr, "m2mp daemon shut down");
    }

    fn add_member(&self, id: u64, channel: Arc<dyn Channel>) -> Result<()> {
        self.relay.lock().push(Member {
            id,
            channel: Arc::clone(&channel),
        });
        let relay = Arc::clone(&self.relay);
        let packets = self.packets.clone();
        thread::Builder::new()
            .name(format!("m2mp-daemon-receiver-{id}"))
            .spawn(move || relay.run_receiver(id, channel, packets))?;
        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Relay {
    fn run_receiver(&self, id: u64, channel: Arc<dyn Channel>, packets: Sender<(u64, Packet)>) {
        loop {
            match channel.receive_packet() {
                Ok(packet) => {
                    if let Err(mpsc::SendError((_, packet))) = packets.send((id, packet)) {
                        self.pool.deallocate(packet);
                        return;
                    }
                }
                Err(err) => {
                    if self.debug_receiver.summary() {
                        warn!(member = id, error = %err, "m2mp daemon receiver thread stopping");
                    }
                    if self.remove(id) && id != EXTERNAL {
                        info!(client = id, "m2mp client disconnected");
                    }
                    return;
                }
            }
        }
    }

    fn run_sender(&self, queue: Receiver<(u64, Packet)>) {
        while let Ok((source, packet)) = queue.recv() {
            let mut members = self.lock();
            members.retain(|member| {
                if member.id == source {
                    return true;
                }
                match member.channel.transmit_packet(&packet) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(member = member.id, error = %err, "m2mp daemon dropping member");
                        member.channel.close();
                        false
                    }
                }
            });
            drop(members);
            self.pool.deallocate(packet);
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut members = self.lock();
        let before = members.len();
        members.retain(|member| member.id != id);
        before != members.len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Member>> {
        self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use m2mp_channel::MemoryHub;

    use super::*;

    fn packet(id: u32) -> Packet {
        let mut packet = Packet::new();
        packet.clear();
        packet.put_slice(&id.to_be_bytes()).unwrap();
        packet.flip();
        packet.set_message_id(id);
        packet.set_last_packet_and_fragment_number(true, 0);
        packet
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    struct Fixture {
        daemon: Daemon,
        remote: m2mp_channel::MemoryChannel,
        pool: Arc<PacketPool>,
    }

    fn fixture() -> Fixture {
        let pool = Arc::new(PacketPool::new());
        let hub = MemoryHub::new(Arc::clone(&pool));
        let external: Arc<dyn Channel> = Arc::new(hub.attach());
        let remote = hub.attach();
        let config = M2mpConfig {
            flow_timeout: Duration::from_millis(100),
            ..M2mpConfig::default()
        };
        let daemon = Daemon::bind_addr(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            &config,
            Arc::clone(&pool),
            external,
        )
        .unwrap();
        Fixture {
            daemon,
            remote,
            pool,
        }
    }

    fn client(fixture: &Fixture) -> DaemonChannel {
        let channel = DaemonChannel::connect(
            Arc::clone(&fixture.pool),
            fixture.daemon.local_addr().port(),
            Verbosity::QUIET,
        )
        .unwrap();
        fixture.daemon.accept().unwrap();
        channel
    }

    #[test]
    fn bind_requires_daemon_port() {
        let result = Daemon::bind(&M2mpConfig::default(), &ChannelRegistry::with_builtins());
        assert!(matches!(result, Err(LayerError::InvalidConfig(_))));
    }

    #[test]
    fn relay_never_returns_packet_to_source() {
        let fixture = fixture();
        let a = client(&fixture);
        let b = client(&fixture);
        assert_eq!(fixture.daemon.client_count(), 2);

        a.transmit_packet(&packet(1)).unwrap();
        assert_eq!(b.receive_packet().unwrap().message_id(), 1);
        assert_eq!(fixture.remote.receive_packet().unwrap().message_id(), 1);

        b.transmit_packet(&packet(2)).unwrap();
        assert_eq!(a.receive_packet().unwrap().message_id(), 2);
        assert_eq!(fixture.remote.receive_packet().unwrap().message_id(), 2);
    }

    #[test]
    fn external_traffic_reaches_every_client() {
        let fixture = fixture();
        let a = client(&fixture);
        let b = client(&fixture);

        fixture.remote.transmit_packet(&packet(7)).unwrap();
        assert_eq!(a.receive_packet().unwrap().message_id(), 7);
        assert_eq!(b.receive_packet().unwrap().message_id(), 7);
        // The remote station also sees its own loopback.
        assert_eq!(fixture.remote.receive_packet().unwrap().message_id(), 7);
    }

    #[test]
    fn disconnected_client_leaves_relay_set() {
        let fixture = fixture();
        let a = client(&fixture);
        let b = client(&fixture);
        drop(a);

        assert!(wait_until(|| fixture.daemon.client_count() == 1));

        fixture.remote.transmit_packet(&packet(9)).unwrap();
        assert_eq!(b.receive_packet().unwrap().message_id(), 9);
    }
}
