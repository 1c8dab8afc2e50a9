use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{BufMut, BytesMut};
use m2mp_packet::{Packet, PacketPool, MAXIMUM_SIZE};
use tracing::debug;

use crate::error::{ChannelError, Result};
use crate::traits::{Channel, Verbosity};

/// Length prefix: one big-endian u16 ahead of every packet.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Encode a packet into the daemon link format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────────────────────┐
/// │ Length (2B)  │ Packet bytes (8-508)         │
/// │ big-endian   │ header + payload             │
/// └──────────────┴──────────────────────────────┘
/// ```
pub fn encode_frame(packet: &Packet, dst: &mut BytesMut) {
    let bytes = packet.as_bytes();
    dst.reserve(LENGTH_PREFIX_SIZE + bytes.len());
    dst.put_u16(bytes.len() as u16);
    dst.put_slice(bytes);
}

/// A channel over a TCP loopback connection between a client process and
/// the local M2MP daemon.
///
/// Frames with an invalid length prefix are skipped and reading continues
/// with the next prefix. Any I/O failure shuts the socket down and is
/// returned to the caller; the channel stays closed afterwards.
///
/// The daemon does not echo a client's packets back to it: loopback
/// confirmation happens at the daemon's own flow controller.
pub struct DaemonChannel {
    pool: Arc<PacketPool>,
    reader: Mutex<TcpStream>,
    writer: Mutex<DaemonWriter>,
    control: TcpStream,
    peer: Option<SocketAddr>,
    debug_receiver: Verbosity,
    closed: AtomicBool,
}

struct DaemonWriter {
    stream: TcpStream,
    buf: BytesMut,
}

impl DaemonChannel {
    /// Wrap an accepted or connected stream.
    pub fn new(pool: Arc<PacketPool>, stream: TcpStream, debug_receiver: Verbosity) -> Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            pool,
            reader: Mutex::new(reader),
            writer: Mutex::new(DaemonWriter {
                stream,
                buf: BytesMut::with_capacity(LENGTH_PREFIX_SIZE + MAXIMUM_SIZE),
            }),
            control,
            peer,
            debug_receiver,
            closed: AtomicBool::new(false),
        })
    }

    /// Connect to a daemon listening on `127.0.0.1:port`.
    pub fn connect(pool: Arc<PacketPool>, port: u16, debug_receiver: Verbosity) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let stream =
            TcpStream::connect(addr).map_err(|source| ChannelError::Connect { addr, source })?;
        debug!(%addr, "connected to m2mp daemon");
        Self::new(pool, stream, debug_receiver)
    }

    /// Address of the other end, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn read_packet(&self, stream: &mut TcpStream) -> Result<Packet> {
        let len = loop {
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            stream.read_exact(&mut prefix)?;
            let len = u16::from_be_bytes(prefix) as usize;
            if Packet::is_valid_length(len) {
                break len;
            }
            if self.debug_receiver.detailed() {
                debug!(len, peer = ?self.peer, "daemon channel: invalid packet length");
            }
        };

        let mut packet = self.pool.allocate();
        if let Err(err) = stream.read_exact(&mut packet.buffer_mut()[..len]) {
            self.pool.deallocate(packet);
            return Err(err.into());
        }
        packet.set_limit(len)?;
        packet.rewind();
        Ok(packet)
    }

    fn fail(&self, err: ChannelError) -> ChannelError {
        self.close();
        err
    }
}

impl Channel for DaemonChannel {
    fn receive_packet(&self) -> Result<Packet> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut reader = lock(&self.reader);
        self.read_packet(&mut reader).map_err(|err| self.fail(err))
    }

    fn transmit_packet(&self, packet: &Packet) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut writer = lock(&self.writer);
        let DaemonWriter { stream, buf } = &mut *writer;
        buf.clear();
        encode_frame(packet, buf);

        let mut offset = 0usize;
        while offset < buf.len() {
            match stream.write(&buf[offset..]) {
                Ok(0) => {
                    return Err(self.fail(std::io::Error::from(ErrorKind::WriteZero).into()));
                }
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fail(err.into())),
            }
        }
        stream.flush().map_err(|err| self.fail(err.into()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Unblocks a reader parked in read_exact.
            let _ = self.control.shutdown(Shutdown::Both);
            debug!(peer = ?self.peer, "daemon channel closed");
        }
    }

    fn name(&self) -> &'static str {
        "daemon"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn packet(id: u32, payload: &[u8]) -> Packet {
        let mut packet = Packet::new();
        packet.clear();
        packet.put_slice(payload).unwrap();
        packet.flip();
        packet.set_message_id(id);
        packet.set_last_packet_and_fragment_number(true, 2);
        packet
    }

    fn pair() -> (DaemonChannel, TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = thread::spawn(move || {
            DaemonChannel::connect(Arc::new(PacketPool::new()), port, Verbosity::QUIET).unwrap()
        });
        let (server, _) = listener.accept().unwrap();
        (client.join().unwrap(), server)
    }

    #[test]
    fn encode_prefixes_big_endian_length() {
        let mut buf = BytesMut::new();
        encode_frame(&packet(1, b"abc"), &mut buf);
        assert_eq!(&buf[..2], &[0x00, 11]);
        assert_eq!(buf.len(), 2 + 11);
    }

    #[test]
    fn transmit_writes_length_prefixed_frame() {
        let (channel, mut server) = pair();
        let sent = packet(0xA1B2_C3D4, b"payload");
        channel.transmit_packet(&sent).unwrap();

        let mut prefix = [0u8; 2];
        server.read_exact(&mut prefix).unwrap();
        let len = u16::from_be_bytes(prefix) as usize;
        let mut body = vec![0u8; len];
        server.read_exact(&mut body).unwrap();
        assert_eq!(body.as_slice(), sent.as_bytes());
    }

    #[test]
    fn receive_skips_invalid_lengths() {
        let (channel, mut server) = pair();
        let sent = packet(77, b"ok");

        // Two bogus prefixes, then a real frame.
        server.write_all(&[0x00, 0x03]).unwrap();
        server.write_all(&[0x02, 0x00]).unwrap();
        let mut frame = BytesMut::new();
        encode_frame(&sent, &mut frame);
        server.write_all(&frame).unwrap();

        let mut received = channel.receive_packet().unwrap();
        assert!(received.header_equals(&sent));
        assert_eq!(received.get().unwrap(), b'o');
    }

    #[test]
    fn eof_closes_channel() {
        let (channel, server) = pair();
        drop(server);

        assert!(matches!(channel.receive_packet(), Err(ChannelError::Io(_))));
        assert!(matches!(
            channel.transmit_packet(&packet(1, b"")),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn connect_failure_reports_address() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = DaemonChannel::connect(Arc::new(PacketPool::new()), port, Verbosity::QUIET);
        assert!(matches!(result, Err(ChannelError::Connect { .. })));
    }
}
