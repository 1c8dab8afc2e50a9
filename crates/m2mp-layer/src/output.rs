use std::io::{self, ErrorKind, Write};
use std::sync::Arc;

use m2mp_channel::{Channel, Verbosity};
use m2mp_packet::{Packet, PacketPool};

use crate::layer::log_packet;

/// Sends each outgoing fragment `redundancy` times on the layer's channel.
pub(crate) struct Transmitter {
    channel: Arc<dyn Channel>,
    redundancy: u32,
    debug_packets: Verbosity,
}

impl Transmitter {
    pub(crate) fn new(channel: Arc<dyn Channel>, redundancy: u32, debug_packets: Verbosity) -> Self {
        Self {
            channel,
            redundancy,
            debug_packets,
        }
    }

    pub(crate) fn redundancy(&self) -> u32 {
        self.redundancy
    }

    pub(crate) fn send(&self, packet: &Packet) -> m2mp_channel::Result<()> {
        for _ in 0..self.redundancy {
            log_packet(self.debug_packets, "outgoing packet sent", packet);
            self.channel.transmit_packet(packet)?;
        }
        Ok(())
    }
}

/// Writes one outgoing message as a byte stream.
///
/// Bytes are collected into 500-byte fragments; each full fragment goes out
/// as soon as more data follows it. [`close`](Self::close) sends the final
/// fragment. Dropping a stream without closing it abandons the message.
pub struct MessageOutputStream {
    transmitter: Arc<Transmitter>,
    pool: Arc<PacketPool>,
    packet: Option<Packet>,
    message_id: u32,
    fragment_number: u32,
}

impl MessageOutputStream {
    pub(crate) fn new(transmitter: Arc<Transmitter>, pool: Arc<PacketPool>, message_id: u32) -> Self {
        let mut packet = pool.allocate();
        packet.clear();
        Self {
            transmitter,
            pool,
            packet: Some(packet),
            message_id,
            fragment_number: 0,
        }
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn is_closed(&self) -> bool {
        self.packet.is_none()
    }

    /// Send the final fragment and release the stream's packet.
    ///
    /// A message that fits in one fragment is followed by an empty final
    /// fragment when redundancy is above one, so receivers can tell a
    /// repeated single-fragment message from a two-fragment one.
    pub fn close(&mut self) -> io::Result<()> {
        self.verify_open()?;
        if self.fragment_number == 0 && self.transmitter.redundancy() > 1 {
            self.send_packet(false)?;
            self.send_packet(true)?;
        } else {
            self.send_packet(true)?;
        }
        self.release();
        Ok(())
    }

    fn verify_open(&self) -> io::Result<()> {
        if self.packet.is_none() {
            return Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "message output stream closed",
            ));
        }
        Ok(())
    }

    fn send_packet(&mut self, is_last: bool) -> io::Result<()> {
        let Some(packet) = self.packet.as_mut() else {
            return Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "message output stream closed",
            ));
        };
        packet.flip();
        packet.set_message_id(self.message_id);
        packet.set_last_packet_and_fragment_number(is_last, self.fragment_number);
        self.fragment_number = self.fragment_number.wrapping_add(1);

        if let Err(err) = self.transmitter.send(packet) {
            self.release();
            return Err(err.into());
        }
        packet.clear();
        Ok(())
    }

    fn send_packet_if_full(&mut self) -> io::Result<()> {
        if self.packet.as_ref().is_some_and(|p| p.remaining() == 0) {
            self.send_packet(false)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(packet) = self.packet.take() {
            self.pool.deallocate(packet);
        }
    }
}

impl Write for MessageOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.verify_open()?;
        let mut rest = buf;
        while !rest.is_empty() {
            self.send_packet_if_full()?;
            let Some(packet) = self.packet.as_mut() else {
                break;
            };
            let n = packet.remaining().min(rest.len());
            packet.put_slice(&rest[..n]).map_err(io::Error::other)?;
            rest = &rest[n..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MessageOutputStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use m2mp_channel::{ChannelError, MemoryHub};

    use super::*;

    struct Failing;

    impl Channel for Failing {
        fn receive_packet(&self) -> m2mp_channel::Result<Packet> {
            Err(ChannelError::Closed)
        }

        fn transmit_packet(&self, _packet: &Packet) -> m2mp_channel::Result<()> {
            Err(ChannelError::Closed)
        }

        fn close(&self) {}

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn stream(redundancy: u32) -> (MemoryHub, MessageOutputStream) {
        let pool = Arc::new(PacketPool::new());
        let hub = MemoryHub::new(Arc::clone(&pool));
        let channel: Arc<dyn Channel> = Arc::new(hub.attach());
        let transmitter = Arc::new(Transmitter::new(channel, redundancy, Verbosity::QUIET));
        (hub, MessageOutputStream::new(transmitter, pool, 0x1234_5678))
    }

    fn fragments(hub: &MemoryHub) -> Vec<(u32, bool, usize)> {
        hub.frames()
            .iter()
            .map(|f| (f.fragment_number, f.last, f.payload_len))
            .collect()
    }

    #[test]
    fn empty_message_is_single_last_fragment() {
        let (hub, mut out) = stream(1);
        out.close().unwrap();
        assert_eq!(fragments(&hub), vec![(0, true, 0)]);
        assert!(hub.frames().iter().all(|f| f.message_id == 0x1234_5678));
    }

    #[test]
    fn full_fragments_are_sent_when_more_data_follows() {
        let (hub, mut out) = stream(1);
        out.write_all(&[7u8; 1200]).unwrap();
        assert_eq!(fragments(&hub), vec![(0, false, 500), (1, false, 500)]);
        out.close().unwrap();
        assert_eq!(
            fragments(&hub),
            vec![(0, false, 500), (1, false, 500), (2, true, 200)]
        );
    }

    #[test]
    fn exactly_full_fragment_is_last() {
        let (hub, mut out) = stream(1);
        out.write_all(&[1u8; 1000]).unwrap();
        out.close().unwrap();
        assert_eq!(fragments(&hub), vec![(0, false, 500), (1, true, 500)]);
    }

    #[test]
    fn redundancy_repeats_every_fragment() {
        let (hub, mut out) = stream(3);
        out.write_all(&[0u8; 600]).unwrap();
        out.close().unwrap();
        assert_eq!(
            fragments(&hub),
            vec![
                (0, false, 500),
                (0, false, 500),
                (0, false, 500),
                (1, true, 100),
                (1, true, 100),
                (1, true, 100),
            ]
        );
    }

    #[test]
    fn single_fragment_with_redundancy_gets_empty_last() {
        let (hub, mut out) = stream(2);
        out.write_all(b"ping").unwrap();
        out.close().unwrap();
        assert_eq!(
            fragments(&hub),
            vec![(0, false, 4), (0, false, 4), (1, true, 0), (1, true, 0)]
        );
    }

    #[test]
    fn write_after_close_fails() {
        let (_hub, mut out) = stream(1);
        out.close().unwrap();
        assert!(out.is_closed());
        assert_eq!(out.write(b"x").unwrap_err().kind(), ErrorKind::BrokenPipe);
        assert_eq!(out.close().unwrap_err().kind(), ErrorKind::BrokenPipe);
    }

    #[test]
    fn send_failure_closes_stream_and_returns_packet() {
        let pool = Arc::new(PacketPool::new());
        let transmitter = Arc::new(Transmitter::new(Arc::new(Failing), 1, Verbosity::QUIET));
        let mut out = MessageOutputStream::new(transmitter, Arc::clone(&pool), 1);

        assert!(out.close().is_err());
        assert!(out.is_closed());
        assert_eq!(pool.free_count(), 1);
        assert!(out.write(b"more").is_err());
    }
}
