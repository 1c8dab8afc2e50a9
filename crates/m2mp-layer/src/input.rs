use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use m2mp_packet::{Packet, PacketPool};
use tracing::debug;

/// Live reassembly entries keyed by message ID.
pub(crate) type StreamMap = Mutex<HashMap<u32, Arc<MessageInputStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No unread fragment is buffered.
    WaitingForPacket,
    /// The head fragment may still hold unread bytes.
    Packet,
    /// The last fragment has been drained.
    Eof,
    Closed,
}

struct InputState {
    phase: Phase,
    fragments: VecDeque<Packet>,
    next_fragment: u32,
    last_received: bool,
    failure: Option<(ErrorKind, &'static str)>,
}

/// Reassembles one incoming message from its fragments.
///
/// The receiver thread feeds fragments through
/// [`add_packet`](Self::add_packet); consumers drain them in order. A reader
/// waiting for the next fragment gives up after the message timeout, which
/// aborts the stream and discards whatever was buffered.
pub struct MessageInputStream {
    key: u32,
    map: Arc<StreamMap>,
    pool: Arc<PacketPool>,
    message_timeout: Duration,
    state: Mutex<InputState>,
    arrived: Condvar,
}

impl MessageInputStream {
    /// Create a stream for `key` and enter it in `map`.
    pub(crate) fn register(
        map: &Arc<StreamMap>,
        key: u32,
        pool: Arc<PacketPool>,
        message_timeout: Duration,
    ) -> Arc<Self> {
        let stream = Arc::new(Self {
            key,
            map: Arc::clone(map),
            pool,
            message_timeout,
            state: Mutex::new(InputState {
                phase: Phase::WaitingForPacket,
                fragments: VecDeque::new(),
                next_fragment: 0,
                last_received: false,
                failure: None,
            }),
            arrived: Condvar::new(),
        });
        lock(map).insert(key, Arc::clone(&stream));
        stream
    }

    pub fn message_id(&self) -> u32 {
        self.key
    }

    /// Offer a received fragment.
    ///
    /// Out-of-sequence fragments are dropped. Once the stream is at EOF, a
    /// fragment carrying the last-packet flag retires the map entry so later
    /// traffic with this ID starts a new message.
    pub fn add_packet(&self, mut packet: Packet) {
        let mut state = self.lock();
        match state.phase {
            Phase::WaitingForPacket | Phase::Packet => {
                if state.last_received || packet.fragment_number() != state.next_fragment {
                    self.pool.deallocate(packet);
                    return;
                }
                state.next_fragment = state.next_fragment.wrapping_add(1);
                state.last_received = packet.is_last_packet();
                packet.rewind();
                state.fragments.push_back(packet);
                state.phase = Phase::Packet;
                self.arrived.notify_all();
            }
            Phase::Eof | Phase::Closed => {
                if packet.is_last_packet() {
                    self.deregister();
                }
                self.pool.deallocate(packet);
            }
        }
    }

    /// Read up to `buf.len()` bytes. Returns 0 at end of message.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        state.verify_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        state = self.next_readable(state)?;
        if state.phase == Phase::Eof {
            return Ok(0);
        }
        let Some(head) = state.fragments.front_mut() else {
            return Ok(0);
        };
        let n = head.remaining().min(buf.len());
        head.get_slice(&mut buf[..n]).map_err(io::Error::other)?;
        Ok(n)
    }

    /// Read one byte, or `None` at end of message.
    pub fn read_byte(&self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Skip up to `len` bytes of the current fragment; returns the count skipped.
    pub fn skip(&self, len: usize) -> io::Result<usize> {
        let mut state = self.lock();
        state.verify_open()?;
        if len == 0 {
            return Ok(0);
        }
        state = self.next_readable(state)?;
        if state.phase == Phase::Eof {
            return Ok(0);
        }
        let Some(head) = state.fragments.front_mut() else {
            return Ok(0);
        };
        let n = head.remaining().min(len);
        head.skip(n).map_err(io::Error::other)?;
        Ok(n)
    }

    /// Bytes that can be read without blocking.
    pub fn available(&self) -> io::Result<usize> {
        let state = self.lock();
        state.verify_open()?;
        if state.phase != Phase::Packet {
            return Ok(0);
        }
        Ok(state.fragments.iter().map(Packet::remaining).sum())
    }

    /// Close the stream, discard buffered fragments and retire the map entry.
    pub fn close(&self) {
        self.abort(ErrorKind::Other, "message input stream closed");
    }

    /// Abort the stream with an error reported to current and later reads.
    pub(crate) fn abort(&self, kind: ErrorKind, message: &'static str) {
        let mut state = self.lock();
        if state.phase == Phase::Closed {
            return;
        }
        for packet in state.fragments.drain(..) {
            self.pool.deallocate(packet);
        }
        state.phase = Phase::Closed;
        state.failure = Some((kind, message));
        self.arrived.notify_all();
        self.deregister();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().phase == Phase::Closed
    }

    /// Advance to a fragment with unread bytes, to EOF, or fail.
    fn next_readable<'a>(
        &'a self,
        mut state: MutexGuard<'a, InputState>,
    ) -> io::Result<MutexGuard<'a, InputState>> {
        loop {
            match state.phase {
                Phase::Closed => return Err(state.error()),
                Phase::Eof => return Ok(state),
                Phase::Packet => {
                    let Some(head) = state.fragments.front() else {
                        state.phase = Phase::WaitingForPacket;
                        continue;
                    };
                    if head.remaining() > 0 {
                        return Ok(state);
                    }
                    if head.is_last_packet() {
                        state.phase = Phase::Eof;
                        return Ok(state);
                    }
                    if let Some(done) = state.fragments.pop_front() {
                        self.pool.deallocate(done);
                    }
                    if state.fragments.is_empty() {
                        state.phase = Phase::WaitingForPacket;
                    }
                }
                Phase::WaitingForPacket => {
                    let deadline = Instant::now() + self.message_timeout;
                    while state.phase == Phase::WaitingForPacket {
                        let now = Instant::now();
                        if now >= deadline {
                            drop(state);
                            debug!(message_id = self.key, "incoming message timed out");
                            self.abort(ErrorKind::TimedOut, "incoming M2MP message timed out");
                            return Err(self.lock().error());
                        }
                        state = self
                            .arrived
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .0;
                    }
                }
            }
        }
    }

    fn deregister(&self) {
        let mut map = lock(&self.map);
        if map
            .get(&self.key)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self))
        {
            map.remove(&self.key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, InputState> {
        lock(&self.state)
    }
}

impl InputState {
    fn verify_open(&self) -> io::Result<()> {
        match self.phase {
            Phase::Closed => Err(self.error()),
            _ => Ok(()),
        }
    }

    fn error(&self) -> io::Error {
        let (kind, message) = self
            .failure
            .unwrap_or((ErrorKind::Other, "message input stream closed"));
        io::Error::new(kind, message)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An accepted incoming message, read as a byte stream.
///
/// Dropping the handle closes the underlying stream.
pub struct IncomingMessage {
    stream: Arc<MessageInputStream>,
}

impl IncomingMessage {
    pub(crate) fn new(stream: Arc<MessageInputStream>) -> Self {
        Self { stream }
    }

    pub fn message_id(&self) -> u32 {
        self.stream.message_id()
    }

    pub fn available(&self) -> io::Result<usize> {
        self.stream.available()
    }

    pub fn skip(&mut self, len: usize) -> io::Result<usize> {
        self.stream.skip(len)
    }

    pub fn close(self) {
        self.stream.close();
    }
}

impl Read for IncomingMessage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Drop for IncomingMessage {
    fn drop(&mut self) {
        self.stream.close();
    }
}

impl std::fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("message_id", &format_args!("{:#010x}", self.message_id()))
            .finish()
    }
}
