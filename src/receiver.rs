use std::fmt;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::event_loop::{Disposition, EventLoop, Interest, Readiness, WatchId};
use crate::handlers::{HandlerId, HandlerList};
use crate::message::Message;
use crate::protocol::{
    decode_message_head, Header, PacketType, PACKET_HEADER_SIZE, PACKET_MAX_FIXED_PART,
    PACKET_TYPE_OFFSET,
};

/// Size of the buffer used to skip bodies nobody needs.
const DISCARD_CHUNK: usize = 512;

type MessageHandler = dyn Fn(&Arc<Message>) + Send + Sync;
type SkipHandler = dyn Fn(u32) + Send + Sync;
type ClosedHandler = dyn Fn() + Send + Sync;

/// Incremental parser state. Every read advances exactly one stage.
struct ReadState {
    stream: Option<UnixStream>,
    read_watch: Option<WatchId>,
    paused: u32,
    last_index: u32,
    message_received: bool,
    packet: [u8; PACKET_MAX_FIXED_PART],
    packet_size: usize,
    fixed_part: usize,
    packet_read: usize,
    body: Vec<u8>,
}

impl ReadState {
    fn reset_packet(&mut self) {
        self.packet_size = 0;
        self.fixed_part = 0;
        self.packet_read = 0;
        self.body = Vec::new();
    }

    fn packet_type(&self) -> u8 {
        self.packet[PACKET_TYPE_OFFSET]
    }

    /// True for a MESSAGE whose body holds at least the fixed prefix.
    fn is_message(&self) -> bool {
        self.packet_type() == PacketType::Message.as_u8() && self.fixed_part == PACKET_MAX_FIXED_PART
    }
}

enum Step {
    /// Nothing more to read right now.
    Wait,
    /// Progress was made; read again.
    Continue,
    Message(Arc<Message>, Option<u32>),
    /// BYE, end of stream or a read error.
    Closed,
}

/// Receiving end of a log stream.
///
/// Reassembles packets from however many bytes each read returns and
/// reports decoded messages, index gaps and the end of the stream to its
/// handlers. Handlers run on the event loop thread.
pub struct Receiver {
    event_loop: EventLoop,
    this: Weak<Receiver>,
    state: Mutex<ReadState>,
    message_handlers: HandlerList<MessageHandler>,
    skip_handlers: HandlerList<SkipHandler>,
    closed_handlers: HandlerList<ClosedHandler>,
}

impl Receiver {
    /// Starts reading `stream` on `event_loop`. The stream is switched to
    /// non-blocking mode.
    pub fn new(event_loop: &EventLoop, stream: UnixStream) -> io::Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        let receiver = Arc::new_cyclic(|this| Receiver {
            event_loop: event_loop.clone(),
            this: this.clone(),
            state: Mutex::new(ReadState {
                stream: Some(stream),
                read_watch: None,
                paused: 1,
                last_index: 0,
                message_received: false,
                packet: [0u8; PACKET_MAX_FIXED_PART],
                packet_size: 0,
                fixed_part: 0,
                packet_read: 0,
                body: Vec::new(),
            }),
            message_handlers: HandlerList::new(),
            skip_handlers: HandlerList::new(),
            closed_handlers: HandlerList::new(),
        });
        receiver.resume();
        Ok(receiver)
    }

    /// Same as [`new`](Self::new) for a descriptor received from elsewhere,
    /// for instance the stream handed out by a [`Server`](crate::server::Server).
    pub fn from_fd(event_loop: &EventLoop, fd: OwnedFd) -> io::Result<Arc<Self>> {
        Self::new(event_loop, UnixStream::from(fd))
    }

    pub fn add_message_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Arc<Message>) + Send + Sync + 'static,
    {
        self.message_handlers.add(Arc::new(handler))
    }

    /// The handler receives the size of each index gap, reported right
    /// before the message that follows the gap.
    pub fn add_skip_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.skip_handlers.add(Arc::new(handler))
    }

    /// The handler runs once, after BYE, end of stream, a read error or
    /// [`close`](Self::close).
    pub fn add_closed_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.closed_handlers.add(Arc::new(handler))
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.message_handlers.remove(id) || self.skip_handlers.remove(id) || self.closed_handlers.remove(id)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().stream.is_none()
    }

    /// Stops reading until a matching [`resume`](Self::resume). Calls nest.
    /// Data arriving meanwhile stays in the socket.
    pub fn pause(&self) {
        let watch = {
            let mut state = self.state.lock();
            state.paused += 1;
            state.read_watch.take()
        };
        if let Some(watch) = watch {
            self.event_loop.remove_watch(watch);
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        if state.paused == 0 {
            return;
        }
        state.paused -= 1;
        if state.paused > 0 || state.read_watch.is_some() {
            return;
        }
        let Some(fd) = state.stream.as_ref().map(|s| s.as_raw_fd()) else {
            return;
        };
        let this = self.this.clone();
        state.read_watch = Some(self.event_loop.add_watch(fd, Interest::Readable, move |ready| {
            match this.upgrade() {
                Some(receiver) => receiver.on_readable(ready),
                None => Disposition::Remove,
            }
        }));
    }

    /// Closes the stream. The closed handlers run once; later calls do
    /// nothing.
    pub fn close(&self) {
        let (stream, watch) = {
            let mut state = self.state.lock();
            state.reset_packet();
            (state.stream.take(), state.read_watch.take())
        };
        let Some(stream) = stream else {
            return;
        };
        if let Some(watch) = watch {
            self.event_loop.remove_watch(watch);
        }
        drop(stream);
        debug!("receiver closed");
        for handler in self.closed_handlers.snapshot() {
            handler();
        }
    }

    fn on_readable(&self, ready: Readiness) -> Disposition {
        if !ready.readable {
            debug!(hangup = ready.hangup, error = ready.error, "stream failed");
            self.close();
            return Disposition::Remove;
        }
        loop {
            let step = {
                let mut guard = self.state.lock();
                if guard.paused > 0 || guard.stream.is_none() {
                    return Disposition::Remove;
                }
                read_step(&mut guard)
            };
            match step {
                Step::Wait => return Disposition::Continue,
                Step::Continue => {}
                Step::Message(message, skipped) => {
                    if let Some(skipped) = skipped {
                        for handler in self.skip_handlers.snapshot() {
                            handler(skipped);
                        }
                    }
                    for handler in self.message_handlers.snapshot() {
                        handler(&message);
                    }
                }
                Step::Closed => {
                    self.close();
                    return Disposition::Remove;
                }
            }
        }
    }
}

/// One read from the stream into whichever stage is incomplete.
fn read_chunk(stream: &UnixStream, buf: &mut [u8]) -> Result<usize, Step> {
    let mut reader = stream;
    loop {
        match reader.read(buf) {
            Ok(0) => {
                debug!("end of stream");
                return Err(Step::Closed);
            }
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Err(Step::Wait),
            Err(err) => {
                debug!(error = %err, "read failed");
                return Err(Step::Closed);
            }
        }
    }
}

fn read_step(state: &mut ReadState) -> Step {
    let ReadState {
        stream,
        packet,
        packet_size,
        fixed_part,
        packet_read,
        ..
    } = &mut *state;
    let Some(stream) = stream.as_ref() else {
        return Step::Closed;
    };

    if *packet_read < PACKET_HEADER_SIZE {
        match read_chunk(stream, &mut packet[*packet_read..PACKET_HEADER_SIZE]) {
            Ok(n) => *packet_read += n,
            Err(step) => return step,
        }
        if *packet_read < PACKET_HEADER_SIZE {
            return Step::Continue;
        }
        let mut head = [0u8; PACKET_HEADER_SIZE];
        head.copy_from_slice(&packet[..PACKET_HEADER_SIZE]);
        let header = Header::decode(&head);
        *packet_size = header.packet_size();
        *fixed_part = header.fixed_part();
    }

    if *packet_read < *fixed_part {
        match read_chunk(stream, &mut packet[*packet_read..*fixed_part]) {
            Ok(n) => *packet_read += n,
            Err(step) => return step,
        }
        if *packet_read < *fixed_part {
            return Step::Continue;
        }
    }

    if *packet_read < *packet_size {
        let offset = *packet_read - *fixed_part;
        let remaining = *packet_size - *packet_read;
        let result = if state.is_message() {
            if state.body.is_empty() {
                state.body = vec![0u8; remaining];
            }
            let Some(stream) = state.stream.as_ref() else {
                return Step::Closed;
            };
            read_chunk(stream, &mut state.body[offset..])
        } else {
            let mut scratch = [0u8; DISCARD_CHUNK];
            let len = remaining.min(DISCARD_CHUNK);
            let Some(stream) = state.stream.as_ref() else {
                return Step::Closed;
            };
            read_chunk(stream, &mut scratch[..len])
        };
        match result {
            Ok(n) => state.packet_read += n,
            Err(step) => return step,
        }
        if state.packet_read < state.packet_size {
            return Step::Continue;
        }
    }

    complete_packet(state)
}

fn complete_packet(state: &mut ReadState) -> Step {
    let packet_type = state.packet_type();
    if state.is_message() {
        let body = std::mem::take(&mut state.body);
        let message = decode_message_head(&state.packet, body);
        let skipped = if state.message_received {
            let expected = state.last_index.wrapping_add(1);
            let index = message.index();
            if index > expected {
                Some(index - expected)
            } else if index < expected {
                Some(expected - index)
            } else {
                None
            }
        } else {
            None
        };
        state.message_received = true;
        state.last_index = message.index();
        state.reset_packet();
        trace!(index = message.index(), "message received");
        return Step::Message(Arc::new(message), skipped);
    }

    state.reset_packet();
    match PacketType::from_u8(packet_type) {
        Some(PacketType::Ping) => {
            trace!("ping");
            Step::Continue
        }
        Some(PacketType::Bye) => {
            debug!("bye");
            Step::Closed
        }
        _ => {
            debug!(packet_type, "unexpected packet skipped");
            Step::Continue
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Some(watch) = self.state.get_mut().read_watch.take() {
            self.event_loop.remove_watch(watch);
        }
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Receiver")
            .field("closed", &state.stream.is_none())
            .field("paused", &state.paused)
            .field("last_index", &state.last_index)
            .finish()
    }
}
