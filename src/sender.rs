use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::event_loop::{Disposition, EventLoop, Interest, Readiness, WatchId};
use crate::handlers::{HandlerId, HandlerList};
use crate::message::Message;
use crate::protocol::{
    encode_control, encode_message_head, PacketType, PACKET_HEADER_SIZE, PACKET_MAX_FIXED_PART,
};
use crate::transport::{send_nosignal, socket_pair};

/// Backlog used when a capacity of 0 is requested.
pub const DEFAULT_BACKLOG: usize = 1000;

/// Capacity of a sender's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backlog {
    Limited(usize),
    Unlimited,
}

impl Backlog {
    /// Maps a raw capacity value: positive values are taken as is, 0 means
    /// [`DEFAULT_BACKLOG`], negative values mean unlimited.
    ///
    /// # Examples
    ///
    /// ```
    /// # use logstream::sender::Backlog;
    /// assert_eq!(Backlog::normalize(7), Backlog::Limited(7));
    /// assert_eq!(Backlog::normalize(0), Backlog::Limited(1000));
    /// assert_eq!(Backlog::normalize(-1), Backlog::Unlimited);
    /// ```
    pub fn normalize(raw: i64) -> Self {
        if raw > 0 {
            Backlog::Limited(usize::try_from(raw).unwrap_or(usize::MAX))
        } else if raw == 0 {
            Backlog::Limited(DEFAULT_BACKLOG)
        } else {
            Backlog::Unlimited
        }
    }

    /// The raw value, `-1` for unlimited.
    pub fn as_raw(self) -> i64 {
        match self {
            Backlog::Limited(n) => i64::try_from(n).unwrap_or(i64::MAX),
            Backlog::Unlimited => -1,
        }
    }

    fn admits(self, count: usize) -> bool {
        match self {
            Backlog::Limited(n) => count < n,
            Backlog::Unlimited => true,
        }
    }
}

impl Default for Backlog {
    fn default() -> Self {
        Backlog::Limited(DEFAULT_BACKLOG)
    }
}

impl fmt::Display for Backlog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backlog::Limited(n) => write!(f, "{}", n),
            Backlog::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// The packet currently being written.
#[derive(Clone)]
struct Frame {
    head: [u8; PACKET_MAX_FIXED_PART],
    fixed_part: usize,
    written: usize,
    message: Option<Arc<Message>>,
}

impl Frame {
    fn message(message: Arc<Message>) -> Self {
        Self {
            head: encode_message_head(&message),
            fixed_part: PACKET_MAX_FIXED_PART,
            written: 0,
            message: Some(message),
        }
    }

    fn control(packet_type: PacketType) -> Self {
        let mut head = [0u8; PACKET_MAX_FIXED_PART];
        head[..PACKET_HEADER_SIZE].copy_from_slice(&encode_control(packet_type));
        Self {
            head,
            fixed_part: PACKET_HEADER_SIZE,
            written: 0,
            message: None,
        }
    }

    fn size(&self) -> usize {
        self.fixed_part + self.message.as_ref().map_or(0, |m| m.text().len())
    }

    fn is_complete(&self) -> bool {
        self.written >= self.size()
    }

    /// Bytes left in the current stage: the fixed part first, then the text.
    fn remaining(&self) -> &[u8] {
        if self.written < self.fixed_part {
            &self.head[self.written..self.fixed_part]
        } else {
            match &self.message {
                Some(message) => &message.text().as_bytes()[self.written - self.fixed_part..],
                None => &[],
            }
        }
    }
}

struct Pipeline {
    queue: VecDeque<Arc<Message>>,
    capacity: Backlog,
    frame: Option<Frame>,
    // BYE goes out once the queue drains
    bye: bool,
    // No more messages are accepted
    done: bool,
}

impl Pipeline {
    fn in_flight(&self) -> usize {
        match &self.frame {
            Some(Frame { message: Some(_), .. }) => 1,
            _ => 0,
        }
    }

    /// Replaces a completed frame with the next one, if any.
    fn advance(&mut self) {
        self.frame = if let Some(message) = self.queue.pop_front() {
            Some(Frame::message(message))
        } else if self.bye {
            self.bye = false;
            Some(Frame::control(PacketType::Bye))
        } else {
            None
        };
    }
}

struct IoState {
    stream: Option<UnixStream>,
    write_watch: Option<WatchId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStatus {
    /// The socket is full; wait for it to become writable.
    Pending,
    /// Everything was written.
    Idle,
    /// Everything was written and the sender is closing.
    Finished,
    Failed,
}

type ClosedHandler = dyn Fn() + Send + Sync;

/// Outbound side of a single subscriber stream.
///
/// A sender owns one end of a socket pair and a bounded queue of messages.
/// Any thread may [`send`](Sender::send); the bytes are written by the
/// thread driving the sender's [`EventLoop`], one frame at a time, as fast as
/// the subscriber reads them.
///
/// # Overflow
///
/// The backlog bounds queued messages plus the one being written. When a
/// new message would exceed it, the oldest half of that total is dropped
/// from the queue first, then more old messages if the backlog was shrunk
/// meanwhile. The new message is always queued, so the subscriber sees
/// every loss as an index gap. With a backlog of 1 the newest message
/// waits behind the one being written.
pub struct Sender {
    name: String,
    event_loop: EventLoop,
    this: Weak<Sender>,
    // Lock order: io, then state
    io: Mutex<IoState>,
    state: Mutex<Pipeline>,
    peer: Mutex<Option<UnixStream>>,
    closed_handlers: HandlerList<ClosedHandler>,
}

impl Sender {
    /// Creates a sender with a fresh socket pair.
    ///
    /// The remote end is kept until [`take_peer`](Self::take_peer) hands it
    /// to the subscriber.
    ///
    /// # Arguments
    ///
    /// * `event_loop` - Loop that performs all writes
    /// * `name` - Used in diagnostics only
    /// * `backlog` - Queue capacity
    pub fn new(event_loop: &EventLoop, name: &str, backlog: Backlog) -> io::Result<Arc<Self>> {
        let (local, remote) = socket_pair()?;
        debug!(sender = %name, %backlog, "sender created");
        Ok(Arc::new_cyclic(|this| Sender {
            name: name.to_string(),
            event_loop: event_loop.clone(),
            this: this.clone(),
            io: Mutex::new(IoState {
                stream: Some(local),
                write_watch: None,
            }),
            state: Mutex::new(Pipeline {
                queue: VecDeque::new(),
                capacity: backlog,
                frame: None,
                bye: false,
                done: false,
            }),
            peer: Mutex::new(Some(remote)),
            closed_handlers: HandlerList::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hands out the subscriber's end of the stream. Returns `None` after
    /// the first call or once the sender is shut down.
    pub fn take_peer(&self) -> Option<UnixStream> {
        self.peer.lock().take()
    }

    pub fn backlog(&self) -> Backlog {
        self.state.lock().capacity
    }

    /// Changes the capacity used by later overflow checks. A queue that is
    /// already longer is not trimmed.
    pub fn set_backlog(&self, backlog: Backlog) {
        self.state.lock().capacity = backlog;
    }

    /// Messages waiting behind the one being written.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when nothing is being written or queued.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.frame.is_none() && state.queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.io.lock().stream.is_none()
    }

    /// Queues a message for delivery. Never blocks on I/O.
    ///
    /// Does nothing once the sender is closing. See the type docs for what
    /// happens when the backlog is full.
    pub fn send(&self, message: Arc<Message>) {
        let start = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            if state.frame.is_none() {
                state.frame = Some(Frame::message(message));
                true
            } else {
                let in_flight = state.in_flight();
                let total = state.queue.len() + in_flight;
                if !state.capacity.admits(total) {
                    let drop_count = (total / 2).min(state.queue.len());
                    state.queue.drain(..drop_count);
                    debug!(sender = %self.name, dropped = drop_count, "queue full");
                }
                // A shrunken backlog may need more than half to go
                while !state.queue.is_empty() && !state.capacity.admits(state.queue.len() + in_flight) {
                    state.queue.pop_front();
                }
                state.queue.push_back(message);
                false
            }
        };
        if start {
            self.schedule_on_loop();
        }
    }

    /// Sends a PING if the sender is completely idle.
    ///
    /// # Returns
    ///
    /// Whether a PING was actually queued.
    pub fn ping(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.done || state.frame.is_some() || !state.queue.is_empty() {
                return false;
            }
            state.frame = Some(Frame::control(PacketType::Ping));
        }
        self.schedule_on_loop();
        true
    }

    /// Stops accepting messages and finishes the stream once the queue
    /// drains.
    ///
    /// With `bye` the last packet is a BYE; without it the transport is
    /// shut down after the last message. Calling it again has no effect.
    pub fn close(&self, bye: bool) {
        let idle = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            if state.frame.is_none() && state.queue.is_empty() {
                if bye {
                    state.frame = Some(Frame::control(PacketType::Bye));
                }
                true
            } else {
                state.bye = bye;
                false
            }
        };
        debug!(sender = %self.name, bye, "closing");
        if idle {
            if bye {
                self.schedule_on_loop();
            } else if let Some(this) = self.this.upgrade() {
                self.event_loop.invoke(move || this.shutdown(true));
            }
        }
    }

    /// Closes the transport right away, discarding anything not yet
    /// written.
    ///
    /// With `flush` the socket is only shut down for writing so bytes
    /// already submitted still reach the subscriber. Emits the closed
    /// notification exactly once; later calls do nothing.
    pub fn shutdown(&self, flush: bool) {
        let (stream, watch) = {
            let mut io = self.io.lock();
            (io.stream.take(), io.write_watch.take())
        };
        let Some(stream) = stream else {
            return;
        };
        let discarded = {
            let mut state = self.state.lock();
            state.done = true;
            state.bye = false;
            state.frame = None;
            std::mem::take(&mut state.queue)
        };
        drop(discarded);
        drop(self.peer.lock().take());
        if let Some(watch) = watch {
            self.event_loop.remove_watch(watch);
        }
        let how = if flush { Shutdown::Write } else { Shutdown::Both };
        if let Err(err) = stream.shutdown(how) {
            trace!(sender = %self.name, error = %err, "socket shutdown failed");
        }
        drop(stream);
        debug!(sender = %self.name, flush, "stream closed");
        for handler in self.closed_handlers.snapshot() {
            handler();
        }
    }

    /// Registers a callback for the end of the stream.
    pub fn add_closed_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.closed_handlers.add(Arc::new(handler))
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.closed_handlers.remove(id)
    }

    fn schedule_on_loop(&self) {
        if let Some(this) = self.this.upgrade() {
            self.event_loop.invoke(move || this.schedule_write());
        }
    }

    /// Writes what it can and arms a write watch if the socket fills up.
    /// Runs on the loop thread.
    fn schedule_write(&self) {
        let status = {
            let mut io = self.io.lock();
            if io.write_watch.is_some() {
                // The watch picks up new frames
                return;
            }
            let Some(stream) = io.stream.as_ref() else {
                return;
            };
            let status = self.write_frames(stream);
            if status == WriteStatus::Pending {
                let fd = stream.as_raw_fd();
                let this = self.this.clone();
                io.write_watch = Some(self.event_loop.add_watch(
                    fd,
                    Interest::Writable,
                    move |ready| match this.upgrade() {
                        Some(sender) => sender.on_writable(ready),
                        None => Disposition::Remove,
                    },
                ));
            }
            status
        };
        self.finish_write(status);
    }

    fn on_writable(&self, ready: Readiness) -> Disposition {
        let status = {
            let mut io = self.io.lock();
            let Some(stream) = io.stream.as_ref() else {
                return Disposition::Remove;
            };
            let status = if ready.writable {
                self.write_frames(stream)
            } else {
                WriteStatus::Failed
            };
            if status != WriteStatus::Pending {
                io.write_watch = None;
            }
            status
        };
        if status == WriteStatus::Pending {
            Disposition::Continue
        } else {
            self.finish_write(status);
            Disposition::Remove
        }
    }

    fn finish_write(&self, status: WriteStatus) {
        match status {
            WriteStatus::Finished => {
                debug!(sender = %self.name, "done");
                self.shutdown(true);
            }
            WriteStatus::Failed => self.shutdown(false),
            WriteStatus::Pending | WriteStatus::Idle => {}
        }
    }

    /// Writes frames until the socket is full or there is nothing left.
    /// The state lock is never held across the write call itself.
    fn write_frames(&self, stream: &UnixStream) -> WriteStatus {
        loop {
            let frame = {
                let mut state = self.state.lock();
                if state.frame.as_ref().is_some_and(Frame::is_complete) {
                    state.advance();
                    continue;
                }
                match &state.frame {
                    Some(frame) => frame.clone(),
                    None if state.done => return WriteStatus::Finished,
                    None => return WriteStatus::Idle,
                }
            };
            let chunk = frame.remaining();
            match send_nosignal(stream, chunk) {
                Ok(written) => {
                    let mut state = self.state.lock();
                    if let Some(current) = state.frame.as_mut() {
                        current.written += written;
                        if current.is_complete() {
                            trace!(sender = %self.name, size = current.size(), "frame written");
                            state.advance();
                        }
                    }
                    if written < chunk.len() {
                        return WriteStatus::Pending;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return WriteStatus::Pending,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(sender = %self.name, error = %err, "write failed");
                    return WriteStatus::Failed;
                }
            }
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        if let Some(watch) = self.io.get_mut().write_watch.take() {
            self.event_loop.remove_watch(watch);
        }
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("name", &self.name)
            .field("backlog", &self.backlog())
            .field("queued", &self.queue_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
