//! A small poll(2) reactor that owns every transport watch.
//!
//! Producer threads never touch a socket directly. They hand work to the
//! loop with [`EventLoop::invoke`], and the thread that drives the loop
//! ([`EventLoop::iterate`], [`EventLoop::run`]) performs all reads and
//! writes. Only one thread should drive a given loop at a time.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::transport::send_nosignal;

/// Longest single poll inside [`EventLoop::run_until`].
const RUN_UNTIL_SLICE: Duration = Duration::from_millis(100);

/// Identifies a descriptor watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// The condition a watch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// What poll reported for a watched descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    fn from_revents(revents: libc::c_short) -> Self {
        Self {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            hangup: revents & libc::POLLHUP != 0,
            error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        }
    }
}

/// Returned by a watch callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep watching.
    Continue,
    /// Drop the watch.
    Remove,
}

type WatchCallback = Box<dyn FnMut(Readiness) -> Disposition + Send>;
type Task = Box<dyn FnOnce() + Send>;

struct Watch {
    fd: RawFd,
    interest: Interest,
    // None while the callback is running
    callback: Option<WatchCallback>,
}

struct Shared {
    watches: Mutex<HashMap<WatchId, Watch>>,
    tasks: Mutex<VecDeque<Task>>,
    next_watch: AtomicU64,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
    quit: AtomicBool,
}

/// Handle to an event loop. Clones share the same loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(Self {
            shared: Arc::new(Shared {
                watches: Mutex::new(HashMap::new()),
                tasks: Mutex::new(VecDeque::new()),
                next_watch: AtomicU64::new(1),
                wake_rx,
                wake_tx,
                quit: AtomicBool::new(false),
            }),
        })
    }

    /// Watches `fd` until the callback returns [`Disposition::Remove`] or
    /// the watch is removed.
    ///
    /// The descriptor must stay open for the lifetime of the watch. Hangup
    /// and error conditions are delivered to the callback regardless of
    /// `interest`.
    pub fn add_watch<F>(&self, fd: RawFd, interest: Interest, callback: F) -> WatchId
    where
        F: FnMut(Readiness) -> Disposition + Send + 'static,
    {
        let id = WatchId(self.shared.next_watch.fetch_add(1, Ordering::Relaxed));
        self.shared.watches.lock().insert(
            id,
            Watch {
                fd,
                interest,
                callback: Some(Box::new(callback)),
            },
        );
        trace!(fd, ?interest, "watch added");
        self.wake();
        id
    }

    /// Removes a watch. Safe to call from inside any callback, including
    /// the watch's own. Returns false if the watch was already gone.
    pub fn remove_watch(&self, id: WatchId) -> bool {
        let removed = self.shared.watches.lock().remove(&id);
        // The callback may own objects whose drop re-enters the loop
        removed.is_some()
    }

    /// Queues `task` to run on the loop thread and wakes the loop.
    pub fn invoke<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.tasks.lock().push_back(Box::new(task));
        self.wake();
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.shared.watches.lock().len()
    }

    fn wake(&self) {
        match send_nosignal(&self.shared.wake_tx, &[1]) {
            Ok(_) => {}
            // Already has a pending wakeup
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!(error = %err, "failed to wake event loop"),
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        let mut rx = &self.shared.wake_rx;
        loop {
            match rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    fn run_tasks(&self) -> usize {
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    /// Runs one loop iteration: pending tasks, one poll, the callbacks of
    /// ready watches, then tasks queued meanwhile.
    ///
    /// # Arguments
    ///
    /// * `timeout` - How long poll may block; `None` blocks until something
    ///   happens. Pending tasks make the poll non-blocking.
    ///
    /// # Returns
    ///
    /// Whether any task or callback ran.
    pub fn iterate(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut dispatched = self.run_tasks() > 0;

        let mut ids = Vec::new();
        let mut fds = vec![libc::pollfd {
            fd: self.shared.wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        {
            let watches = self.shared.watches.lock();
            for (id, watch) in watches.iter() {
                if watch.callback.is_none() {
                    continue;
                }
                ids.push(*id);
                fds.push(libc::pollfd {
                    fd: watch.fd,
                    events: match watch.interest {
                        Interest::Readable => libc::POLLIN,
                        Interest::Writable => libc::POLLOUT,
                    },
                    revents: 0,
                });
            }
        }

        let timeout_ms: libc::c_int = if dispatched || !self.shared.tasks.lock().is_empty() {
            0
        } else {
            match timeout {
                None => -1,
                Some(timeout) => {
                    let ms = timeout.as_nanos().div_ceil(1_000_000);
                    ms.min(libc::c_int::MAX as u128) as libc::c_int
                }
            }
        };

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(dispatched);
            }
            return Err(err);
        }

        if fds[0].revents != 0 {
            self.drain_wake();
        }

        for (id, pollfd) in ids.iter().zip(&fds[1..]) {
            if pollfd.revents == 0 {
                continue;
            }
            let callback = match self.shared.watches.lock().get_mut(id) {
                Some(watch) => watch.callback.take(),
                None => None,
            };
            let Some(mut callback) = callback else {
                continue;
            };
            dispatched = true;
            let disposition = callback(Readiness::from_revents(pollfd.revents));

            let mut leftover = None;
            let mut removed = None;
            {
                let mut watches = self.shared.watches.lock();
                match (watches.get_mut(id), disposition) {
                    (Some(watch), Disposition::Continue) => watch.callback = Some(callback),
                    (Some(_), Disposition::Remove) => {
                        removed = watches.remove(id);
                        leftover = Some(callback);
                    }
                    (None, _) => leftover = Some(callback),
                }
            }
            drop(removed);
            drop(leftover);
        }

        if self.run_tasks() > 0 {
            dispatched = true;
        }
        Ok(dispatched)
    }

    /// Iterates until `done` returns true or `timeout` elapses.
    ///
    /// # Returns
    ///
    /// The final value of `done`.
    pub fn run_until<F>(&self, mut done: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(RUN_UNTIL_SLICE);
            if let Err(err) = self.iterate(Some(slice)) {
                warn!(error = %err, "event loop iteration failed");
                return done();
            }
        }
    }

    /// Runs pending work without blocking until nothing is left to do.
    pub fn run_pending(&self) {
        loop {
            match self.iterate(Some(Duration::ZERO)) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => {
                    warn!(error = %err, "event loop iteration failed");
                    break;
                }
            }
        }
    }

    /// Iterates until [`quit`](Self::quit) is called.
    pub fn run(&self) -> io::Result<()> {
        while !self.shared.quit.swap(false, Ordering::AcqRel) {
            self.iterate(None)?;
        }
        Ok(())
    }

    /// Makes [`run`](Self::run) return after the current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.wake();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("watches", &self.watch_count())
            .field("tasks", &self.shared.tasks.lock().len())
            .finish()
    }
}
