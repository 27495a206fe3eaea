//! Peer bookkeeping for a control-plane front end.
//!
//! The RPC binding itself lives elsewhere. It calls into [`Server`] with the
//! identity of the calling peer; the server checks the [`AccessPolicy`],
//! keeps one log stream per peer and forwards category changes to the
//! [`Core`].

use std::collections::HashMap;
use std::fmt;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::category::{Category, CategoryFlags};
use crate::core::Core;
use crate::error::{Error, Result};
use crate::handlers::{HandlerId, HandlerList};
use crate::protocol::Level;
use crate::sender::Sender;

/// Operations subject to the access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SetDefaultLevel,
    SetCategoryLevel,
    SetBacklog,
    EnableCategory,
    DisableCategory,
    LogOpen,
    LogClose,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::SetDefaultLevel => "set the default level",
            Action::SetCategoryLevel => "set a category level",
            Action::SetBacklog => "set the backlog",
            Action::EnableCategory => "enable categories",
            Action::DisableCategory => "disable categories",
            Action::LogOpen => "open a log stream",
            Action::LogClose => "close a log stream",
        }
    }

    fn for_enable(enable: bool) -> Self {
        if enable {
            Action::EnableCategory
        } else {
            Action::DisableCategory
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether a peer may perform an action.
pub trait AccessPolicy: Send + Sync {
    fn allow(&self, peer: &str, action: Action) -> bool;
}

/// Policy that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allow(&self, _peer: &str, _action: Action) -> bool {
        true
    }
}

/// Tells the server when a peer disappears from the bus.
///
/// `watch_name` starts watching and returns an id for `unwatch_name`. The
/// implementation calls [`Server::peer_vanished`] when the peer goes away.
pub trait NameWatcher: Send + Sync {
    fn watch_name(&self, name: &str) -> u64;
    fn unwatch_name(&self, id: u64);
}

/// A stream handed to a peer.
#[derive(Debug)]
pub struct LogStream {
    /// The subscriber's end of the socket pair.
    pub stream: UnixStream,
    /// Identifies the stream in [`Server::close`].
    pub cookie: u32,
}

struct Peer {
    sender: Arc<Sender>,
    cookie: u32,
    watch: Option<u64>,
    closed_id: HandlerId,
}

type NameHandler = dyn Fn(&str) + Send + Sync;
type LevelHandler = dyn Fn(&str, Level) + Send + Sync;

struct ServerInner {
    core: Core,
    watcher: Option<Arc<dyn NameWatcher>>,
    policy: Arc<dyn AccessPolicy>,
    peers: Mutex<HashMap<String, Peer>>,
    next_cookie: AtomicU32,
    core_handlers: Mutex<Vec<HandlerId>>,
    enabled_handlers: HandlerList<NameHandler>,
    disabled_handlers: HandlerList<NameHandler>,
    level_handlers: HandlerList<LevelHandler>,
}

impl ServerInner {
    /// Ends a peer's stream with a BYE.
    fn release(&self, peer: Peer) {
        if let (Some(watcher), Some(watch)) = (&self.watcher, peer.watch) {
            watcher.unwatch_name(watch);
        }
        peer.sender.remove_handler(peer.closed_id);
        peer.sender.close(true);
    }

    fn flags_changed(&self, category: &Arc<Category>, mask: CategoryFlags) {
        if !mask.contains(CategoryFlags::ENABLED) {
            return;
        }
        let handlers = if category.is_enabled() {
            &self.enabled_handlers
        } else {
            &self.disabled_handlers
        };
        for handler in handlers.snapshot() {
            handler(category.name());
        }
    }

    fn level_changed(&self, category: &Arc<Category>) {
        let level = category.level();
        for handler in self.level_handlers.snapshot() {
            handler(category.name(), level);
        }
    }

    /// Forgets a peer whose transport closed.
    fn stream_closed(&self, name: &str, cookie: u32) {
        let peer = {
            let mut peers = self.peers.lock();
            match peers.get(name) {
                Some(peer) if peer.cookie == cookie => peers.remove(name),
                _ => None,
            }
        };
        if let Some(peer) = peer {
            debug!(peer = %name, "log stream closed by transport");
            if let (Some(watcher), Some(watch)) = (&self.watcher, peer.watch) {
                watcher.unwatch_name(watch);
            }
            peer.sender.remove_handler(peer.closed_id);
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let ids = std::mem::take(&mut *self.core_handlers.get_mut());
        self.core.remove_handlers(&ids);
        let peers: Vec<Peer> = self.peers.get_mut().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            self.release(peer);
        }
    }
}

/// Per-peer log streams on top of a [`Core`].
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(core: &Core, watcher: Option<Arc<dyn NameWatcher>>, policy: Arc<dyn AccessPolicy>) -> Self {
        let inner = Arc::new(ServerInner {
            core: core.clone(),
            watcher,
            policy,
            peers: Mutex::new(HashMap::new()),
            next_cookie: AtomicU32::new(1),
            core_handlers: Mutex::new(Vec::new()),
            enabled_handlers: HandlerList::new(),
            disabled_handlers: HandlerList::new(),
            level_handlers: HandlerList::new(),
        });

        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        let flags_id = core.add_category_flags_handler(move |category, mask| {
            if let Some(inner) = weak.upgrade() {
                inner.flags_changed(category, mask);
            }
        });
        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        let level_id = core.add_category_level_handler(move |category| {
            if let Some(inner) = weak.upgrade() {
                inner.level_changed(category);
            }
        });
        inner.core_handlers.lock().extend([flags_id, level_id]);
        Self { inner }
    }

    pub fn core(&self) -> &Core {
        &self.inner.core
    }

    /// Opens a log stream for `peer`, replacing any stream it already had.
    pub fn open(&self, peer: &str) -> Result<LogStream> {
        let sender = self.inner.core.new_sender(peer)?;
        let Some(stream) = sender.take_peer() else {
            self.inner.core.remove_sender(&sender);
            return Err(Error::from(std::io::Error::from(std::io::ErrorKind::NotConnected)));
        };
        let cookie = self.inner.next_cookie.fetch_add(1, Ordering::Relaxed);
        let watch = self.inner.watcher.as_ref().map(|w| w.watch_name(peer));

        let weak = Arc::downgrade(&self.inner);
        let name = peer.to_string();
        let closed_id = sender.add_closed_handler(move || {
            if let Some(inner) = weak.upgrade() {
                inner.stream_closed(&name, cookie);
            }
        });

        let previous = self.inner.peers.lock().insert(
            peer.to_string(),
            Peer {
                sender,
                cookie,
                watch,
                closed_id,
            },
        );
        if let Some(previous) = previous {
            debug!(peer = %peer, "replacing log stream");
            self.inner.release(previous);
        }
        debug!(peer = %peer, cookie, "log stream opened");
        Ok(LogStream { stream, cookie })
    }

    /// Closes the peer's stream after everything queued has been sent.
    ///
    /// # Returns
    ///
    /// False if the peer has no stream or `cookie` doesn't match it.
    pub fn close(&self, peer: &str, cookie: u32) -> bool {
        let removed = {
            let mut peers = self.inner.peers.lock();
            match peers.get(peer) {
                Some(entry) if entry.cookie == cookie => peers.remove(peer),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                debug!(peer = %peer, cookie, "log stream closed");
                self.inner.release(entry);
                true
            }
            None => false,
        }
    }

    /// Called by the [`NameWatcher`] when a peer goes away.
    pub fn peer_vanished(&self, peer: &str) {
        let removed = self.inner.peers.lock().remove(peer);
        if let Some(entry) = removed {
            debug!(peer = %peer, "peer vanished");
            self.inner.release(entry);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    pub fn has_peer(&self, peer: &str) -> bool {
        self.inner.peers.lock().contains_key(peer)
    }

    pub fn set_names_enabled<I, S>(&self, names: I, enable: bool)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.inner.core.set_category_enabled(name.as_ref(), enable);
        }
    }

    pub fn set_pattern_enabled(&self, pattern: &str, enable: bool) {
        for category in self.inner.core.find_categories(Some(pattern)) {
            self.inner.core.set_category_enabled(category.name(), enable);
        }
    }

    // Access-checked entry points

    fn check(&self, peer: &str, action: Action) -> Result<()> {
        if self.inner.policy.allow(peer, action) {
            Ok(())
        } else {
            debug!(peer = %peer, %action, "access denied");
            Err(Error::AccessDenied {
                peer: peer.to_string(),
                action: action.as_str(),
            })
        }
    }

    pub fn call_set_default_level(&self, peer: &str, level: Level) -> Result<bool> {
        self.check(peer, Action::SetDefaultLevel)?;
        Ok(self.inner.core.set_default_level(level))
    }

    pub fn call_set_category_level(&self, peer: &str, name: &str, level: Level) -> Result<()> {
        self.check(peer, Action::SetCategoryLevel)?;
        self.inner.core.set_category_level(name, level);
        Ok(())
    }

    pub fn call_set_backlog(&self, peer: &str, backlog: i64) -> Result<()> {
        self.check(peer, Action::SetBacklog)?;
        self.inner.core.set_backlog(backlog);
        Ok(())
    }

    pub fn call_set_names_enabled(&self, peer: &str, names: &[&str], enable: bool) -> Result<()> {
        self.check(peer, Action::for_enable(enable))?;
        self.set_names_enabled(names.iter().copied(), enable);
        Ok(())
    }

    pub fn call_set_pattern_enabled(&self, peer: &str, pattern: &str, enable: bool) -> Result<()> {
        self.check(peer, Action::for_enable(enable))?;
        self.set_pattern_enabled(pattern, enable);
        Ok(())
    }

    pub fn call_log_open(&self, peer: &str) -> Result<LogStream> {
        self.check(peer, Action::LogOpen)?;
        self.open(peer)
    }

    pub fn call_log_close(&self, peer: &str, cookie: u32) -> Result<bool> {
        self.check(peer, Action::LogClose)?;
        Ok(self.close(peer, cookie))
    }

    // Events

    pub fn add_category_enabled_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.enabled_handlers.add(Arc::new(handler))
    }

    pub fn add_category_disabled_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.disabled_handlers.add(Arc::new(handler))
    }

    pub fn add_category_level_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str, Level) + Send + Sync + 'static,
    {
        self.inner.level_handlers.add(Arc::new(handler))
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.enabled_handlers.remove(id)
            || self.inner.disabled_handlers.remove(id)
            || self.inner.level_handlers.remove(id)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("peers", &self.peer_count()).finish()
    }
}
