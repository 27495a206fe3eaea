use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::category::{glob_match, sort_by_name, Category, CategoryFlags};
use crate::clock::real_time_micros;
use crate::config::Config;
use crate::event_loop::EventLoop;
use crate::handlers::{HandlerId, HandlerList};
use crate::message::Message;
use crate::protocol::Level;
use crate::sender::{Backlog, Sender};

type LevelHandler = dyn Fn(Level) + Send + Sync;
type BacklogHandler = dyn Fn(Backlog) + Send + Sync;
type CategoryHandler = dyn Fn(&Arc<Category>) + Send + Sync;
type FlagsHandler = dyn Fn(&Arc<Category>, CategoryFlags) + Send + Sync;

struct Registry {
    by_name: HashMap<String, Arc<Category>>,
    last_cid: u32,
}

impl Registry {
    fn next_cid(&mut self) -> u32 {
        self.last_cid = self.last_cid.wrapping_add(1);
        if self.last_cid == 0 {
            // 0 means "no category"
            self.last_cid = 1;
        }
        self.last_cid
    }

    fn sorted(&self) -> Vec<Arc<Category>> {
        let mut categories: Vec<Arc<Category>> = self.by_name.values().cloned().collect();
        sort_by_name(&mut categories);
        categories
    }
}

#[derive(Clone)]
struct Attached {
    sender: Arc<Sender>,
    closed_id: HandlerId,
}

struct Handlers {
    default_level: HandlerList<LevelHandler>,
    backlog: HandlerList<BacklogHandler>,
    category_added: HandlerList<CategoryHandler>,
    category_removed: HandlerList<CategoryHandler>,
    category_level: HandlerList<CategoryHandler>,
    category_flags: HandlerList<FlagsHandler>,
}

impl Handlers {
    fn new() -> Self {
        Self {
            default_level: HandlerList::new(),
            backlog: HandlerList::new(),
            category_added: HandlerList::new(),
            category_removed: HandlerList::new(),
            category_level: HandlerList::new(),
            category_flags: HandlerList::new(),
        }
    }

    fn remove(&self, id: HandlerId) -> bool {
        self.default_level.remove(id)
            || self.backlog.remove(id)
            || self.category_added.remove(id)
            || self.category_removed.remove(id)
            || self.category_level.remove(id)
            || self.category_flags.remove(id)
    }

    fn emit_category(list: &HandlerList<CategoryHandler>, category: &Arc<Category>) {
        for handler in list.snapshot() {
            handler(category);
        }
    }
}

struct CoreInner {
    event_loop: EventLoop,
    registry: RwLock<Registry>,
    // Replaced as a whole on every change; log() works on a snapshot
    senders: RwLock<Arc<Vec<Attached>>>,
    default_level: AtomicU8,
    backlog: Mutex<Backlog>,
    // Also serializes fan-out so senders see increasing indices
    next_index: Mutex<u32>,
    handlers: Handlers,
}

impl Drop for CoreInner {
    fn drop(&mut self) {
        let senders = std::mem::take(&mut *self.senders.get_mut());
        for attached in senders.iter() {
            attached.sender.remove_handler(attached.closed_id);
        }
    }
}

/// The fan-out router.
///
/// Holds the category registry and the attached senders, decides for every
/// log call whether it is delivered, and stamps accepted messages with a
/// timestamp and an index before handing the same message to every sender.
///
/// `Core` is a cheap handle; clones share state. All methods may be called
/// from any thread. Observers run synchronously on the calling thread with
/// no internal lock held.
///
/// # Examples
///
/// ```
/// use logstream::{Config, Core, EventLoop, Level};
///
/// let event_loop = EventLoop::new().unwrap();
/// let core = Core::new(&event_loop, &Config::default());
/// core.new_category("net", Level::Undefined, logstream::CategoryFlags::ENABLED);
///
/// // Nobody listens yet
/// assert!(!core.log(Level::Info, Some("net"), "dropped"));
///
/// let sender = core.new_sender("viewer").unwrap();
/// assert!(core.log(Level::Info, Some("net"), "delivered"));
/// assert_eq!(sender.queue_len(), 0);
/// ```
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    pub fn new(event_loop: &EventLoop, config: &Config) -> Self {
        let default_level = if config.default_level.is_defined() {
            config.default_level
        } else {
            Level::Info
        };
        Self {
            inner: Arc::new(CoreInner {
                event_loop: event_loop.clone(),
                registry: RwLock::new(Registry {
                    by_name: HashMap::new(),
                    last_cid: 0,
                }),
                senders: RwLock::new(Arc::new(Vec::new())),
                default_level: AtomicU8::new(default_level.as_u8()),
                backlog: Mutex::new(Backlog::normalize(config.backlog)),
                next_index: Mutex::new(0),
                handlers: Handlers::new(),
            }),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    // Senders

    /// Creates a sender with the current backlog and attaches it.
    ///
    /// The sender detaches itself once its transport closes.
    pub fn new_sender(&self, name: &str) -> io::Result<Arc<Sender>> {
        let backlog = self.inner.backlog.lock();
        let sender = Sender::new(&self.inner.event_loop, name, *backlog)?;
        let core = Arc::downgrade(&self.inner);
        let weak = Arc::downgrade(&sender);
        let closed_id = sender.add_closed_handler(move || {
            if let (Some(inner), Some(sender)) = (core.upgrade(), weak.upgrade()) {
                Core { inner }.remove_sender(&sender);
            }
        });

        let mut senders = self.inner.senders.write();
        let mut list = Vec::with_capacity(senders.len() + 1);
        list.extend(senders.iter().cloned());
        list.push(Attached {
            sender: sender.clone(),
            closed_id,
        });
        let old = std::mem::replace(&mut *senders, Arc::new(list));
        drop(senders);
        drop(backlog);
        drop(old);
        debug!(sender = %name, "sender attached");
        Ok(sender)
    }

    /// Detaches a sender. Returns false if it wasn't attached, which is not
    /// an error.
    pub fn remove_sender(&self, sender: &Arc<Sender>) -> bool {
        let mut senders = self.inner.senders.write();
        let Some(position) = senders.iter().position(|a| Arc::ptr_eq(&a.sender, sender)) else {
            return false;
        };
        let mut list: Vec<Attached> = senders.as_ref().clone();
        let attached = list.remove(position);
        let old = std::mem::replace(&mut *senders, Arc::new(list));
        drop(senders);
        drop(old);
        attached.sender.remove_handler(attached.closed_id);
        debug!(sender = %sender.name(), "sender detached");
        true
    }

    pub fn sender_count(&self) -> usize {
        self.inner.senders.read().len()
    }

    pub fn senders(&self) -> Vec<Arc<Sender>> {
        self.inner.senders.read().iter().map(|a| a.sender.clone()).collect()
    }

    // Global settings

    pub fn default_level(&self) -> Level {
        Level::from_u8(self.inner.default_level.load(Ordering::Acquire)).unwrap_or(Level::Undefined)
    }

    /// Sets the global threshold. `Undefined` is rejected.
    ///
    /// # Returns
    ///
    /// False only if the level was rejected. Observers are told about
    /// actual changes.
    pub fn set_default_level(&self, level: Level) -> bool {
        if !level.is_defined() {
            return false;
        }
        let old = self.inner.default_level.swap(level.as_u8(), Ordering::AcqRel);
        if old != level.as_u8() {
            debug!(%level, "default level changed");
            for handler in self.inner.handlers.default_level.snapshot() {
                handler(level);
            }
        }
        true
    }

    pub fn backlog(&self) -> Backlog {
        *self.inner.backlog.lock()
    }

    /// Normalizes `raw` (see [`Backlog::normalize`]) and applies it to the
    /// core and every attached sender.
    pub fn set_backlog(&self, raw: i64) {
        let backlog = Backlog::normalize(raw);
        {
            let mut current = self.inner.backlog.lock();
            if *current == backlog {
                return;
            }
            *current = backlog;
            let senders = self.inner.senders.read().clone();
            for attached in senders.iter() {
                attached.sender.set_backlog(backlog);
            }
        }
        debug!(%backlog, "backlog changed");
        for handler in self.inner.handlers.backlog.snapshot() {
            handler(backlog);
        }
    }

    // Categories

    /// Returns the category called `name`, creating it if needed.
    ///
    /// `level` and `flags` only matter at creation; an existing category
    /// is returned unchanged. A category created with `ENABLED` also gets
    /// `ENABLED_BY_DEFAULT`.
    pub fn new_category(&self, name: &str, level: Level, flags: CategoryFlags) -> Arc<Category> {
        let category = {
            let mut registry = self.inner.registry.write();
            if let Some(existing) = registry.by_name.get(name) {
                return existing.clone();
            }
            let id = registry.next_cid();
            let category = Arc::new(Category::new(id, name, level, flags));
            registry.by_name.insert(name.to_string(), category.clone());
            category
        };
        debug!(category = %name, id = category.id(), "category added");
        Handlers::emit_category(&self.inner.handlers.category_added, &category);
        category
    }

    pub fn find_category(&self, name: &str) -> Option<Arc<Category>> {
        self.inner.registry.read().by_name.get(name).cloned()
    }

    /// All categories, sorted by name.
    pub fn categories(&self) -> Vec<Arc<Category>> {
        self.inner.registry.read().sorted()
    }

    /// Categories whose names match a shell-style pattern, sorted by name.
    /// `None`, `""` and `"*"` select everything.
    pub fn find_categories(&self, pattern: Option<&str>) -> Vec<Arc<Category>> {
        match pattern {
            Some(pattern) if !pattern.is_empty() && pattern != "*" => {
                let mut categories: Vec<Arc<Category>> = self
                    .inner
                    .registry
                    .read()
                    .by_name
                    .values()
                    .filter(|c| glob_match(pattern, c.name()))
                    .cloned()
                    .collect();
                sort_by_name(&mut categories);
                categories
            }
            _ => self.categories(),
        }
    }

    pub fn remove_category(&self, name: &str) -> bool {
        let removed = self.inner.registry.write().by_name.remove(name);
        match removed {
            Some(category) => {
                debug!(category = %name, "category removed");
                Handlers::emit_category(&self.inner.handlers.category_removed, &category);
                true
            }
            None => false,
        }
    }

    /// Removes every category, notifying observers in name order.
    pub fn remove_all_categories(&self) {
        let categories = {
            let mut registry = self.inner.registry.write();
            let categories = registry.sorted();
            registry.by_name.clear();
            categories
        };
        for category in &categories {
            Handlers::emit_category(&self.inner.handlers.category_removed, category);
        }
    }

    /// Enables or disables a category. Unknown names are ignored.
    pub fn set_category_enabled(&self, name: &str, enabled: bool) {
        let Some(category) = self.find_category(name) else {
            return;
        };
        let changed = category.set_enabled(enabled);
        if !changed.is_empty() {
            debug!(category = %name, enabled, "category flags changed");
            for handler in self.inner.handlers.category_flags.snapshot() {
                handler(&category, changed);
            }
        }
    }

    /// Sets a category's level override; `Undefined` removes it.
    pub fn set_category_level(&self, name: &str, level: Level) {
        let Some(category) = self.find_category(name) else {
            return;
        };
        if category.swap_level(level) != level {
            debug!(category = %name, %level, "category level changed");
            Handlers::emit_category(&self.inner.handlers.category_level, &category);
        }
    }

    // Logging

    /// Decides whether a message would be delivered.
    ///
    /// # Returns
    ///
    /// The decision and the category the name resolved to. Unknown names
    /// behave like no category at all.
    pub fn should_log(&self, level: Level, category: Option<&str>) -> (bool, Option<Arc<Category>>) {
        if self.inner.senders.read().is_empty() {
            return (false, None);
        }
        let default_level = self.default_level();
        let mut send = !default_level.is_defined() || level.passes(default_level);
        let category = category.and_then(|name| self.find_category(name));
        if let Some(category) = &category {
            if !category.is_enabled() {
                send = false;
            } else if category.level().is_defined() {
                send = level.passes(category.level());
            }
        }
        (send, category)
    }

    /// Delivers `text` to every attached sender if the filters allow it.
    ///
    /// # Returns
    ///
    /// Whether the message was sent.
    pub fn log(&self, level: Level, category: Option<&str>, text: &str) -> bool {
        let (send, category) = self.should_log(level, category);
        if send {
            self.dispatch(level, category.as_deref(), text.to_string());
        }
        send
    }

    /// Like [`log`](Self::log) but only formats when the message is sent.
    pub fn log_fmt(&self, level: Level, category: Option<&str>, args: fmt::Arguments<'_>) -> bool {
        let (send, category) = self.should_log(level, category);
        if send {
            self.dispatch(level, category.as_deref(), args.to_string());
        }
        send
    }

    fn dispatch(&self, level: Level, category: Option<&Category>, text: String) {
        let cid = category.map_or(0, Category::id);
        let mut next_index = self.inner.next_index.lock();
        let senders = self.inner.senders.read().clone();
        let index = *next_index;
        *next_index = next_index.wrapping_add(1);
        let message = Arc::new(Message::new(real_time_micros(), index, cid, level, text));
        trace!(index, category = cid, %level, senders = senders.len(), "dispatch");
        for attached in senders.iter() {
            attached.sender.send(message.clone());
        }
    }

    // Observers

    pub fn add_default_level_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(Level) + Send + Sync + 'static,
    {
        self.inner.handlers.default_level.add(Arc::new(handler))
    }

    pub fn add_backlog_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(Backlog) + Send + Sync + 'static,
    {
        self.inner.handlers.backlog.add(Arc::new(handler))
    }

    pub fn add_category_added_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Arc<Category>) + Send + Sync + 'static,
    {
        self.inner.handlers.category_added.add(Arc::new(handler))
    }

    pub fn add_category_removed_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Arc<Category>) + Send + Sync + 'static,
    {
        self.inner.handlers.category_removed.add(Arc::new(handler))
    }

    pub fn add_category_level_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Arc<Category>) + Send + Sync + 'static,
    {
        self.inner.handlers.category_level.add(Arc::new(handler))
    }

    /// The handler also gets the mask of flags that changed.
    pub fn add_category_flags_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Arc<Category>, CategoryFlags) + Send + Sync + 'static,
    {
        self.inner.handlers.category_flags.add(Arc::new(handler))
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.handlers.remove(id)
    }

    pub fn remove_handlers(&self, ids: &[HandlerId]) {
        for id in ids {
            self.inner.handlers.remove(*id);
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("default_level", &self.default_level())
            .field("backlog", &self.backlog())
            .field("categories", &self.inner.registry.read().by_name.len())
            .field("senders", &self.sender_count())
            .finish()
    }
}
