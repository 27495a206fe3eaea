//! # logstream
//!
//! A log distribution engine: log calls tagged with a category and a level
//! are filtered against per-category and global policy, and accepted
//! messages are streamed to any number of subscribers over non-blocking
//! sockets in a compact binary format.
//!
//! ## Key Features
//!
//! * Length-prefixed binary protocol built for partial reads and writes
//! * Per-subscriber bounded backlog; a slow subscriber only loses its own
//!   oldest messages and sees the loss as an index gap
//! * Category registry with enable flags and level overrides
//! * Producers never block on I/O; one event loop thread does all writes
//! * Bridges for the `log` and `tracing` ecosystems
//!
//! ## Main Components
//!
//! * `Core`: category registry, filtering and fan-out to senders
//! * `Sender`: outbound queue and write state machine of one subscriber
//! * `Receiver`: incremental parser for the subscriber side
//! * `EventLoop`: poll-based reactor owning every transport watch
//! * `Server`: per-peer streams and access checks for a control plane
//! * `protocol`: the wire format
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//! use logstream::{CategoryFlags, Config, Core, EventLoop, Level, Receiver};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let core = Core::new(&event_loop, &Config::default());
//! core.new_category("net", Level::Undefined, CategoryFlags::ENABLED);
//!
//! // Subscribe
//! let sender = core.new_sender("viewer").unwrap();
//! let receiver = Receiver::new(&event_loop, sender.take_peer().unwrap()).unwrap();
//! let texts = Arc::new(Mutex::new(Vec::new()));
//! let sink = texts.clone();
//! receiver.add_message_handler(move |msg| sink.lock().unwrap().push(msg.text().to_string()));
//!
//! // Log from any thread, deliver on the loop
//! core.log(Level::Info, Some("net"), "link up");
//! core.log(Level::Debug, Some("net"), "filtered out");
//! event_loop.run_until(|| texts.lock().unwrap().len() == 1, Duration::from_secs(5));
//! assert_eq!(texts.lock().unwrap()[0], "link up");
//! ```

pub mod bridge;
pub mod category;
pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod event_loop;
mod handlers;
pub mod message;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod transport;

pub use crate::category::{Category, CategoryFlags};
pub use crate::config::Config;
pub use crate::core::Core;
pub use crate::error::{Error, Result};
pub use crate::event_loop::{Disposition, EventLoop, Interest, Readiness, WatchId};
pub use crate::handlers::HandlerId;
pub use crate::message::Message;
pub use crate::protocol::Level;
pub use crate::receiver::Receiver;
pub use crate::sender::{Backlog, Sender, DEFAULT_BACKLOG};
pub use crate::server::{AccessPolicy, Action, AllowAll, LogStream, NameWatcher, Server};
