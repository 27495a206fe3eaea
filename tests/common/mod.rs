#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use logstream::{EventLoop, Message, Receiver};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Routes the crate's diagnostics to the test output. Set RUST_LOG to see them.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(Arc<Message>),
    Skip(u32),
    Closed,
}

/// Records everything a receiver reports, in order.
#[derive(Clone, Default)]
pub struct Collector {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Collector {
    pub fn attach(receiver: &Receiver) -> Self {
        let collector = Collector::default();
        let events = collector.events.clone();
        receiver.add_message_handler(move |msg| events.lock().push(Event::Message(msg.clone())));
        let events = collector.events.clone();
        receiver.add_skip_handler(move |count| events.lock().push(Event::Skip(count)));
        let events = collector.events.clone();
        receiver.add_closed_handler(move || events.lock().push(Event::Closed));
        collector
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Message(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn indices(&self) -> Vec<u32> {
        self.messages().iter().map(|msg| msg.index()).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages().iter().map(|msg| msg.text().to_string()).collect()
    }

    pub fn message_count(&self) -> usize {
        self.messages().len()
    }

    pub fn skipped(&self) -> u32 {
        self.events
            .lock()
            .iter()
            .map(|event| match event {
                Event::Skip(count) => *count,
                _ => 0,
            })
            .sum()
    }

    pub fn closed_count(&self) -> usize {
        self.events.lock().iter().filter(|event| **event == Event::Closed).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_count() > 0
    }

    pub fn wait_closed(&self, event_loop: &EventLoop) -> bool {
        event_loop.run_until(|| self.is_closed(), TIMEOUT)
    }

    pub fn wait_messages(&self, event_loop: &EventLoop, count: usize) -> bool {
        event_loop.run_until(|| self.message_count() >= count, TIMEOUT)
    }
}
