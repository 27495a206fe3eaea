//! Adapters feeding the `log` and `tracing` ecosystems into a [`Core`].
//!
//! The record target becomes the category name, so categories registered
//! under a module path or an explicit `target:` can be enabled and leveled
//! individually. Events emitted by this crate are never fed back.

use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;

use crate::core::Core;
use crate::protocol::Level;

const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

fn is_own_target(target: &str) -> bool {
    target
        .strip_prefix(OWN_TARGET)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

/// Maps `log` levels onto stream levels.
pub fn map_log_level(level: log::Level) -> Level {
    match level {
        log::Level::Error => Level::Error,
        log::Level::Warn => Level::Warning,
        log::Level::Info => Level::Info,
        log::Level::Debug => Level::Debug,
        log::Level::Trace => Level::Verbose,
    }
}

/// Maps `tracing` levels onto stream levels.
pub fn map_tracing_level(level: &tracing::Level) -> Level {
    match *level {
        tracing::Level::ERROR => Level::Error,
        tracing::Level::WARN => Level::Warning,
        tracing::Level::INFO => Level::Info,
        tracing::Level::DEBUG => Level::Debug,
        tracing::Level::TRACE => Level::Verbose,
    }
}

/// A [`log::Log`] implementation that logs into a [`Core`].
///
/// # Examples
///
/// ```no_run
/// use logstream::{Config, Core, EventLoop};
/// use logstream::bridge::LogBridge;
///
/// let event_loop = EventLoop::new().unwrap();
/// let core = Core::new(&event_loop, &Config::from_env());
/// LogBridge::new(core).install(log::LevelFilter::Trace).unwrap();
/// log::info!(target: "net", "link up");
/// ```
#[derive(Debug, Clone)]
pub struct LogBridge {
    core: Core,
}

impl LogBridge {
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    /// Installs the bridge as the global `log` logger.
    pub fn install(self, max_level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
        log::set_logger(Box::leak(Box::new(self)))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl log::Log for LogBridge {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        !is_own_target(metadata.target())
            && self
                .core
                .should_log(map_log_level(metadata.level()), Some(metadata.target()))
                .0
    }

    fn log(&self, record: &log::Record<'_>) {
        if is_own_target(record.target()) {
            return;
        }
        self.core
            .log_fmt(map_log_level(record.level()), Some(record.target()), *record.args());
    }

    fn flush(&self) {}
}

/// Collects the `message` field and appends the other fields as
/// `name=value`.
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        // The tracing macros pre-format `message` as fmt::Arguments, whose
        // Debug output has no quotes
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl MessageVisitor {
    fn into_text(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

/// A `tracing_subscriber` layer that logs events into a [`Core`].
#[derive(Debug, Clone)]
pub struct CoreLayer {
    core: Core,
}

impl CoreLayer {
    pub fn new(core: Core) -> Self {
        Self { core }
    }
}

impl<S> tracing_subscriber::Layer<S> for CoreLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if is_own_target(target) {
            return;
        }
        let level = map_tracing_level(metadata.level());
        if !self.core.should_log(level, Some(target)).0 {
            return;
        }
        let mut visitor = MessageVisitor {
            message: String::new(),
            fields: Vec::new(),
        };
        event.record(&mut visitor);
        self.core.log(level, Some(target), &visitor.into_text());
    }
}
