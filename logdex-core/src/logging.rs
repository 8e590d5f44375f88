//! A one-directional byte channel surfacing internal log records to the
//! host, plus the `tracing_subscriber::Layer` that feeds it.
//!
//! The host only ever sees formatted lines of the form
//! `"{level} {logger} {message}\n"`; it never has to depend on `tracing`
//! itself.

use std::fmt::Write as _;

use crossbeam_channel::{Receiver, Sender};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// The host-facing read end of the log channel.
#[derive(Clone)]
pub struct LogReader {
    rx: Receiver<String>,
}

impl LogReader {
    /// Reads the next formatted log line, blocking until one is available
    /// or the Environment (and with it, the write end) is closed.
    pub fn recv(&self) -> Option<String> {
        self.rx.recv().ok()
    }

    /// Non-blocking drain of whatever is currently buffered.
    pub fn try_iter(&self) -> impl Iterator<Item = String> + '_ {
        self.rx.try_iter()
    }
}

pub(crate) fn channel() -> (LogSink, LogReader) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (LogSink { tx }, LogReader { rx })
}

#[derive(Clone)]
pub(crate) struct LogSink {
    tx: Sender<String>,
}

pub(crate) struct ChannelLayer {
    sink: LogSink,
    min_level: Level,
}

impl ChannelLayer {
    pub(crate) fn new(sink: LogSink, min_level: Level) -> Self {
        ChannelLayer { sink, min_level }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else if !self.message.is_empty() {
            let _ = write!(self.message, " {}={:?}", field.name(), value);
        } else {
            let _ = write!(self.message, "{}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for ChannelLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > self.min_level {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!("{} {} {}\n", meta.level(), meta.target(), visitor.message);
        // A full channel (no reader draining it) must never block the
        // store; drop the line rather than stall a transaction.
        let _ = self.sink.tx.try_send(line);
    }
}
