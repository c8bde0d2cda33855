// growerd: In-memory log capture
//
// A tracing layer appends every log record to a bounded ring buffer and
// fans it out to connected streaming clients. The HTTP surface serves the
// ring; slow stream consumers fall behind the broadcast channel and are
// dropped without ever blocking producers.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Per-client queue depth for the live stream.
const STREAM_QUEUE: usize = 256;

/// One captured log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub formatted: String,
}

struct Inner {
    capacity: usize,
    ring: Mutex<VecDeque<LogRecord>>,
    stream: broadcast::Sender<LogRecord>,
}

/// Shared handle onto the bounded log ring.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Inner>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(STREAM_QUEUE);
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                ring: Mutex::new(VecDeque::new()),
                stream,
            }),
        }
    }

    pub fn push(&self, record: LogRecord) {
        {
            let mut ring = self.inner.ring.lock();
            if ring.len() == self.inner.capacity {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }
        // No receivers is fine; send only fails then.
        let _ = self.inner.stream.send(record);
    }

    /// Last `count` records, optionally filtered by level name.
    pub fn last(&self, count: usize, level: Option<&str>) -> Vec<LogRecord> {
        let ring = self.inner.ring.lock();
        let level = level.map(str::to_uppercase);
        let filtered: Vec<&LogRecord> = ring
            .iter()
            .filter(|rec| level.as_deref().map_or(true, |l| rec.level == l))
            .collect();
        filtered
            .into_iter()
            .rev()
            .take(count)
            .rev()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.ring.lock().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.inner.stream.subscribe()
    }
}

/// tracing layer feeding the ring buffer.
pub struct RingBufferLayer {
    buffer: LogBuffer,
}

impl RingBufferLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for RingBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let level = meta.level().to_string();
        let target = meta.target().to_string();
        let message = visitor.into_message();
        let formatted = format!("{timestamp} {level:>5} {target}: {message}");

        self.buffer.push(LogRecord {
            timestamp,
            level,
            target,
            message,
            formatted,
        });
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: String,
}

impl FieldCollector {
    fn into_message(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
