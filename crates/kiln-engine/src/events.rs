//! Build events and the bounded channel that carries them to a listener.
//!
//! The scheduler never waits on a slow listener for low-priority events:
//! `Queued` and `Ready` are dropped (and counted) when the channel is full.
//! Every other kind blocks until there is room, so terminal states are never
//! lost.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Sender, TrySendError};
use serde::Serialize;

use crate::action::ActionId;

/// What happened to an action.
///
/// Serialized by variant name, e.g. `"CacheHit"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Queued,
    Ready,
    Running,
    CacheHit,
    Built,
    Failed,
    Skipped,
    Cancelled,
}

impl EventKind {
    /// Kinds that may be dropped under backpressure.
    pub fn is_low_priority(self) -> bool {
        matches!(self, Self::Queued | Self::Ready)
    }

    /// Whether the event marks the end of an action.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::CacheHit | Self::Built | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

/// One state transition of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub action_id: String,
    pub kind: EventKind,
    /// Nanoseconds since the Unix epoch, from a monotonic clock.
    pub ts_nanos: u64,
    pub detail: BTreeMap<String, String>,
}

/// Receives events on the sink thread.
pub trait EventListener: Send {
    fn on_event(&mut self, event: &Event);

    /// Called once after the last event.
    fn flush(&mut self) {}
}

/// Monotonic clock anchored at wall time, so timestamps are comparable
/// across threads and never go backwards.
#[derive(Debug, Clone, Copy)]
struct Clock {
    anchor_nanos: u64,
    start: Instant,
}

impl Clock {
    fn new() -> Self {
        let anchor = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            anchor_nanos: anchor,
            start: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        let elapsed = u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.anchor_nanos.saturating_add(elapsed)
    }
}

/// Sending half of the event pipeline. Dropping it drains the channel and
/// joins the sink thread.
pub struct EventSink {
    sender: Option<Sender<Event>>,
    worker: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
    clock: Clock,
}

impl EventSink {
    /// Start a sink thread delivering to `listener` through a channel of
    /// `capacity` events.
    pub fn spawn(capacity: usize, mut listener: Box<dyn EventListener>) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded::<Event>(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("kiln-events".to_owned())
            .spawn(move || {
                for event in receiver {
                    listener.on_event(&event);
                }
                listener.flush();
            });
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "cannot start event sink thread; events are discarded");
                None
            }
        };
        Self {
            sender: worker.as_ref().map(|_| sender),
            worker,
            dropped: Arc::new(AtomicU64::new(0)),
            clock: Clock::new(),
        }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            worker: None,
            dropped: Arc::new(AtomicU64::new(0)),
            clock: Clock::new(),
        }
    }

    /// Current timestamp on the sink's clock.
    pub fn now_nanos(&self) -> u64 {
        self.clock.now()
    }

    /// Post an event for `action`, stamped now.
    pub fn post(&self, action: &ActionId, kind: EventKind, detail: BTreeMap<String, String>) {
        self.emit(Event {
            action_id: action.to_string(),
            kind,
            ts_nanos: self.clock.now(),
            detail,
        });
    }

    /// Post an event with no detail.
    pub fn post_simple(&self, action: &ActionId, kind: EventKind) {
        self.post(action, kind, BTreeMap::new());
    }

    /// Enqueue a pre-built event.
    pub fn emit(&self, event: Event) {
        let Some(sender) = &self.sender else {
            return;
        };
        if event.kind.is_low_priority() {
            match sender.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else if sender.send(event).is_err() {
            tracing::debug!("event sink closed; event discarded");
        }
    }

    /// Low-priority events dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain the channel, wait for the listener, and return the drop count.
    pub fn close(mut self) -> u64 {
        self.shutdown();
        self.dropped()
    }

    fn shutdown(&mut self) {
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("event listener panicked");
            }
        }
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesListener<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesListener<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> EventListener for JsonLinesListener<W> {
    fn on_event(&mut self, event: &Event) {
        let written = serde_json::to_writer(&mut self.writer, event)
            .map_err(std::io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"));
        if let Err(e) = written {
            tracing::warn!(error = %e, "cannot write event");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(error = %e, "cannot flush event log");
        }
    }
}

/// Logs every event at debug level.
#[derive(Debug, Default)]
pub struct TracingListener;

impl EventListener for TracingListener {
    fn on_event(&mut self, event: &Event) {
        tracing::debug!(
            action = %event.action_id,
            kind = ?event.kind,
            ts = event.ts_nanos,
            detail = ?event.detail,
            "event"
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingListener {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventListener for CollectingListener {
    fn on_event(&mut self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Prints human progress lines to stderr.
#[derive(Debug, Default)]
pub struct ProgressListener;

impl EventListener for ProgressListener {
    fn on_event(&mut self, event: &Event) {
        match event.kind {
            EventKind::Running => eprintln!("    Building {}", event.action_id),
            EventKind::CacheHit => eprintln!("      Cached {}", event.action_id),
            EventKind::Failed => {
                let cause = event.detail.get("cause").map_or("failed", String::as_str);
                eprintln!("      Failed {} ({cause})", event.action_id);
            }
            _ => {}
        }
    }
}

/// Delivers each event to several listeners in order.
#[derive(Default)]
pub struct FanoutListener {
    listeners: Vec<Box<dyn EventListener>>,
}

impl FanoutListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Box<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl EventListener for FanoutListener {
    fn on_event(&mut self, event: &Event) {
        for listener in &mut self.listeners {
            listener.on_event(event);
        }
    }

    fn flush(&mut self) {
        for listener in &mut self.listeners {
            listener.flush();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::target::TargetId;

    fn id(name: &str) -> ActionId {
        ActionId::new(TargetId::parse(&format!("root//:{name}")).unwrap())
    }

    #[test]
    fn events_arrive_in_order_with_monotonic_timestamps() {
        let collector = CollectingListener::new();
        let sink = EventSink::spawn(16, Box::new(collector.clone()));
        for kind in [EventKind::Queued, EventKind::Ready, EventKind::Running, EventKind::Built] {
            sink.post_simple(&id("a"), kind);
        }
        assert_eq!(sink.close(), 0);

        let events = collector.events();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Queued, EventKind::Ready, EventKind::Running, EventKind::Built]
        );
        assert!(events.windows(2).all(|w| w[0].ts_nanos <= w[1].ts_nanos));
        assert_eq!(events[0].action_id, "root//:a");
    }

    /// Blocks on its first event until released.
    struct Gate {
        release: mpsc::Receiver<()>,
        seen: Arc<Mutex<Vec<EventKind>>>,
    }

    impl EventListener for Gate {
        fn on_event(&mut self, event: &Event) {
            let mut seen = self.seen.lock().unwrap();
            if seen.is_empty() {
                drop(seen);
                self.release.recv_timeout(Duration::from_secs(10)).ok();
                seen = self.seen.lock().unwrap();
            }
            seen.push(event.kind);
        }
    }

    #[test]
    fn low_priority_events_are_dropped_when_full() {
        let (release, rx) = mpsc::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = EventSink::spawn(
            2,
            Box::new(Gate {
                release: rx,
                seen: Arc::clone(&seen),
            }),
        );

        // The listener holds the first event; fill the channel behind it.
        sink.post_simple(&id("a"), EventKind::Running);
        std::thread::sleep(Duration::from_millis(50));
        sink.post_simple(&id("b"), EventKind::Queued);
        sink.post_simple(&id("c"), EventKind::Queued);
        for _ in 0..10 {
            sink.post_simple(&id("d"), EventKind::Ready);
        }
        assert_eq!(sink.dropped(), 10);

        release.send(()).unwrap();
        sink.post_simple(&id("a"), EventKind::Built);
        assert_eq!(sink.close(), 10);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&EventKind::Running));
        assert_eq!(seen.last(), Some(&EventKind::Built));
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn json_lines_are_written() {
        let buffer = Arc::new(Mutex::new(Vec::new()));

        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink = EventSink::spawn(8, Box::new(JsonLinesListener::new(Shared(Arc::clone(&buffer)))));
        let mut detail = BTreeMap::new();
        detail.insert("single_flight".to_owned(), "true".to_owned());
        sink.post(&id("x"), EventKind::CacheHit, detail);
        sink.close();

        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        let line = text.lines().next().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["action_id"], "root//:x");
        assert_eq!(value["kind"], "CacheHit");
        assert_eq!(value["detail"]["single_flight"], "true");
        assert!(value["ts_nanos"].as_u64().unwrap() > 0);
    }

    #[test]
    fn disabled_sink_accepts_events() {
        let sink = EventSink::disabled();
        sink.post_simple(&id("a"), EventKind::Built);
        assert_eq!(sink.close(), 0);
    }
}
