//! Observability sink consumed by the registry, scheduler and orchestrator.
//!
//! Sinks only observe. Scheduling never depends on whether a sink is
//! installed or what it does with an event.

use crate::call_key::ChainId;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Engine events worth keeping outside of the cache itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum SchedulerEvent {
    PassStart {
        chain_id: ChainId,
        block: u64,
        due: usize,
    },
    PassEnd {
        chain_id: ChainId,
        block: u64,
        duration_ms: u64,
        batches: usize,
        succeeded: usize,
        failed: usize,
        failed_batches: usize,
    },
    /// A whole batch failed in transport. Its keys stay due.
    BatchFailure {
        chain_id: ChainId,
        block: u64,
        calls: usize,
        error: String,
    },
    /// A subscription handle was released more than once.
    DoubleRelease { handle_id: u64, key: String },
    /// A block height that did not advance the chain was dropped.
    TickIgnored {
        chain_id: ChainId,
        height: u64,
        latest: u64,
    },
}

pub trait ObservabilitySink: Send + Sync {
    fn record(&self, event: SchedulerEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ObservabilitySink for NoopSink {
    fn record(&self, _event: SchedulerEvent) {}
}

/// Forwards events to `tracing` at debug level. Failures are already
/// warned about where they happen.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn record(&self, event: SchedulerEvent) {
        debug!(?event, "[Observability] engine event");
    }
}

/// Keeps every event in memory. Useful for tests and for embedding callers
/// that poll engine health.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SchedulerEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, pred: impl Fn(&SchedulerEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl ObservabilitySink for RecordingSink {
    fn record(&self, event: SchedulerEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Fans one event out to several sinks.
#[derive(Default, Clone)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ObservabilitySink for SinkSet {
    fn record(&self, event: SchedulerEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}

/// Counts WARN events emitted while installed as the default subscriber.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct WarnCounter(Arc<std::sync::atomic::AtomicUsize>);

#[cfg(test)]
impl WarnCounter {
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::layer::SubscriberExt;
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub(crate) fn count(&self) -> usize {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.record(SchedulerEvent::TickIgnored {
            chain_id: 1,
            height: 5,
            latest: 6,
        });
        sink.record(SchedulerEvent::DoubleRelease {
            handle_id: 3,
            key: "k".into(),
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SchedulerEvent::TickIgnored { height: 5, .. }));
        assert_eq!(
            sink.count(|e| matches!(e, SchedulerEvent::DoubleRelease { .. })),
            1
        );
    }

    #[test]
    fn sink_set_fans_out() {
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        let set = SinkSet::new().with(a.clone()).with(b.clone());
        set.record(SchedulerEvent::PassStart {
            chain_id: 1,
            block: 10,
            due: 2,
        });
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(SchedulerEvent::BatchFailure {
            chain_id: 1,
            block: 95,
            calls: 2,
            error: "timeout".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "BatchFailure");
        assert_eq!(json["block"], 95);
    }

    #[test]
    fn tracing_sink_never_warns() {
        let warnings = WarnCounter::default();
        let _guard = warnings.install();
        TracingSink.record(SchedulerEvent::BatchFailure {
            chain_id: 1,
            block: 95,
            calls: 2,
            error: "timeout".into(),
        });
        TracingSink.record(SchedulerEvent::DoubleRelease {
            handle_id: 1,
            key: "k".into(),
        });
        assert_eq!(warnings.count(), 0);
    }
}
