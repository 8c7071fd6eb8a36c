// Flight Recorder - captures engine events for post-mortem analysis
// Format: JSON Lines (one event per line)
// Recording never blocks the engine: a full queue drops the event and counts it.

use crate::metrics;
use crate::observability::{ObservabilitySink, SchedulerEvent};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One line of the recording.
#[derive(Debug, Clone, Serialize)]
pub struct FlightRecord {
    /// RFC 3339 wall-clock time the event was recorded at.
    pub ts: String,
    #[serde(flatten)]
    pub event: SchedulerEvent,
}

#[derive(Debug)]
pub struct FlightRecorder {
    enabled: AtomicBool,
    event_tx: mpsc::Sender<FlightRecord>,
    event_count: AtomicU64,
    dropped_events: AtomicU64,
}

impl FlightRecorder {
    /// Creates an enabled recorder with a queue of `capacity` events.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FlightRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                enabled: AtomicBool::new(true),
                event_tx: tx,
                event_count: AtomicU64::new(0),
                dropped_events: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
        info!("[FlightRecorder] enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        info!("[FlightRecorder] disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// (enabled, recorded, dropped)
    pub fn stats(&self) -> (bool, u64, u64) {
        (
            self.is_enabled(),
            self.event_count.load(Ordering::Relaxed),
            self.dropped_events.load(Ordering::Relaxed),
        )
    }
}

impl ObservabilitySink for FlightRecorder {
    fn record(&self, event: SchedulerEvent) {
        if !self.is_enabled() {
            return;
        }
        let record = FlightRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
        };
        match self.event_tx.try_send(record) {
            Ok(()) => {
                self.event_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                metrics::increment_flight_recorder_dropped();
            }
        }
    }
}

/// Drains `event_rx` into `output_file` until every sender is gone.
/// Returns the number of events written.
pub async fn flight_recorder_writer(
    mut event_rx: mpsc::Receiver<FlightRecord>,
    output_file: PathBuf,
) -> std::io::Result<u64> {
    if let Some(parent) = Path::new(&output_file).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file = File::create(&output_file).await?;
    let mut writer = BufWriter::new(file);
    info!("[FlightRecorder] writing to {}", output_file.display());

    let mut count = 0u64;
    while let Some(record) = event_rx.recv().await {
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                warn!("[FlightRecorder] could not serialize event: {}", e);
                continue;
            }
        };
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        count += 1;

        if count % 10 == 0 {
            writer.flush().await?;
        }
    }

    writer.flush().await?;
    info!("[FlightRecorder] saved {} events to {}", count, output_file.display());
    Ok(count)
}
