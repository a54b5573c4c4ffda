//! Cancellable frame sink plus the helper tasks around a streaming scan
//!
//! A sink owns the sending half of a bounded frame channel. Once the client
//! side closes, or [`SseSink::cancel`] is called, every further send fails with
//! [`ProviderError::Cancelled`] and nothing more is emitted.

use super::sse::{ExceptionInfo, LastScannedObjectInfo, SseEvent, SseEventType};
use crate::error::{ProviderError, Result};
use crate::event::EventTreeNode;
use crate::message::Message;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

pub struct SseSink {
    tx: mpsc::Sender<SseEvent>,
    cancel: watch::Sender<bool>,
    frame_counter: AtomicU64,
    scan_counter: AtomicU64,
    last_scanned: Mutex<LastScannedObjectInfo>,
}

impl SseSink {
    /// Create a sink and the frame stream to hand to the transport
    #[must_use]
    pub fn channel(buffer: usize) -> (Arc<Self>, mpsc::Receiver<SseEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (cancel, _) = watch::channel(false);
        let sink = Arc::new(Self {
            tx,
            cancel,
            frame_counter: AtomicU64::new(0),
            scan_counter: AtomicU64::new(0),
            last_scanned: Mutex::new(LastScannedObjectInfo::default()),
        });
        (sink, rx)
    }

    /// Raise the cancellation signal
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the sink is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // the sender lives in `self`, so this only returns once cancelled
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Transport-side liveness: the client dropped the frame stream
    #[must_use]
    pub fn is_client_closed(&self) -> bool {
        self.tx.is_closed()
    }

    #[must_use]
    pub fn last_scanned(&self) -> LastScannedObjectInfo {
        self.last_scanned.lock().clone()
    }

    /// Record scan progress that did not produce a result
    pub fn note_scanned_timestamp(&self, timestamp: DateTime<Utc>) {
        self.last_scanned.lock().timestamp = timestamp.timestamp_millis();
    }

    pub async fn send_event(&self, node: &EventTreeNode) -> Result<()> {
        self.note_scanned(node.id.to_string(), node.start_timestamp);
        self.send_data(SseEventType::Event, node, true).await
    }

    pub async fn send_message(&self, message: &Message) -> Result<()> {
        self.note_scanned(message.message_id.to_string(), message.timestamp);
        self.send_data(SseEventType::Message, message, true).await
    }

    pub async fn send_keep_alive(&self) -> Result<()> {
        let info = self.last_scanned();
        self.send_data(SseEventType::KeepAlive, &info, true).await
    }

    /// Recap of the last identifier scanned per stream
    pub async fn send_message_ids(&self, ids: &BTreeMap<String, Option<String>>) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Recap<'a> {
            message_ids: &'a BTreeMap<String, Option<String>>,
        }
        self.send_data(SseEventType::MessageIds, &Recap { message_ids: ids }, false)
            .await
    }

    pub async fn send_error(&self, err: &ProviderError) -> Result<()> {
        self.send_data(SseEventType::Error, &ExceptionInfo::from(err), false)
            .await
    }

    pub async fn send_close(&self) -> Result<()> {
        self.send_frame(SseEvent {
            event: SseEventType::Close,
            data: "empty data".into(),
            id: None,
        })
        .await
    }

    fn note_scanned(&self, id: String, timestamp: DateTime<Utc>) {
        let counter = self.scan_counter.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_scanned.lock() = LastScannedObjectInfo {
            id,
            timestamp: timestamp.timestamp_millis(),
            scan_counter: counter,
        };
    }

    async fn send_data<T: Serialize>(
        &self,
        event: SseEventType,
        payload: &T,
        numbered: bool,
    ) -> Result<()> {
        let data = serde_json::to_string(payload)
            .map_err(|err| ProviderError::Task(format!("unable to serialize {event} frame: {err}")))?;
        let id = numbered.then(|| self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1);
        self.send_frame(SseEvent { event, data, id }).await
    }

    async fn send_frame(&self, frame: SseEvent) -> Result<()> {
        if self.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        tokio::select! {
            biased;
            () = self.cancelled() => Err(ProviderError::Cancelled),
            sent = self.tx.send(frame) => sent.map_err(|_| {
                self.cancel();
                ProviderError::Cancelled
            }),
        }
    }
}

/// Timing knobs of one streaming request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// How often the client connection is checked
    pub liveness_interval: Duration,
    pub keep_alive_interval: Duration,
    /// `None` lets the scan run until it finishes on its own
    pub max_duration: Option<Duration>,
}

/// How a streaming request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// Maximum duration reached; closed normally
    Expired,
    Cancelled,
    /// Scan failed; an error frame with this status was sent
    Failed(u16),
}

/// Drive `scan` with liveness watching and keep-alives, then close the stream.
///
/// The helper tasks are stopped and awaited before the terminal frame is sent.
pub async fn run_sse<Fut>(sink: Arc<SseSink>, settings: StreamSettings, scan: Fut) -> StreamOutcome
where
    Fut: Future<Output = Result<()>>,
{
    let started = Instant::now();
    let (done_tx, done_rx) = watch::channel(false);
    let helpers = vec![
        spawn_liveness_watcher(Arc::clone(&sink), settings.liveness_interval, done_rx.clone()),
        spawn_keep_alive(Arc::clone(&sink), settings.keep_alive_interval, done_rx),
    ];

    let bounded_scan = async {
        match settings.max_duration {
            Some(limit) => time::timeout(limit, scan).await.ok(),
            None => Some(scan.await),
        }
    };
    let result = tokio::select! {
        biased;
        () = sink.cancelled() => Some(Err(ProviderError::Cancelled)),
        result = bounded_scan => result,
    };

    let _ = done_tx.send(true);
    join_all(helpers).await;

    let elapsed_ms = started.elapsed().as_millis();
    match result {
        Some(Ok(())) => {
            let _ = sink.send_close().await;
            debug!(elapsed_ms, "Streaming search completed");
            StreamOutcome::Completed
        }
        None => {
            let _ = sink.send_close().await;
            info!(elapsed_ms, "Streaming search reached its maximum duration");
            StreamOutcome::Expired
        }
        Some(Err(ProviderError::Cancelled)) => {
            info!(elapsed_ms, "Streaming search cancelled by client");
            StreamOutcome::Cancelled
        }
        Some(Err(err)) => {
            error!(elapsed_ms, error = %err, "Streaming search failed");
            let _ = sink.send_error(&err).await;
            let _ = sink.send_close().await;
            StreamOutcome::Failed(err.status_code())
        }
    }
}

fn ticker(period: Duration) -> time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn spawn_liveness_watcher(
    sink: Arc<SseSink>,
    interval: Duration,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        loop {
            tokio::select! {
                _ = done.changed() => break,
                _ = ticker.tick() => {
                    if sink.is_client_closed() {
                        info!("Client connection closed, cancelling search");
                        sink.cancel();
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_keep_alive(
    sink: Arc<SseSink>,
    interval: Duration,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        loop {
            tokio::select! {
                _ = done.changed() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = done.changed() => break,
                        sent = sink.send_keep_alive() => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    })
}
