//! Outbound flow: frames to the ModelServer, plus expiry of the ones that
//! never got an answer.

use crate::error::LinkError;
use crate::event::{EventSender, LinkEvent};
use crate::message::{Frame, Request};
use crate::outstanding::OutstandingTable;
use crate::telemetry::LinkMetrics;
use crate::transport::RequestSink;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::instrument;

pub struct FrameDispatcher {
    outbound: mpsc::Sender<Request>,
    table: Arc<OutstandingTable>,
}

impl FrameDispatcher {
    /// `outbound` feeds the writer task started by [`run_writer`].
    pub fn new(outbound: mpsc::Sender<Request>, table: Arc<OutstandingTable>) -> Self {
        Self { outbound, table }
    }

    /// Registers the frame as outstanding and queues it for the writer.
    ///
    /// A queue slot is reserved before registering, so dropping this future
    /// at any await point leaves neither a stray entry nor a partial write.
    /// Registration still precedes the write, so a fast result can never
    /// miss its entry. The call never waits for a result.
    #[instrument(
        skip(self, frame),
        fields(stream_id = frame.identifier.stream_id, frame_id = frame.identifier.frame_id)
    )]
    pub async fn dispatch(&self, frame: Frame, deadline: Duration) -> Result<(), LinkError> {
        let permit = self
            .outbound
            .reserve()
            .await
            .map_err(|_| LinkError::Connection("request writer stopped".to_string()))?;
        self.table
            .register(frame.identifier, deadline, Instant::now())?;
        permit.send(Request::Frame { frame, deadline });
        Ok(())
    }
}

/// Owns the sink once the handshake is done and writes queued requests in
/// order. Each write runs to completion; shutdown is only observed between
/// writes.
///
/// Returns the error that ended the connection, or `None` on shutdown.
pub async fn run_writer(
    mut sink: Box<dyn RequestSink>,
    mut requests: mpsc::Receiver<Request>,
    metrics: Arc<LinkMetrics>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Option<LinkError> {
    let error = loop {
        let request = tokio::select! {
            request = requests.recv() => request,
            _ = shutdown_rx.recv() => {
                tracing::debug!("Request writer received shutdown signal");
                break None;
            }
        };
        let Some(request) = request else {
            break None;
        };

        let sent = match &request {
            Request::Frame { frame, deadline } => Some((frame.identifier, *deadline)),
            Request::Configuration(_) => None,
        };
        if let Err(e) = sink.send_request(request).await {
            break Some(e);
        }
        if let Some((identifier, deadline)) = sent {
            metrics.record_frame_sent();
            tracing::debug!(
                "Sent frame ({}, {}) with deadline {:?}",
                identifier.stream_id,
                identifier.frame_id,
                deadline
            );
        }
    };

    sink.close().await;
    error
}

/// Moves every entry past its deadline out of the table and reports it.
pub async fn sweep_expired(
    table: &OutstandingTable,
    events: &EventSender,
    metrics: &LinkMetrics,
    now: Instant,
) {
    let expired = table.sweep(now);
    if expired.is_empty() {
        return;
    }
    metrics.record_expired(expired.len() as u64);
    for entry in expired {
        tracing::debug!(
            "Frame ({}, {}) expired without a result",
            entry.identifier.stream_id,
            entry.identifier.frame_id
        );
        if events.send(LinkEvent::Expired(entry.identifier)).await.is_err() {
            tracing::debug!("Event receiver dropped, discarding expiry reports");
            return;
        }
    }
}

/// Periodic counterpart of the sweep the correlator runs on each result.
pub async fn run_sweeper(
    table: Arc<OutstandingTable>,
    events: EventSender,
    metrics: Arc<LinkMetrics>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_expired(&table, &events, &metrics, Instant::now()).await;
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Expiry sweeper received shutdown signal");
                break;
            }
        }
    }
}
