//! Inbound flow: match each result to its outstanding frame and decide
//! whether the Orchestrator gets to use it.

use crate::dispatcher::sweep_expired;
use crate::error::LinkError;
use crate::event::{EventSender, LinkEvent};
use crate::message::{FrameResult, Response};
use crate::outstanding::{OutstandingTable, Resolution};
use crate::telemetry::LinkMetrics;
use crate::transport::ResponseSource;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub struct ResultCorrelator {
    source: Box<dyn ResponseSource>,
    table: Arc<OutstandingTable>,
    events: EventSender,
    metrics: Arc<LinkMetrics>,
}

impl ResultCorrelator {
    pub fn new(
        source: Box<dyn ResponseSource>,
        table: Arc<OutstandingTable>,
        events: EventSender,
        metrics: Arc<LinkMetrics>,
    ) -> Self {
        Self {
            source,
            table,
            events,
            metrics,
        }
    }

    /// Pulls results until the connection fails or shutdown is signalled.
    ///
    /// Returns the error that ended the connection, or `None` on shutdown.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Option<LinkError> {
        loop {
            let response = tokio::select! {
                response = self.source.next_response() => response,
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Result correlator received shutdown signal");
                    return None;
                }
            };

            match response {
                Ok(Response::Result(result)) => {
                    if !self.correlate(result).await {
                        return None;
                    }
                }
                Ok(Response::Configuration(configuration)) => {
                    return Some(LinkError::ProtocolViolation(format!(
                        "unexpected configuration response from {} after the handshake",
                        configuration.provider_name
                    )));
                }
                Err(e) => return Some(e),
            }
        }
    }

    /// Classifies one result and emits it. Returns `false` once nobody is
    /// listening for events any more.
    async fn correlate(&mut self, result: FrameResult) -> bool {
        let now = Instant::now();
        let identifier = result.identifier;

        // Resolve before sweeping so a late result is reported as late rather
        // than as an expiry followed by an unmatched result.
        let event = match self.table.resolve(&identifier, now) {
            Resolution::OnTime { latency } => {
                self.metrics.record_accepted(latency.as_millis() as u64);
                tracing::debug!(
                    "Accepted result for ({}, {}) after {:?}",
                    identifier.stream_id,
                    identifier.frame_id,
                    latency
                );
                LinkEvent::Accepted { result, latency }
            }
            Resolution::Late { overdue } => {
                self.metrics.record_late();
                tracing::warn!(
                    "Discarding result for ({}, {}), {:?} past its deadline",
                    identifier.stream_id,
                    identifier.frame_id,
                    overdue
                );
                LinkEvent::LateDiscarded { result, overdue }
            }
            Resolution::Unmatched => {
                self.metrics.record_unmatched();
                tracing::warn!(
                    "Discarding result for ({}, {}), no outstanding frame",
                    identifier.stream_id,
                    identifier.frame_id
                );
                LinkEvent::UnmatchedDiscarded(result)
            }
        };

        if self.events.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped, stopping result correlation");
            return false;
        }

        sweep_expired(&self.table, &self.events, &self.metrics, now).await;
        true
    }
}
