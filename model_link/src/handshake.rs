use crate::error::LinkError;
use crate::message::{ConfigurationRequest, ConfigurationResponse, Request, Response};
use crate::transport::{RequestSink, ResponseSource};
use tokio::time::{timeout, Duration};
use tracing::instrument;

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeState {
    AwaitingConfigResponse,
    Ready(ConfigurationResponse),
}

impl HandshakeState {
    pub fn configuration(&self) -> Option<&ConfigurationResponse> {
        match self {
            HandshakeState::Ready(configuration) => Some(configuration),
            HandshakeState::AwaitingConfigResponse => None,
        }
    }
}

/// Drives the one-time configuration exchange at the start of a connection.
#[derive(Debug, Clone)]
pub struct Negotiator {
    request: ConfigurationRequest,
    timeout: Duration,
}

impl Negotiator {
    pub fn new(request: ConfigurationRequest, timeout: Duration) -> Self {
        Self { request, timeout }
    }

    /// Sends the configuration request and waits for exactly one response.
    ///
    /// Anything other than a configuration response as the first inbound
    /// message is a protocol violation.
    #[instrument(skip(self, sink, source), fields(timeout = ?self.timeout))]
    pub async fn negotiate(
        &self,
        sink: &mut dyn RequestSink,
        source: &mut dyn ResponseSource,
    ) -> Result<ConfigurationResponse, LinkError> {
        tracing::debug!(
            "Sending configuration request as {} {}",
            self.request.orchestrator_name,
            self.request.orchestrator_version
        );
        sink.send_request(Request::Configuration(self.request.clone()))
            .await?;

        let response = timeout(self.timeout, source.next_response())
            .await
            .map_err(|_| {
                LinkError::Connection(format!(
                    "no configuration response within {:?}",
                    self.timeout
                ))
            })??;

        match response {
            Response::Configuration(configuration) => {
                tracing::info!(
                    "Negotiated with {} {} (frame type {})",
                    configuration.provider_name,
                    configuration.provider_version,
                    configuration.frame_type.as_str_name()
                );
                Ok(configuration)
            }
            Response::Result(result) => Err(LinkError::ProtocolViolation(format!(
                "result for ({}, {}) arrived before the configuration response",
                result.identifier.stream_id, result.identifier.frame_id
            ))),
        }
    }
}
