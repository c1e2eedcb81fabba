//! ModelServer end of the framed transport.
//!
//! Listens for Orchestrator connections, answers the configuration request,
//! then hands every frame to a [`ModelService`] on its own task so results
//! go back in whatever order inference finishes.

use crate::codec::{decode_request, encode_response};
use crate::error::LinkError;
use crate::framer::{self, FrameReader, FrameWriter, FramingError};
use crate::message::{
    ConfigurationRequest, ConfigurationResponse, Frame, FrameResult, Request, Response,
    ResultPayload,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;
use tonic::async_trait;

const RESPONSE_BUFFER: usize = 64;

#[async_trait]
pub trait ModelService: Send + Sync + 'static {
    fn configuration(&self, request: &ConfigurationRequest) -> ConfigurationResponse;

    /// `None` skips the frame; the Orchestrator reclaims it on expiry.
    async fn infer(&self, frame: Frame, deadline: Duration) -> Option<ResultPayload>;
}

pub struct FramedModelServer<M: ModelService> {
    listener: TcpListener,
    service: Arc<M>,
    max_message_bytes: u32,
}

impl<M: ModelService> FramedModelServer<M> {
    pub async fn bind(addr: &str, service: M, max_message_bytes: u32) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            service: Arc::new(service),
            max_message_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until shutdown is signalled. Each connection runs
    /// on its own task and fails independently of the others.
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), LinkError> {
        tracing::info!(
            "ModelServer listening on {}",
            self.listener.local_addr()?
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    tracing::info!("Orchestrator connected from {}", peer);

                    let service = self.service.clone();
                    let max_message_bytes = self.max_message_bytes;
                    tokio::spawn(async move {
                        match serve_connection(stream, service, max_message_bytes).await {
                            Ok(()) => tracing::info!("Orchestrator {} disconnected", peer),
                            Err(e) => tracing::error!("Connection from {} failed: {}", peer, e),
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("ModelServer received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Runs one Orchestrator connection to completion.
///
/// The first message must be a configuration request. Returns `Ok` when the
/// Orchestrator closes its side and every pending result has been written.
pub async fn serve_connection<S, M>(
    stream: S,
    service: Arc<M>,
    max_message_bytes: u32,
) -> Result<(), LinkError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    M: ModelService,
{
    let (mut reader, writer) = framer::split(stream, max_message_bytes);
    let (responses, pending) = mpsc::channel(RESPONSE_BUFFER);
    let writer_task = tokio::spawn(write_responses(writer, pending));

    let outcome = read_requests(&mut reader, service, responses).await;
    let written = writer_task
        .await
        .map_err(|e| LinkError::Connection(format!("response writer stopped: {}", e)))?;

    outcome.and(written)
}

async fn read_requests<S, M>(
    reader: &mut FrameReader<ReadHalf<S>>,
    service: Arc<M>,
    responses: mpsc::Sender<Response>,
) -> Result<(), LinkError>
where
    S: AsyncRead + Send + 'static,
    M: ModelService,
{
    let first = reader.read_message().await?;
    let request = match decode_request(&first)? {
        Request::Configuration(request) => request,
        Request::Frame { frame, .. } => {
            return Err(LinkError::ProtocolViolation(format!(
                "frame ({}, {}) arrived before the configuration request",
                frame.identifier.stream_id, frame.identifier.frame_id
            )));
        }
    };
    tracing::info!(
        "Configuration request from {} {}",
        request.orchestrator_name,
        request.orchestrator_version
    );
    responses
        .send(Response::Configuration(service.configuration(&request)))
        .await
        .map_err(|_| LinkError::Connection("response writer stopped".to_string()))?;

    loop {
        let payload = match reader.read_message().await {
            Ok(payload) => payload,
            Err(FramingError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let (frame, deadline) = match decode_request(&payload)? {
            Request::Frame { frame, deadline } => (frame, deadline),
            Request::Configuration(_) => {
                return Err(LinkError::ProtocolViolation(
                    "configuration request repeated after the handshake".to_string(),
                ));
            }
        };

        let identifier = frame.identifier;
        tracing::debug!(
            "Received frame ({}, {}) with deadline {:?}",
            identifier.stream_id,
            identifier.frame_id,
            deadline
        );

        let service = service.clone();
        let responses = responses.clone();
        tokio::spawn(async move {
            match service.infer(frame, deadline).await {
                Some(payload) => {
                    let result = FrameResult {
                        identifier,
                        payload,
                    };
                    let _ = responses.send(Response::Result(result)).await;
                }
                None => tracing::debug!(
                    "Skipping frame ({}, {})",
                    identifier.stream_id,
                    identifier.frame_id
                ),
            }
        });
    }
}

async fn write_responses<S>(
    mut writer: FrameWriter<WriteHalf<S>>,
    mut pending: mpsc::Receiver<Response>,
) -> Result<(), LinkError>
where
    S: AsyncWrite + Send + 'static,
{
    while let Some(response) = pending.recv().await {
        writer.write_message(&encode_response(response)).await?;
    }
    // The peer may already be gone; nothing is lost at this point.
    let _ = writer.shutdown().await;
    Ok(())
}
