use super::{RequestSink, ResponseSource, Transport};
use crate::error::LinkError;
use crate::message::{Request, Response};
use futures::{stream, Stream, StreamExt};
use model_proto::{self as proto, model_server_client::ModelServerClient};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{async_trait, Status};

type ResponseStream = Pin<Box<dyn Stream<Item = Result<proto::Response, Status>> + Send>>;

/// The `ModelServer/Stream` RPC: one long-lived call carrying requests out and
/// responses back, with the RPC layer doing the framing.
pub struct CallTransport {
    outbound: mpsc::Sender<proto::Request>,
    inbound: ResponseStream,
}

impl CallTransport {
    pub async fn connect(
        endpoint: String,
        max_message_bytes: usize,
        buffer: usize,
    ) -> Result<Self, LinkError> {
        let client = ModelServerClient::connect(endpoint.clone()).await?;
        let mut client = client
            .max_decoding_message_size(max_message_bytes)
            .max_encoding_message_size(max_message_bytes);

        // A ModelServer may hold its response headers until the first request
        // arrives, so the call completes on its own task while the handshake
        // goes out through `outbound`.
        let (outbound, requests) = mpsc::channel(buffer);
        let call = tokio::spawn(async move { client.stream(ReceiverStream::new(requests)).await });
        tracing::info!("Opening model stream at {}", endpoint);

        let inbound = stream::once(async move {
            let opened: ResponseStream = match call.await {
                Ok(Ok(response)) => Box::pin(response.into_inner()),
                Ok(Err(status)) => Box::pin(stream::iter([Err(status)])),
                Err(e) => Box::pin(stream::iter([Err(Status::internal(format!(
                    "model stream task failed: {}",
                    e
                )))])),
            };
            opened
        })
        .flatten();

        Ok(Self::from_parts(outbound, inbound))
    }

    /// Builds the transport from an already established call.
    pub fn from_parts<S>(outbound: mpsc::Sender<proto::Request>, inbound: S) -> Self
    where
        S: Stream<Item = Result<proto::Response, Status>> + Send + 'static,
    {
        Self {
            outbound,
            inbound: Box::pin(inbound),
        }
    }
}

impl Transport for CallTransport {
    const NAME: &'static str = "call";

    type Sink = CallSink;
    type Source = CallSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        (
            CallSink {
                outbound: Some(self.outbound),
            },
            CallSource {
                inbound: self.inbound,
            },
        )
    }
}

pub struct CallSink {
    outbound: Option<mpsc::Sender<proto::Request>>,
}

#[async_trait]
impl RequestSink for CallSink {
    async fn send_request(&mut self, request: Request) -> Result<(), LinkError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| LinkError::Connection("request stream closed".to_string()))?;
        outbound
            .send(request.into())
            .await
            .map_err(|_| LinkError::Connection("request stream dropped by the RPC layer".to_string()))
    }

    async fn close(&mut self) {
        // Dropping the sender ends the request stream.
        self.outbound.take();
    }
}

pub struct CallSource {
    inbound: ResponseStream,
}

#[async_trait]
impl ResponseSource for CallSource {
    async fn next_response(&mut self) -> Result<Response, LinkError> {
        match self.inbound.next().await {
            Some(Ok(response)) => Ok(response.try_into()?),
            Some(Err(status)) => Err(status.into()),
            None => Err(LinkError::Connection("response stream ended".to_string())),
        }
    }
}
