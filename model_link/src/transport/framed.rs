use super::{RequestSink, ResponseSource, Transport};
use crate::codec::{decode_response, encode_request};
use crate::error::LinkError;
use crate::framer::{self, FrameReader, FrameWriter};
use crate::message::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tonic::async_trait;

/// Protobuf messages behind a 4-byte length prefix on a raw byte stream.
///
/// The Orchestrator is the active side and connects out to a listening
/// ModelServer.
pub struct FramedTransport<S> {
    stream: S,
    max_message_bytes: u32,
}

impl FramedTransport<TcpStream> {
    pub async fn connect(addr: &str, max_message_bytes: u32) -> Result<Self, LinkError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::info!("Connected to ModelServer at {}", addr);
        Ok(Self::new(stream, max_message_bytes))
    }
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, max_message_bytes: u32) -> Self {
        Self {
            stream,
            max_message_bytes,
        }
    }
}

impl<S> Transport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    const NAME: &'static str = "framed";

    type Sink = FramedSink<WriteHalf<S>>;
    type Source = FramedSource<ReadHalf<S>>;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (reader, writer) = framer::split(self.stream, self.max_message_bytes);
        (
            FramedSink {
                writer,
                closed: false,
            },
            FramedSource { reader },
        )
    }
}

pub struct FramedSink<W> {
    writer: FrameWriter<W>,
    closed: bool,
}

#[async_trait]
impl<W> RequestSink for FramedSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send_request(&mut self, request: Request) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Connection("outbound stream closed".to_string()));
        }
        let payload = encode_request(request);
        self.writer.write_message(&payload).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("Error while closing framed stream: {}", e);
        }
    }
}

pub struct FramedSource<R> {
    reader: FrameReader<R>,
}

#[async_trait]
impl<R> ResponseSource for FramedSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn next_response(&mut self) -> Result<Response, LinkError> {
        let payload = self.reader.read_message().await?;
        Ok(decode_response(&payload)?)
    }
}
