//! Length-prefixed framing over a duplex byte stream.
//!
//! Each message is a 4-byte big-endian payload length followed by the
//! payload. The framer knows nothing about what the payload contains.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on a single payload: 10 MiB.
pub const DEFAULT_MAX_MESSAGE_BYTES: u32 = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message length {declared} exceeds maximum {max}")]
    TooLarge { declared: u64, max: u32 },
}

fn map_read_error(err: io::Error) -> FramingError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => FramingError::ConnectionClosed,
        _ => FramingError::Io(err),
    }
}

pub struct FrameReader<R> {
    inner: R,
    max_message_bytes: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_message_bytes: u32) -> Self {
        Self {
            inner,
            max_message_bytes,
        }
    }

    /// Waits for one complete message and returns its payload.
    ///
    /// The declared length is checked before any buffer is allocated for it.
    pub async fn read_message(&mut self) -> Result<Bytes, FramingError> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.inner
            .read_exact(&mut prefix)
            .await
            .map_err(map_read_error)?;

        let declared = u32::from_be_bytes(prefix);
        if declared > self.max_message_bytes {
            return Err(FramingError::TooLarge {
                declared: u64::from(declared),
                max: self.max_message_bytes,
            });
        }

        let mut payload = BytesMut::zeroed(declared as usize);
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(map_read_error)?;

        Ok(payload.freeze())
    }
}

pub struct FrameWriter<W> {
    inner: W,
    max_message_bytes: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_message_bytes: u32) -> Self {
        Self {
            inner,
            max_message_bytes,
        }
    }

    pub async fn write_message(&mut self, payload: &[u8]) -> Result<(), FramingError> {
        if payload.len() > self.max_message_bytes as usize {
            return Err(FramingError::TooLarge {
                declared: payload.len() as u64,
                max: self.max_message_bytes,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);

        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Closes the outbound direction; the peer sees end-of-stream.
    pub async fn shutdown(&mut self) -> Result<(), FramingError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Splits a duplex stream into independently usable framed halves.
pub fn split<S>(
    stream: S,
    max_message_bytes: u32,
) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (
        FrameReader::new(read, max_message_bytes),
        FrameWriter::new(write, max_message_bytes),
    )
}
