mod app;
mod codec;
mod correlator;
mod dispatcher;
mod error;
mod event;
mod framer;
mod handshake;
mod message;
mod outstanding;
mod server;
mod session;
mod telemetry;
mod transport;

pub mod config;

pub use app::start_app;
pub use codec::{decode_request, decode_response, encode_request, encode_response};
pub use error::{DecodeError, LinkError};
pub use event::{EventReceiver, LinkEvent};
pub use framer::{FrameReader, FrameWriter, FramingError, DEFAULT_MAX_MESSAGE_BYTES};
pub use handshake::HandshakeState;
pub use message::*;
pub use server::{serve_connection, FramedModelServer, ModelService};
pub use session::{Session, SessionSettings};
pub use transport::{
    connect_with_retry, CallTransport, ConnectPolicy, FramedTransport, RequestSink,
    ResponseSource, Transport,
};
