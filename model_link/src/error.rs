use crate::framer::FramingError;
use crate::message::Identifier;
use thiserror::Error;

/// Why a payload could not be turned into a message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] prost::DecodeError),
    #[error("{message} carries no variant")]
    MissingVariant { message: &'static str },
    #[error("{message} is missing required field `{field}`")]
    MissingField {
        message: &'static str,
        field: &'static str,
    },
    #[error("{field} has unknown enum value {value}")]
    UnknownEnumValue { field: &'static str, value: i32 },
    #[error("{field} = {value} is outside [0, 1]")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("Bounding box corners are not ordered upper-left to lower-right")]
    InvertedBoundingBox,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(
        "Identifier ({}, {}) is still outstanding",
        .0.stream_id,
        .0.frame_id
    )]
    DuplicateIdentifier(Identifier),
    #[error("Connection error: {0}")]
    Connection(String),
}

impl LinkError {
    /// Whether the session can keep running after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LinkError::DuplicateIdentifier(_))
    }
}

impl From<FramingError> for LinkError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::TooLarge { .. } => LinkError::ProtocolViolation(err.to_string()),
            FramingError::Io(_) | FramingError::ConnectionClosed => {
                LinkError::Connection(err.to_string())
            }
        }
    }
}

impl From<tonic::Status> for LinkError {
    fn from(status: tonic::Status) -> Self {
        LinkError::Connection(format!("gRPC status {}: {}", status.code(), status.message()))
    }
}

impl From<tonic::transport::Error> for LinkError {
    fn from(err: tonic::transport::Error) -> Self {
        LinkError::Connection(format!("Failed to connect to gRPC server: {}", err))
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::identifier;

    #[test]
    fn test_only_a_duplicate_identifier_is_recoverable() {
        let errors = [
            LinkError::Decode(DecodeError::InvertedBoundingBox),
            LinkError::ProtocolViolation("early result".to_string()),
            LinkError::DuplicateIdentifier(identifier(1, 1)),
            LinkError::Connection("reset".to_string()),
        ];
        for error in errors {
            let recoverable = match &error {
                LinkError::DuplicateIdentifier(_) => true,
                LinkError::Decode(_) | LinkError::ProtocolViolation(_) | LinkError::Connection(_) => {
                    false
                }
            };
            assert_eq!(error.is_fatal(), !recoverable, "{}", error);
        }
    }

    #[test]
    fn test_oversized_frame_is_a_protocol_violation() {
        let error = LinkError::from(FramingError::TooLarge {
            declared: 11,
            max: 10,
        });
        assert!(matches!(error, LinkError::ProtocolViolation(_)));
        assert!(matches!(
            LinkError::from(FramingError::ConnectionClosed),
            LinkError::Connection(_)
        ));
    }
}
