//! Frame codec: engine messages to protobuf bytes and back. No I/O.

use crate::error::DecodeError;
use crate::message::{
    BoundingBox, ConfigurationResponse, Frame, FrameResult, GeoRegistration, Identifier, Image,
    Inference, LatticePoint, Request, Response, ResultPayload, Shape,
};
use model_proto::{self as proto, Classification, FrameType, ImageFormat, Polygon, UnitCoordinate};
use prost::Message;
use std::time::Duration;

pub fn encode_request(request: Request) -> Vec<u8> {
    proto::Request::from(request).encode_to_vec()
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, DecodeError> {
    proto::Request::decode(bytes)?.try_into()
}

pub fn encode_response(response: Response) -> Vec<u8> {
    proto::Response::from(response).encode_to_vec()
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, DecodeError> {
    proto::Response::decode(bytes)?.try_into()
}

/// Whole milliseconds, rounded up so a deadline never shrinks on the wire.
fn deadline_to_millis(deadline: Duration) -> u64 {
    let millis = deadline.as_millis() + u128::from(deadline.subsec_nanos() % 1_000_000 != 0);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

fn required<T>(
    value: Option<T>,
    message: &'static str,
    field: &'static str,
) -> Result<T, DecodeError> {
    value.ok_or(DecodeError::MissingField { message, field })
}

fn unit_interval(field: &'static str, value: f64) -> Result<f64, DecodeError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(DecodeError::OutOfRange { field, value })
    }
}

fn unit_coordinate(coordinate: UnitCoordinate) -> Result<UnitCoordinate, DecodeError> {
    check_unit_coordinate(&coordinate)?;
    Ok(coordinate)
}

fn check_unit_coordinate(coordinate: &UnitCoordinate) -> Result<(), DecodeError> {
    unit_interval("UnitCoordinate.row", coordinate.row)?;
    unit_interval("UnitCoordinate.col", coordinate.col)?;
    Ok(())
}

impl From<Identifier> for proto::Identifier {
    fn from(identifier: Identifier) -> Self {
        proto::Identifier {
            stream_id: identifier.stream_id,
            frame_id: identifier.frame_id,
        }
    }
}

impl From<proto::Identifier> for Identifier {
    fn from(identifier: proto::Identifier) -> Self {
        Identifier {
            stream_id: identifier.stream_id,
            frame_id: identifier.frame_id,
        }
    }
}

impl From<Request> for proto::Request {
    fn from(request: Request) -> Self {
        let request = match request {
            Request::Configuration(configuration) => {
                proto::request::Request::Configuration(configuration)
            }
            Request::Frame { frame, deadline } => proto::request::Request::Frame(proto::Frame {
                identifier: Some(frame.identifier.into()),
                deadline_ms: deadline_to_millis(deadline),
                image: Some(frame.image.into()),
                metadata: frame.metadata,
            }),
        };
        proto::Request {
            request: Some(request),
        }
    }
}

impl TryFrom<proto::Request> for Request {
    type Error = DecodeError;

    fn try_from(request: proto::Request) -> Result<Self, Self::Error> {
        match request.request {
            Some(proto::request::Request::Configuration(configuration)) => {
                Ok(Request::Configuration(configuration))
            }
            Some(proto::request::Request::Frame(frame)) => Ok(Request::Frame {
                deadline: Duration::from_millis(frame.deadline_ms),
                frame: frame.try_into()?,
            }),
            None => Err(DecodeError::MissingVariant { message: "Request" }),
        }
    }
}

impl From<Response> for proto::Response {
    fn from(response: Response) -> Self {
        let response = match response {
            Response::Configuration(configuration) => {
                proto::response::Response::Configuration(configuration.into())
            }
            Response::Result(result) => proto::response::Response::Result(result.into()),
        };
        proto::Response {
            response: Some(response),
        }
    }
}

impl TryFrom<proto::Response> for Response {
    type Error = DecodeError;

    fn try_from(response: proto::Response) -> Result<Self, Self::Error> {
        match response.response {
            Some(proto::response::Response::Configuration(configuration)) => {
                Ok(Response::Configuration(configuration.try_into()?))
            }
            Some(proto::response::Response::Result(result)) => {
                Ok(Response::Result(result.try_into()?))
            }
            None => Err(DecodeError::MissingVariant { message: "Response" }),
        }
    }
}

impl From<ConfigurationResponse> for proto::ConfigurationResponse {
    fn from(configuration: ConfigurationResponse) -> Self {
        proto::ConfigurationResponse {
            provider_name: configuration.provider_name,
            provider_version: configuration.provider_version,
            frame_type: configuration.frame_type.into(),
        }
    }
}

impl TryFrom<proto::ConfigurationResponse> for ConfigurationResponse {
    type Error = DecodeError;

    fn try_from(configuration: proto::ConfigurationResponse) -> Result<Self, Self::Error> {
        let frame_type = match FrameType::try_from(configuration.frame_type) {
            Ok(FrameType::Unspecified) | Err(_) => {
                return Err(DecodeError::UnknownEnumValue {
                    field: "ConfigurationResponse.frame_type",
                    value: configuration.frame_type,
                })
            }
            Ok(frame_type) => frame_type,
        };
        Ok(ConfigurationResponse {
            provider_name: configuration.provider_name,
            provider_version: configuration.provider_version,
            frame_type,
        })
    }
}

impl From<Image> for proto::Image {
    fn from(image: Image) -> Self {
        let image = match image {
            Image::Raw(raw) => proto::image::Image::Raw(raw),
            Image::Encoded(encoded) => proto::image::Image::Encoded(encoded),
        };
        proto::Image { image: Some(image) }
    }
}

impl TryFrom<proto::Image> for Image {
    type Error = DecodeError;

    fn try_from(image: proto::Image) -> Result<Self, Self::Error> {
        match image.image {
            Some(proto::image::Image::Raw(raw)) => Ok(Image::Raw(raw)),
            Some(proto::image::Image::Encoded(encoded)) => {
                if ImageFormat::try_from(encoded.format).is_err() {
                    return Err(DecodeError::UnknownEnumValue {
                        field: "EncodedImage.format",
                        value: encoded.format,
                    });
                }
                Ok(Image::Encoded(encoded))
            }
            None => Err(DecodeError::MissingVariant { message: "Image" }),
        }
    }
}

impl TryFrom<proto::Frame> for Frame {
    type Error = DecodeError;

    fn try_from(frame: proto::Frame) -> Result<Self, Self::Error> {
        Ok(Frame {
            identifier: required(frame.identifier, "Frame", "identifier")?.into(),
            image: required(frame.image, "Frame", "image")?.try_into()?,
            metadata: frame.metadata,
        })
    }
}

impl From<FrameResult> for proto::Result {
    fn from(result: FrameResult) -> Self {
        let payload = match result.payload {
            ResultPayload::GeoRegistration(registration) => {
                proto::result::Result::GeoRegistration(registration.into())
            }
            ResultPayload::Inferences(inferences) => {
                proto::result::Result::Inferences(proto::Inferences {
                    inferences: inferences.into_iter().map(Into::into).collect(),
                })
            }
        };
        proto::Result {
            identifier: Some(result.identifier.into()),
            result: Some(payload),
        }
    }
}

impl TryFrom<proto::Result> for FrameResult {
    type Error = DecodeError;

    fn try_from(result: proto::Result) -> Result<Self, Self::Error> {
        let identifier = required(result.identifier, "Result", "identifier")?.into();
        let payload = match result.result {
            Some(proto::result::Result::GeoRegistration(registration)) => {
                ResultPayload::GeoRegistration(registration.try_into()?)
            }
            Some(proto::result::Result::Inferences(inferences)) => ResultPayload::Inferences(
                inferences
                    .inferences
                    .into_iter()
                    .map(Inference::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            None => return Err(DecodeError::MissingVariant { message: "Result" }),
        };
        Ok(FrameResult {
            identifier,
            payload,
        })
    }
}

impl From<GeoRegistration> for proto::GeoRegistration {
    fn from(registration: GeoRegistration) -> Self {
        proto::GeoRegistration {
            lattice: registration
                .lattice
                .into_iter()
                .map(|point| proto::LatticePoint {
                    image_coordinate: Some(point.image_coordinate),
                    latitude: point.latitude,
                    longitude: point.longitude,
                    elevation: point.elevation,
                })
                .collect(),
            confidence: registration.confidence,
            updated_metadata: registration.updated_metadata,
        }
    }
}

impl TryFrom<proto::GeoRegistration> for GeoRegistration {
    type Error = DecodeError;

    fn try_from(registration: proto::GeoRegistration) -> Result<Self, Self::Error> {
        let lattice = registration
            .lattice
            .into_iter()
            .map(|point| -> Result<LatticePoint, DecodeError> {
                let coordinate =
                    required(point.image_coordinate, "LatticePoint", "image_coordinate")?;
                Ok(LatticePoint {
                    image_coordinate: unit_coordinate(coordinate)?,
                    latitude: point.latitude,
                    longitude: point.longitude,
                    elevation: point.elevation,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(GeoRegistration {
            lattice,
            confidence: unit_interval("GeoRegistration.confidence", registration.confidence)?,
            updated_metadata: registration.updated_metadata,
        })
    }
}

impl From<Inference> for proto::Inference {
    fn from(inference: Inference) -> Self {
        let shape = match inference.shape {
            Shape::BoundingBox(bounding_box) => {
                proto::inference::Shape::BoundingBox(proto::BoundingBox {
                    c0: Some(bounding_box.c0),
                    c1: Some(bounding_box.c1),
                })
            }
            Shape::Polygon(polygon) => proto::inference::Shape::Polygon(polygon),
        };
        proto::Inference {
            inference_id: inference.inference_id,
            classifications: inference.classifications,
            shape: Some(shape),
        }
    }
}

impl TryFrom<proto::Inference> for Inference {
    type Error = DecodeError;

    fn try_from(inference: proto::Inference) -> Result<Self, Self::Error> {
        let shape = match inference.shape {
            Some(proto::inference::Shape::BoundingBox(bounding_box)) => {
                let c0 = unit_coordinate(required(bounding_box.c0, "BoundingBox", "c0")?)?;
                let c1 = unit_coordinate(required(bounding_box.c1, "BoundingBox", "c1")?)?;
                if c0.row > c1.row || c0.col > c1.col {
                    return Err(DecodeError::InvertedBoundingBox);
                }
                Shape::BoundingBox(BoundingBox { c0, c1 })
            }
            Some(proto::inference::Shape::Polygon(polygon)) => {
                for vertex in &polygon.vertices {
                    check_unit_coordinate(vertex)?;
                }
                Shape::Polygon(Polygon {
                    vertices: polygon.vertices,
                })
            }
            None => return Err(DecodeError::MissingVariant { message: "Inference" }),
        };
        let classifications = inference
            .classifications
            .into_iter()
            .map(|classification: Classification| {
                unit_interval("Classification.confidence", classification.confidence)
                    .map(|_| classification)
            })
            .collect::<Result<_, _>>()?;
        Ok(Inference {
            inference_id: inference.inference_id,
            shape,
            classifications,
        })
    }
}
