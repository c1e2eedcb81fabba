//! Engine-side view of the wire schema.
//!
//! Every oneof in the schema is a Rust enum here and every required
//! sub-message is a plain field, so an unset variant can never masquerade as
//! a default value. Leaf messages with nothing to enforce are reused from
//! `model_proto` as-is. `Identifier` is redefined here because it keys the
//! outstanding table and needs `Eq` and `Hash`.

use std::time::Duration;

pub use model_proto::{
    Classification, ConfigurationRequest, EncodedImage, FrameType, ImageFormat, Polygon,
    RawImage, UasMetadata, UnitCoordinate,
};

/// Correlates a frame with its results. Never reused within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    pub stream_id: u64,
    pub frame_id: u64,
}

/// Orchestrator to ModelServer.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Configuration(ConfigurationRequest),
    Frame { frame: Frame, deadline: Duration },
}

/// ModelServer to Orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Configuration(ConfigurationResponse),
    Result(FrameResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationResponse {
    pub provider_name: String,
    pub provider_version: String,
    /// The encoding the ModelServer prefers to receive.
    pub frame_type: FrameType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Image {
    Raw(RawImage),
    Encoded(EncodedImage),
}

/// A sensor sample ready to be sent. The deadline is attached at send time.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub identifier: Identifier,
    pub image: Image,
    pub metadata: Option<UasMetadata>,
}

impl Frame {
    pub fn new(identifier: Identifier, image: Image) -> Self {
        Self {
            identifier,
            image,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: UasMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatticePoint {
    pub image_coordinate: UnitCoordinate,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoRegistration {
    pub lattice: Vec<LatticePoint>,
    pub confidence: f64,
    pub updated_metadata: Option<UasMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub c0: UnitCoordinate,
    pub c1: UnitCoordinate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    BoundingBox(BoundingBox),
    Polygon(Polygon),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    /// Stable across frames for the same tracked object.
    pub inference_id: u64,
    pub shape: Shape,
    pub classifications: Vec<Classification>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultPayload {
    GeoRegistration(GeoRegistration),
    Inferences(Vec<Inference>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameResult {
    pub identifier: Identifier,
    pub payload: ResultPayload,
}

pub fn identifier(stream_id: u64, frame_id: u64) -> Identifier {
    Identifier {
        stream_id,
        frame_id,
    }
}
