use crate::error::LinkError;
use crate::message::{FrameResult, Identifier};
use std::time::Duration;
use tokio::sync::mpsc;

/// What the Orchestrator hears back from a session.
///
/// Only `Accepted` carries a result meant to be applied. The discarded and
/// expired outcomes are expected consequences of deadlines and of the
/// ModelServer's freedom to skip, reorder or restate, never errors.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Accepted {
        result: FrameResult,
        latency: Duration,
    },
    LateDiscarded {
        result: FrameResult,
        overdue: Duration,
    },
    UnmatchedDiscarded(FrameResult),
    Expired(Identifier),
    /// Always the last event of a session.
    Closed(Option<LinkError>),
}

pub type EventSender = mpsc::Sender<LinkEvent>;
pub type EventReceiver = mpsc::Receiver<LinkEvent>;
