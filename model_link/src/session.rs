//! One live link to one ModelServer.
//!
//! A session owns the handshake state, the outstanding frame table and the
//! background tasks: request writer, result correlator and expiry sweeper.
//! Sessions share nothing with each other.

use crate::config::LinkConfig;
use crate::correlator::ResultCorrelator;
use crate::dispatcher::{run_sweeper, run_writer, FrameDispatcher};
use crate::error::LinkError;
use crate::event::{EventReceiver, EventSender, LinkEvent};
use crate::handshake::{HandshakeState, Negotiator};
use crate::message::{ConfigurationRequest, ConfigurationResponse, Frame, Request};
use crate::outstanding::{OutstandingTable, DEFAULT_LATE_WINDOW};
use crate::telemetry::LinkMetrics;
use crate::transport::{RequestSink, ResponseSource, Transport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub orchestrator_name: String,
    pub orchestrator_version: String,
    pub handshake_timeout: Duration,
    pub sweep_interval: Duration,
    pub late_window: Duration,
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            orchestrator_name: env!("CARGO_PKG_NAME").to_string(),
            orchestrator_version: env!("CARGO_PKG_VERSION").to_string(),
            handshake_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(50),
            late_window: DEFAULT_LATE_WINDOW,
            event_buffer: 256,
        }
    }
}

impl From<&LinkConfig> for SessionSettings {
    fn from(config: &LinkConfig) -> Self {
        Self {
            orchestrator_name: config.orchestrator_name.clone(),
            orchestrator_version: config.orchestrator_version.clone(),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            sweep_interval: Duration::from_millis(config.sweep_interval_ms),
            late_window: Duration::from_millis(config.late_window_ms),
            event_buffer: config.event_buffer,
        }
    }
}

struct Shared {
    state: Mutex<HandshakeState>,
    closed: AtomicBool,
    table: Arc<OutstandingTable>,
    dispatcher: FrameDispatcher,
    events: EventSender,
    metrics: Arc<LinkMetrics>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Tears the session down exactly once, whichever path gets here first.
    ///
    /// Background tasks are stopped, every outstanding frame is reported as
    /// expired, and `Closed` is emitted last. Event delivery happens on a
    /// spawned task so a caller never waits on a full event buffer.
    fn teardown(self: &Arc<Self>, error: Option<LinkError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        match &error {
            Some(e) => tracing::error!("Closing session: {}", e),
            None => tracing::info!("Closing session"),
        }

        // The writer is left to finish its current request and stop on the
        // signal; the other tasks hold nothing that needs completing.
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let flushed = self.table.drain();
        self.metrics.record_expired(flushed.len() as u64);

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            for entry in flushed {
                if shared
                    .events
                    .send(LinkEvent::Expired(entry.identifier))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = shared.events.send(LinkEvent::Closed(error)).await;
        });
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Transport halves held until the handshake hands them to the background
/// tasks.
struct Unstarted {
    sink: Box<dyn RequestSink>,
    source: Box<dyn ResponseSource>,
    requests: mpsc::Receiver<Request>,
}

pub struct Session {
    shared: Arc<Shared>,
    negotiator: Negotiator,
    unstarted: tokio::sync::Mutex<Option<Unstarted>>,
    sweep_interval: Duration,
}

impl Session {
    /// Wraps a connected transport. No traffic flows until [`Session::negotiate`].
    pub fn new<T: Transport>(transport: T, settings: SessionSettings) -> (Self, EventReceiver) {
        let (sink, source) = transport.split();
        let (events, event_rx) = mpsc::channel(settings.event_buffer.max(1));
        let (outbound, requests) = mpsc::channel(settings.event_buffer.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);
        let table = Arc::new(OutstandingTable::with_late_window(settings.late_window));
        let metrics = Arc::new(LinkMetrics::new(T::NAME));

        let shared = Arc::new(Shared {
            state: Mutex::new(HandshakeState::AwaitingConfigResponse),
            closed: AtomicBool::new(false),
            dispatcher: FrameDispatcher::new(outbound, table.clone()),
            table,
            events,
            metrics,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let negotiator = Negotiator::new(
            ConfigurationRequest {
                orchestrator_name: settings.orchestrator_name,
                orchestrator_version: settings.orchestrator_version,
            },
            settings.handshake_timeout,
        );

        let session = Self {
            shared,
            negotiator,
            unstarted: tokio::sync::Mutex::new(Some(Unstarted {
                sink: Box::new(sink),
                source: Box::new(source),
                requests,
            })),
            sweep_interval: settings.sweep_interval,
        };
        (session, event_rx)
    }

    /// Runs the configuration handshake and starts the inbound flow.
    ///
    /// Any failure here is fatal to the session.
    pub async fn negotiate(&self) -> Result<ConfigurationResponse, LinkError> {
        if self.shared.is_closed() {
            return Err(LinkError::Connection("session is closed".to_string()));
        }
        let mut unstarted = self.unstarted.lock().await;
        let Some(Unstarted {
            mut sink,
            mut source,
            requests,
        }) = unstarted.take()
        else {
            return Err(LinkError::ProtocolViolation(
                "configuration was already negotiated".to_string(),
            ));
        };

        let negotiated = self
            .negotiator
            .negotiate(sink.as_mut(), source.as_mut())
            .await;
        let configuration = match negotiated {
            Ok(configuration) => configuration,
            Err(e) => {
                self.shared.teardown(Some(e.clone()));
                sink.close().await;
                return Err(e);
            }
        };
        *self.shared.state.lock() = HandshakeState::Ready(configuration.clone());
        self.start_tasks(sink, source, requests);

        Ok(configuration)
    }

    fn start_tasks(
        &self,
        sink: Box<dyn RequestSink>,
        source: Box<dyn ResponseSource>,
        requests: mpsc::Receiver<Request>,
    ) {
        let shared = &self.shared;
        let writer_shutdown_rx = shared.shutdown_tx.subscribe();
        tokio::spawn({
            let shared = Arc::clone(shared);
            let writer = run_writer(sink, requests, shared.metrics.clone(), writer_shutdown_rx);
            async move {
                if let Some(error) = writer.await {
                    shared.teardown(Some(error));
                }
            }
        });

        let correlator = ResultCorrelator::new(
            source,
            shared.table.clone(),
            shared.events.clone(),
            shared.metrics.clone(),
        );
        let correlator_task = tokio::spawn({
            let shared = Arc::clone(shared);
            let shutdown_rx = shared.shutdown_tx.subscribe();
            async move {
                let error = correlator.run(shutdown_rx).await;
                shared.teardown(error);
            }
        });
        let sweeper_task = tokio::spawn(run_sweeper(
            shared.table.clone(),
            shared.events.clone(),
            shared.metrics.clone(),
            self.sweep_interval,
            shared.shutdown_tx.subscribe(),
        ));

        let mut tasks = shared.tasks.lock();
        tasks.push(correlator_task);
        tasks.push(sweeper_task);
        drop(tasks);

        // Lost a race with teardown: nobody else will stop these.
        if shared.is_closed() {
            let _ = shared.shutdown_tx.send(());
            for task in shared.tasks.lock().drain(..) {
                task.abort();
            }
        }
    }

    /// Sends a frame with its deadline, without waiting for a result.
    ///
    /// A frame before the handshake completes is a `ProtocolViolation` and
    /// closes the session. `DuplicateIdentifier` is returned if the
    /// identifier is still outstanding and leaves the session usable.
    pub async fn send_frame(&self, frame: Frame, deadline: Duration) -> Result<(), LinkError> {
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        if self.shared.is_closed() {
            return Err(LinkError::Connection("session is closed".to_string()));
        }
        let awaiting_configuration = matches!(
            *self.shared.state.lock(),
            HandshakeState::AwaitingConfigResponse
        );
        if awaiting_configuration {
            let error = LinkError::ProtocolViolation(
                "frames cannot be sent before the configuration handshake completes".to_string(),
            );
            self.shared.teardown(Some(error.clone()));
            return Err(error);
        }

        let result = tokio::select! {
            result = self.shared.dispatcher.dispatch(frame, deadline) => result,
            _ = shutdown_rx.recv() => Err(LinkError::Connection("session closed while sending".to_string())),
        };

        if let Err(e) = &result {
            if e.is_fatal() {
                self.shared.teardown(Some(e.clone()));
            }
        }
        result
    }

    /// The ModelServer's configuration, once negotiated.
    pub fn configuration(&self) -> Option<ConfigurationResponse> {
        self.shared.state.lock().configuration().cloned()
    }

    pub fn is_ready(&self) -> bool {
        !self.shared.is_closed() && self.configuration().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of frames sent and still waiting for a first answer.
    pub fn outstanding(&self) -> usize {
        self.shared.table.len()
    }

    /// Closes the session. Safe to call repeatedly and after a failure.
    pub fn close(&self) {
        self.shared.teardown(None);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if tokio::runtime::Handle::try_current().is_ok() {
            self.shared.teardown(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        identifier, FrameResult, FrameType, Image, RawImage, Request, Response, ResultPayload,
    };
    use crate::transport::CallTransport;
    use model_proto as proto;
    use tokio::time::sleep;
    use tokio_stream::wrappers::ReceiverStream;
    use tonic::Status;

    struct ModelServerEnd {
        requests: mpsc::Receiver<proto::Request>,
        responses: mpsc::Sender<Result<proto::Response, Status>>,
    }

    impl ModelServerEnd {
        async fn next_request(&mut self) -> Request {
            Request::try_from(self.requests.recv().await.unwrap()).unwrap()
        }

        async fn respond(&self, response: Response) {
            self.responses.send(Ok(response.into())).await.unwrap();
        }

        async fn answer_handshake(&mut self) {
            assert!(matches!(
                self.next_request().await,
                Request::Configuration(_)
            ));
            self.respond(Response::Configuration(ConfigurationResponse {
                provider_name: "georeg".to_string(),
                provider_version: "2.0.0".to_string(),
                frame_type: FrameType::Encoded,
            }))
            .await;
        }
    }

    fn session() -> (Session, EventReceiver, ModelServerEnd) {
        session_with(SessionSettings {
            sweep_interval: Duration::from_millis(10),
            ..SessionSettings::default()
        })
    }

    fn session_with(settings: SessionSettings) -> (Session, EventReceiver, ModelServerEnd) {
        let (outbound, requests) = mpsc::channel(16);
        let (responses, inbound) = mpsc::channel(16);
        let transport = CallTransport::from_parts(outbound, ReceiverStream::new(inbound));
        let (session, events) = Session::new(transport, settings);
        (
            session,
            events,
            ModelServerEnd {
                requests,
                responses,
            },
        )
    }

    fn frame(stream_id: u64, frame_id: u64) -> Frame {
        Frame::new(
            identifier(stream_id, frame_id),
            Image::Raw(RawImage {
                width: 1280,
                height: 720,
                channels: 3,
                path: format!("/frames/{frame_id}.rgb"),
            }),
        )
    }

    fn result(stream_id: u64, frame_id: u64) -> Response {
        Response::Result(FrameResult {
            identifier: identifier(stream_id, frame_id),
            payload: ResultPayload::Inferences(vec![]),
        })
    }

    async fn ready_session() -> (Session, EventReceiver, ModelServerEnd) {
        negotiated(session()).await
    }

    async fn negotiated(
        (session, events, mut server): (Session, EventReceiver, ModelServerEnd),
    ) -> (Session, EventReceiver, ModelServerEnd) {
        let (negotiated, ()) = tokio::join!(session.negotiate(), server.answer_handshake());
        assert_eq!(negotiated.unwrap().frame_type, FrameType::Encoded);
        (session, events, server)
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_before_handshake_is_a_protocol_violation() {
        let (session, mut events, mut server) = session();
        assert!(matches!(
            session.send_frame(frame(1, 1), Duration::from_millis(100)).await,
            Err(LinkError::ProtocolViolation(_))
        ));
        assert_eq!(session.outstanding(), 0);
        assert!(server.requests.try_recv().is_err());
        assert!(session.is_closed());
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::Closed(Some(LinkError::ProtocolViolation(_)))
        ));
        assert!(matches!(
            session.negotiate().await,
            Err(LinkError::Connection(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiating_twice_is_rejected() {
        let (session, _events, _server) = ready_session().await;
        assert!(session.is_ready());
        assert!(matches!(
            session.negotiate().await,
            Err(LinkError::ProtocolViolation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_then_late_scenario() {
        let (session, mut events, mut server) = ready_session().await;

        session
            .send_frame(frame(1, 1), Duration::from_millis(200))
            .await
            .unwrap();
        server.next_request().await;
        sleep(Duration::from_millis(50)).await;
        server.respond(result(1, 1)).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::Accepted { latency, .. } if latency == Duration::from_millis(50)
        ));

        session
            .send_frame(frame(1, 2), Duration::from_millis(50))
            .await
            .unwrap();
        server.next_request().await;
        sleep(Duration::from_millis(100)).await;
        // The sweeper reports the frame first; its answer is still late.
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Expired(identifier(1, 2))
        );
        server.respond(result(1, 2)).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::LateDiscarded { result, overdue }
                if result.identifier == identifier(1, 2) && overdue == Duration::from_millis(50)
        ));
        assert_eq!(session.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_with_default_settings() {
        let (session, mut events, mut server) =
            negotiated(session_with(SessionSettings::default())).await;

        session
            .send_frame(frame(1, 2), Duration::from_millis(50))
            .await
            .unwrap();
        server.next_request().await;
        sleep(Duration::from_millis(100)).await;
        server.respond(result(1, 2)).await;

        // Whether a sweep ran first only decides if an expiry report comes
        // before the late one.
        let mut event = events.recv().await.unwrap();
        if event == LinkEvent::Expired(identifier(1, 2)) {
            event = events.recv().await.unwrap();
        }
        assert!(matches!(
            event,
            LinkEvent::LateDiscarded { result, overdue }
                if result.identifier == identifier(1, 2) && overdue == Duration::from_millis(50)
        ));
        assert_eq!(session.outstanding(), 0);
        assert!(session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_frame_expires_via_sweeper() {
        let (session, mut events, mut server) = ready_session().await;

        session
            .send_frame(frame(2, 1), Duration::from_millis(40))
            .await
            .unwrap();
        server.next_request().await;

        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Expired(identifier(2, 1))
        );

        // An answer trailing the expiry is discarded as late.
        server.respond(result(2, 1)).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::LateDiscarded { result, .. } if result.identifier == identifier(2, 1)
        ));
        assert!(session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_response_closes_the_session() {
        let (session, mut events, mut server) = ready_session().await;

        session
            .send_frame(frame(4, 1), Duration::from_secs(30))
            .await
            .unwrap();
        session
            .send_frame(frame(4, 2), Duration::from_secs(31))
            .await
            .unwrap();
        server.next_request().await;
        server.next_request().await;

        server
            .responses
            .send(Ok(proto::Response { response: None }))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Expired(identifier(4, 1))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Expired(identifier(4, 2))
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::Closed(Some(LinkError::Decode(_)))
        ));
        assert!(session.is_closed());
        assert!(!session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restated_results_before_deadline() {
        let (session, mut events, mut server) = ready_session().await;

        session
            .send_frame(frame(3, 1), Duration::from_millis(500))
            .await
            .unwrap();
        server.next_request().await;
        server.respond(result(3, 1)).await;
        server.respond(result(3, 1)).await;

        for _ in 0..2 {
            assert!(matches!(
                events.recv().await.unwrap(),
                LinkEvent::Accepted { result, .. } if result.identifier == identifier(3, 1)
            ));
        }
        assert_eq!(session.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_flushes_outstanding_as_expired() {
        let (session, mut events, mut server) = ready_session().await;

        session
            .send_frame(frame(1, 1), Duration::from_secs(30))
            .await
            .unwrap();
        session
            .send_frame(frame(1, 2), Duration::from_secs(31))
            .await
            .unwrap();
        server.next_request().await;
        server.next_request().await;
        drop(server);

        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Expired(identifier(1, 1))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Expired(identifier(1, 2))
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::Closed(Some(LinkError::Connection(_)))
        ));
        assert!(session.is_closed());
        assert_eq!(session.outstanding(), 0);
        assert!(matches!(
            session.send_frame(frame(1, 3), Duration::from_secs(1)).await,
            Err(LinkError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_send_frame_does_not_wait_for_a_slow_socket() {
        use crate::codec::{decode_request, encode_response};
        use crate::framer::{self, DEFAULT_MAX_MESSAGE_BYTES};
        use crate::transport::FramedTransport;
        use tokio::io::duplex;
        use tokio::time::timeout;

        let (ours, theirs) = duplex(64);
        let (session, _events) = Session::new(
            FramedTransport::new(ours, DEFAULT_MAX_MESSAGE_BYTES),
            SessionSettings::default(),
        );
        let (mut reader, mut writer) = framer::split(theirs, DEFAULT_MAX_MESSAGE_BYTES);

        let peer = async {
            let request = decode_request(&reader.read_message().await.unwrap()).unwrap();
            assert!(matches!(request, Request::Configuration(_)));
            let response = Response::Configuration(ConfigurationResponse {
                provider_name: "georeg".to_string(),
                provider_version: "2.0.0".to_string(),
                frame_type: FrameType::Raw,
            });
            writer
                .write_message(&encode_response(response))
                .await
                .unwrap();
        };
        let (negotiated, ()) = tokio::join!(session.negotiate(), peer);
        negotiated.unwrap();

        // Far larger than the pipe, and nobody is reading yet.
        let mut big = frame(5, 1);
        if let Image::Raw(raw) = &mut big.image {
            raw.path = "p".repeat(4096);
        }
        timeout(
            Duration::from_millis(200),
            session.send_frame(big.clone(), Duration::from_secs(5)),
        )
        .await
        .unwrap()
        .unwrap();
        session
            .send_frame(frame(5, 2), Duration::from_secs(5))
            .await
            .unwrap();

        let first = decode_request(&reader.read_message().await.unwrap()).unwrap();
        assert_eq!(
            first,
            Request::Frame {
                frame: big,
                deadline: Duration::from_secs(5)
            }
        );
        let second = decode_request(&reader.read_message().await.unwrap()).unwrap();
        assert!(matches!(
            second,
            Request::Frame { frame, .. } if frame.identifier == identifier(5, 2)
        ));
        assert_eq!(session.outstanding(), 2);
        assert!(session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let (session, mut events, _server) = ready_session().await;
        session
            .send_frame(frame(7, 7), Duration::from_secs(30))
            .await
            .unwrap();

        session.close();
        session.close();

        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Expired(identifier(7, 7))
        );
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Closed(None));
        assert!(session.is_closed());
    }
}
