use model_link::{
    identifier, ConfigurationRequest, ConfigurationResponse, EncodedImage, FramedModelServer,
    FramedTransport, Frame, FrameType, Image, ImageFormat, LinkEvent, ModelService,
    ResultPayload, Session, SessionSettings, DEFAULT_MAX_MESSAGE_BYTES,
};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};
use tonic::async_trait;

/// Skips every third frame and answers stream 9 slowly.
struct MockModelService {}

#[async_trait]
impl ModelService for MockModelService {
    fn configuration(&self, request: &ConfigurationRequest) -> ConfigurationResponse {
        ConfigurationResponse {
            provider_name: format!("detector-for-{}", request.orchestrator_name),
            provider_version: "2.1.0".to_string(),
            frame_type: FrameType::Encoded,
        }
    }

    async fn infer(&self, frame: Frame, _deadline: Duration) -> Option<ResultPayload> {
        if frame.identifier.frame_id % 3 == 0 {
            return None;
        }
        let delay = if frame.identifier.stream_id == 9 { 300 } else { 5 };
        sleep(Duration::from_millis(delay)).await;
        Some(ResultPayload::Inferences(vec![]))
    }
}

fn encoded_frame(stream_id: u64, frame_id: u64) -> Frame {
    Frame::new(
        identifier(stream_id, frame_id),
        Image::Encoded(EncodedImage {
            path: format!("/captures/{stream_id}/{frame_id}.jpg"),
            format: ImageFormat::Jpeg as i32,
        }),
    )
}

async fn start_server() -> (String, broadcast::Sender<()>) {
    let server = FramedModelServer::bind(
        "127.0.0.1:0",
        MockModelService {},
        DEFAULT_MAX_MESSAGE_BYTES,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(server.serve(shutdown_rx));
    (addr, shutdown_tx)
}

async fn connect(addr: &str, sweep_interval: Duration) -> (Session, model_link::EventReceiver) {
    let transport = FramedTransport::connect(addr, DEFAULT_MAX_MESSAGE_BYTES)
        .await
        .unwrap();
    let settings = SessionSettings {
        orchestrator_name: "pipeline".to_string(),
        sweep_interval,
        ..SessionSettings::default()
    };
    Session::new(transport, settings)
}

#[tokio::test]
async fn test_results_are_accepted_and_skipped_frames_expire() {
    let (addr, _shutdown_tx) = start_server().await;
    let (session, mut events) = connect(&addr, Duration::from_millis(10)).await;

    let configuration = session.negotiate().await.unwrap();
    assert_eq!(configuration.provider_name, "detector-for-pipeline");
    assert_eq!(configuration.frame_type, FrameType::Encoded);

    session
        .send_frame(encoded_frame(1, 1), Duration::from_secs(5))
        .await
        .unwrap();
    session
        .send_frame(encoded_frame(1, 2), Duration::from_secs(5))
        .await
        .unwrap();
    session
        .send_frame(encoded_frame(1, 3), Duration::from_millis(100))
        .await
        .unwrap();

    let mut accepted = Vec::new();
    let mut expired = Vec::new();
    timeout(Duration::from_secs(5), async {
        while accepted.len() < 2 || expired.is_empty() {
            match events.recv().await.unwrap() {
                LinkEvent::Accepted { result, .. } => accepted.push(result.identifier.frame_id),
                LinkEvent::Expired(id) => expired.push(id.frame_id),
                other => panic!("unexpected event {:?}", other),
            }
        }
    })
    .await
    .unwrap();

    accepted.sort_unstable();
    assert_eq!(accepted, vec![1, 2]);
    assert_eq!(expired, vec![3]);
    assert_eq!(session.outstanding(), 0);
}

#[tokio::test]
async fn test_slow_result_is_late() {
    let (addr, _shutdown_tx) = start_server().await;
    let (session, mut events) = connect(&addr, Duration::from_millis(10)).await;
    session.negotiate().await.unwrap();

    session
        .send_frame(encoded_frame(9, 1), Duration::from_millis(20))
        .await
        .unwrap();

    // The sweep reports the frame long before the answer shows up, and the
    // answer is still classified as late.
    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, LinkEvent::Expired(identifier(9, 1)));

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        LinkEvent::LateDiscarded { result, overdue }
            if result.identifier == identifier(9, 1) && overdue > Duration::ZERO
    ));
}

#[tokio::test]
async fn test_duplicate_identifier_leaves_session_usable() {
    let (addr, _shutdown_tx) = start_server().await;
    let (session, mut events) = connect(&addr, Duration::from_millis(10)).await;
    session.negotiate().await.unwrap();

    session
        .send_frame(encoded_frame(2, 1), Duration::from_secs(5))
        .await
        .unwrap();
    let err = session
        .send_frame(encoded_frame(2, 1), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(!err.is_fatal());
    assert!(session.is_ready());

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, LinkEvent::Accepted { .. }));
}

#[tokio::test]
async fn test_close_ends_the_event_stream_cleanly() {
    let (addr, _shutdown_tx) = start_server().await;
    let (session, mut events) = connect(&addr, Duration::from_millis(10)).await;
    session.negotiate().await.unwrap();

    session.close();
    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, LinkEvent::Closed(None));
    assert!(session
        .send_frame(encoded_frame(1, 1), Duration::from_secs(1))
        .await
        .is_err());
}
