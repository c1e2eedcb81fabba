use crate::config::{Config, TransportKind};
use crate::event::{EventReceiver, LinkEvent};
use crate::session::{Session, SessionSettings};
use crate::transport::{connect_with_retry, CallTransport, FramedTransport};
use std::error::Error;

/// Connects to the configured ModelServer, negotiates, reports what it
/// offers and disconnects.
pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let link = &config.link;
    let settings = SessionSettings::from(link);
    let policy = link.connect_policy();

    tracing::info!(
        "Connecting to ModelServer at {} over the {} transport",
        link.get_address(),
        link.transport.as_str()
    );

    let (session, events) = match link.transport {
        TransportKind::Framed => {
            let addr = link.get_address();
            let transport = connect_with_retry(&policy, || {
                FramedTransport::connect(&addr, link.max_message_bytes)
            })
            .await?;
            Session::new(transport, settings)
        }
        TransportKind::Call => {
            let endpoint = link.get_endpoint();
            let transport = connect_with_retry(&policy, || {
                CallTransport::connect(
                    endpoint.clone(),
                    link.max_message_bytes as usize,
                    link.event_buffer,
                )
            })
            .await?;
            Session::new(transport, settings)
        }
    };

    probe(session, events).await
}

async fn probe(session: Session, mut events: EventReceiver) -> Result<(), Box<dyn Error>> {
    let configuration = match session.negotiate().await {
        Ok(configuration) => configuration,
        Err(e) => {
            tracing::error!("Handshake failed: {}", e);
            return Err(Box::new(e));
        }
    };

    tracing::info!(
        "ModelServer {} {} is ready and expects {} frames",
        configuration.provider_name,
        configuration.provider_version,
        configuration.frame_type.as_str_name()
    );

    session.close();
    while let Some(event) = events.recv().await {
        if let LinkEvent::Closed(error) = event {
            if let Some(e) = error {
                tracing::warn!("Session closed with error: {}", e);
            }
            break;
        }
    }

    Ok(())
}
