use tether_gateway::{Transport, TransportConfig, TransportEvent};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TETHER_GATEWAY_URL").ok())
        .unwrap_or_else(|| {
            eprintln!("usage: tether <gateway-url>  (or set TETHER_GATEWAY_URL)");
            std::process::exit(2);
        });

    tracing::info!(url = %url, "Starting tether gateway probe");

    let config = TransportConfig::new(&url);
    let (transport, mut events) = match Transport::connect(config).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect");
            std::process::exit(1);
        }
    };
    tracing::info!("Connected");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for ctrl+c");
                }
                tracing::info!("Shutting down");
                if let Err(e) = transport.disconnect(1000, "client shutdown").await {
                    tracing::warn!(error = %e, "Disconnect failed");
                }
                break;
            }
            event = events.recv() => {
                match event {
                    Some(TransportEvent::Message { payload, .. }) => log_message(&payload),
                    Some(TransportEvent::Closed { code, reason, initiated_by_remote }) => {
                        tracing::info!(code, reason = %reason, remote = initiated_by_remote, "Connection closed");
                        break;
                    }
                    Some(TransportEvent::Error { error }) => {
                        tracing::error!(error = %error, "Transport error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Log one received payload, peeking at the op/type field when the payload
/// parses as JSON.
fn log_message(payload: &[u8]) {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => {
            let op = value
                .get("op")
                .or_else(|| value.get("t"))
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".into());
            tracing::info!(op = %op, bytes = payload.len(), "Message received");
        }
        Err(_) => {
            tracing::info!(bytes = payload.len(), "Non-JSON message received");
        }
    }
}
