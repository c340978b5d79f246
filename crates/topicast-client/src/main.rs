//! Command-line subscriber for topicast.
//!
//! Connects to a running topicast server, subscribes to one topic, and
//! prints every message published to it until interrupted.
//!
//! ```bash
//! topicast-sub news
//! topicast-sub news 10.0.0.5:8081
//! ```

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::Message,
};
use tracing::{info, warn};

const DEFAULT_ADDRESS: &str = "127.0.0.1:8081";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "topicast_client=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(topic) = args.next() else {
        bail!("usage: topicast-sub <topic> [address]");
    };
    let address = args.next().unwrap_or_else(|| DEFAULT_ADDRESS.to_string());

    let url = format!("ws://{address}/subscribe?topic={topic}");
    info!("Connecting to {url}");

    let (socket, _response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("unable to connect to {url}"))?;
    let (mut sink, mut stream) = socket.split();

    info!(topic = %topic, "Subscribed; waiting for messages (Ctrl-C to exit)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                // Send a close frame so the server detaches cleanly.
                sink.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                })))
                .await
                .context("error closing connection")?;
                break;
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        info!(topic = %topic, "Received message: {text}");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("Server closed the connection");
                        break;
                    }
                    Some(Ok(other)) => {
                        warn!("Ignoring unexpected frame: {other:?}");
                    }
                    Some(Err(e)) => {
                        warn!("Error reading from socket: {e}");
                        break;
                    }
                    None => {
                        info!("Connection ended");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
