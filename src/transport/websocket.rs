//! WebSocket transport: one bot session per connected client
//!
//! Client to server:
//! - binary: s16le mono PCM at the speech recognition sample rate
//! - text: [`ClientMessage`] JSON
//!
//! Server to client:
//! - binary: s16le PCM at the synthesis sample rate
//! - text: [`ClientEvent`] JSON

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bot;
use crate::config::Config;
use crate::frames::{AudioRaw, Frame};
use crate::pipeline::{PipelineRunner, TaskEvent};
use crate::processors::{ChannelSink, ClientEvent};
use crate::{Error, Result};

/// How long queued output may take to reach a departing client
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Text message from the client
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A typed user turn
    Text { content: String },
    /// Keepalive; answered with `pong`
    Ping,
}

/// Parse a text message from the client
///
/// # Errors
///
/// Returns error if the message is not a known client message
pub fn parse_client_message(text: &str) -> Result<ClientMessage> {
    Ok(serde_json::from_str(text)?)
}

/// Build the server router
pub fn router(config: Arc<Config>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(config)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Liveness probe
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ws_upgrade(
    State(config): State<Arc<Config>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, config))
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ClientEvent,
) -> std::result::Result<(), ()> {
    let Ok(text) = serde_json::to_string(event) else {
        return Ok(());
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Run one bot session for a connected client
async fn handle_socket(socket: WebSocket, config: Arc<Config>) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let connected = ClientEvent::Connected {
        session_id: session_id.clone(),
        input_sample_rate: config.stt.sample_rate,
        output_sample_rate: config.tts.sample_rate,
    };
    if send_event(&mut sender, &connected).await.is_err() {
        return;
    }

    tracing::info!(session_id = %session_id, "client connected");

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ClientEvent>();
    let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<AudioRaw>();

    let output = Arc::new(ChannelSink::new(audio_tx));
    let session = bot::build_pipeline(&config, output, events_tx.clone());
    let handle = session.handle();
    let task_events = session.task.events();

    // Bot audio and events to the client
    let mut writer = tokio::spawn(async move {
        loop {
            let sent = tokio::select! {
                Some(audio) = audio_rx.recv() => {
                    sender.send(Message::Binary(audio.audio)).await.map_err(|_| ())
                }
                Some(event) = events_rx.recv() => send_event(&mut sender, &event).await,
                else => break,
            };
            if sent.is_err() {
                tracing::debug!("client gone, stopping writer");
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let errors = tokio::spawn(forward_errors(task_events, events_tx.clone()));
    let mut pipeline = tokio::spawn(bot::run_session(session, PipelineRunner::new(false)));

    let input_rate = config.stt.sample_rate;
    let interrupt = config.pipeline.allow_interruptions;
    let mut pipeline_done = false;

    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    let audio = AudioRaw::new(data, input_rate, 1);
                    if handle.queue_frame(Frame::InputAudio(audio)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => match parse_client_message(text.as_str()) {
                    Ok(ClientMessage::Text { content }) => {
                        tracing::debug!(session_id = %session_id, "typed user turn");
                        if bot::send_text(&handle, &content, interrupt).is_err() {
                            break;
                        }
                    }
                    Ok(ClientMessage::Ping) => {
                        let _ = events_tx.send(ClientEvent::Pong);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "invalid client message");
                        let _ = events_tx.send(ClientEvent::Error {
                            message: format!("invalid message: {e}"),
                            fatal: false,
                        });
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket receive error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            result = &mut pipeline => {
                pipeline_done = true;
                match result {
                    Ok(Ok(outcome)) => tracing::info!(?outcome, "session pipeline finished"),
                    Ok(Err(e)) => tracing::error!(error = %e, "session pipeline failed"),
                    Err(e) => tracing::error!(error = %e, "session pipeline panicked"),
                }
                break;
            }
        }
    }

    if !pipeline_done {
        handle.cancel();
        if let Err(e) = pipeline.await {
            tracing::error!(error = %e, "session pipeline panicked");
        }
    }
    errors.abort();
    drop(events_tx);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    tracing::info!(session_id = %session_id, "client disconnected");
}

/// Report pipeline errors to the client
async fn forward_errors(
    mut task_events: broadcast::Receiver<TaskEvent>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    loop {
        match task_events.recv().await {
            Ok(TaskEvent::Error(error)) => {
                let event = ClientEvent::Error {
                    message: error.message,
                    fatal: error.fatal,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(TaskEvent::Finished(_)) | Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "dropped pipeline events");
            }
        }
    }
}

/// Serve on an already bound listener until `shutdown` resolves
///
/// # Errors
///
/// Returns error if the server fails
pub async fn serve_on<F>(listener: TcpListener, config: Arc<Config>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(config))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Transport(format!("server error: {e}")))
}

/// Run the WebSocket server until Ctrl-C
///
/// # Errors
///
/// Returns error if the server fails to bind or run
pub async fn serve(config: Config) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Transport(format!("failed to bind {addr}: {e}")))?;

    let local: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(addr = ?local, "voice server listening, connect to /ws");

    serve_on(listener, Arc::new(config), async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse() {
        assert_eq!(
            parse_client_message(r#"{"type":"text","content":"hi there"}"#).unwrap(),
            ClientMessage::Text {
                content: "hi there".to_string()
            }
        );
        assert_eq!(
            parse_client_message(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn unknown_client_messages_are_rejected() {
        assert!(parse_client_message(r#"{"type":"dance"}"#).is_err());
        assert!(parse_client_message("not json").is_err());
    }
}
