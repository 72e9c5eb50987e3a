//! WebSocket endpoint carrying judge sessions.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use engine::error::TransportError;
use engine::session::{Session, SessionTransport};
use tracing::debug;

use crate::state::AppState;

pub async fn judge(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    debug!("judge socket accepted");
    Session::new(
        WsTransport { socket },
        state.registry,
        state.pool,
        state.config,
    )
    .run()
    .await;
}

/// Adapts one accepted WebSocket to the engine's transport contract:
/// text frames through, control frames handled here.
struct WsTransport {
    socket: WebSocket,
}

#[async_trait]
impl SessionTransport for WsTransport {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(_)) => {
                    return Some(Err(TransportError(
                        "binary frames are not supported".into(),
                    )));
                }
                // The library answers pings; nothing to surface.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(err) => return Some(Err(TransportError(err.to_string()))),
            }
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(frame.into()))
            .await
            .map_err(|err| TransportError(err.to_string()))
    }

    async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        self.socket
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|err| TransportError(err.to_string()))
    }
}
