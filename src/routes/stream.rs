//! WebSocket endpoints hosting the per-node streams.
//!
//! Both upgrades require the `x-node-id` header. The socket is adapted into
//! typed `Sink`/`Stream` halves so the command acceptor and the tunnel relay
//! never see WebSocket messages:
//!
//! - command stream: one JSON text message per `CmdRequest`/`CmdResponse`
//! - tunnel stream: one binary message per encoded `TunnelFrame`

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{future, SinkExt, StreamExt};
use serde_json::json;
use tracing::{info, warn, Instrument};

use crate::command::acceptor::serve_command_stream;
use crate::error::{TransportError, TunnelError};
use crate::proto::{BoxSink, BoxStream, CmdRequest, CmdResponse, NODE_ID_HEADER};
use crate::state::ServerState;
use crate::tunnel::{relay, TunnelFrame};

fn node_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(NODE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn missing_node_id() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "missing x-node-id header", "code": "MISSING_NODE_ID" })),
    )
        .into_response()
}

/// `GET /api/node/command` — a node's command stream.
pub async fn command_stream(State(state): State<ServerState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let Some(node_id) = node_id_from(&headers) else {
        return missing_node_id();
    };
    ws.on_upgrade(move |socket| {
        let span = tracing::info_span!("node_stream", node_id = %node_id);
        async move {
            info!("Command stream connected");
            let settings = state.config.server.channel_settings();
            let (sink, stream) = command_halves(socket);
            serve_command_stream(&state.registry, &settings, &node_id, sink, stream).await;
            info!("Command stream closed");
        }
        .instrument(span)
    })
}

/// `GET /api/node/tunnel` — one tunnel stream; the server dials the address
/// named in its first frame.
pub async fn tunnel_stream(State(state): State<ServerState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let Some(node_id) = node_id_from(&headers) else {
        return missing_node_id();
    };
    ws.on_upgrade(move |socket| {
        let span = tracing::info_span!("tunnel", node_id = %node_id);
        async move {
            let (sink, stream) = tunnel_halves(socket);
            match relay::accept(sink, stream, state.shutdown.child_token()).await {
                Ok(stats) => info!(sent = stats.sent, received = stats.received, "Tunnel finished"),
                Err(TunnelError::Cancelled) => info!("Tunnel cancelled"),
                Err(e) => warn!(error = %e, "Tunnel failed"),
            }
        }
        .instrument(span)
    })
}

fn command_halves(socket: WebSocket) -> (BoxSink<CmdRequest>, BoxStream<CmdResponse>) {
    let (sink, stream) = socket.split();
    let sink = sink.sink_map_err(TransportError::from).with(|request: CmdRequest| {
        future::ready(
            serde_json::to_string(&request)
                .map(|text| Message::Text(text.into()))
                .map_err(TransportError::from),
        )
    });
    let stream = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| future::ready(decode_response(msg)));
    (Box::pin(sink), Box::pin(stream))
}

fn tunnel_halves(socket: WebSocket) -> (BoxSink<TunnelFrame>, BoxStream<TunnelFrame>) {
    let (sink, stream) = socket.split();
    let sink = sink.sink_map_err(TransportError::from).with(|frame: TunnelFrame| {
        future::ready(
            frame
                .encode()
                .map(|bytes| Message::Binary(bytes.into()))
                .map_err(TransportError::from),
        )
    });
    let stream = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| future::ready(decode_frame(msg)));
    (Box::pin(sink), Box::pin(stream))
}

fn decode_response(msg: Result<Message, axum::Error>) -> Option<Result<CmdResponse, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
            Ok(response) => Some(Ok(response)),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable response");
                None
            }
        },
        Ok(_) => None,
        Err(e) => Some(Err(e.into())),
    }
}

fn decode_frame(msg: Result<Message, axum::Error>) -> Option<Result<TunnelFrame, TransportError>> {
    match msg {
        Ok(Message::Binary(bytes)) => Some(TunnelFrame::decode(&bytes).map_err(TransportError::from)),
        Ok(_) => None,
        Err(e) => Some(Err(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::Config;
    use crate::node::client::tests::EmptyFlush;
    use crate::node::client::{ClientSettings, ConnState, HandlerSet, NodeClient};
    use crate::node::transport::WsConnector;
    use crate::proto::CmdType;
    use crate::tunnel::TunnelStore;

    async fn spawn_server() -> (ServerState, String) {
        let state = ServerState::new(Config::default());
        let app = crate::routes::router(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, format!("http://{addr}"))
    }

    #[test]
    fn test_node_id_header() {
        let mut headers = HeaderMap::new();
        assert!(node_id_from(&headers).is_none());
        headers.insert(NODE_ID_HEADER, "  ".parse().unwrap());
        assert!(node_id_from(&headers).is_none());
        headers.insert(NODE_ID_HEADER, "node-1".parse().unwrap());
        assert_eq!(node_id_from(&headers).as_deref(), Some("node-1"));
    }

    #[tokio::test]
    async fn test_command_stream_over_websocket() {
        let (state, url) = spawn_server().await;
        let connector = WsConnector::new(&url, "node-ws");
        let handlers = HandlerSet::new().with(CmdType::NetworkFlush, EmptyFlush);
        let client = NodeClient::new("node-ws", connector, handlers, ClientSettings::default());
        client.connect().await;
        assert_eq!(client.state(), ConnState::Connected);

        for _ in 0..200 {
            if state.registry.is_online("node-ws") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let report = state.dispatcher.network_flush("node-ws", vec![]).await.unwrap();
        assert!(report.interfaces.is_empty());

        client.shutdown();
        for _ in 0..200 {
            if !state.registry.is_online("node-ws") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!state.registry.is_online("node-ws"));
    }

    #[tokio::test]
    async fn test_tunnel_over_websocket() {
        let (_state, url) = spawn_server().await;

        // Bait service: echoes one message back uppercased.
        let bait = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bait_addr = bait.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = bait.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf.to_ascii_uppercase()).await.unwrap();
        });

        let store = TunnelStore::new();
        let root = CancellationToken::new();
        let opener = std::sync::Arc::new(WsConnector::new(&url, "node-ws"));
        let decoy = store
            .open("127.0.0.1:0", &bait_addr.to_string(), opener, &root)
            .await
            .unwrap();

        let mut attacker = TcpStream::connect(decoy).await.unwrap();
        attacker.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), attacker.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"HELLO");

        root.cancel();
    }
}
