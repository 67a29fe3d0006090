//! WebSocket transport from the node to the server.
//!
//! Both streams carry the node id in the `x-node-id` upgrade header. Command
//! messages travel as JSON text frames, tunnel frames as binary frames.

use futures::{future, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use super::client::Connector;
use crate::error::TransportError;
use crate::proto::{BoxSink, BoxStream, CmdRequest, CmdResponse, COMMAND_PATH, NODE_ID_HEADER, TUNNEL_PATH};
use crate::tunnel::{TunnelFrame, TunnelOpener};

/// Map an `http(s)://` base URL to the `ws(s)://` URL of `path`.
pub fn ws_url(server_url: &str, path: &str) -> Result<String, TransportError> {
    let base = server_url.trim_end_matches('/');
    let rest = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(TransportError::Handshake(format!("unsupported server url: {server_url}")));
    };
    Ok(format!("{rest}{path}"))
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
    node_id: String,
}

impl WsConnector {
    pub fn new(server_url: &str, node_id: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            node_id: node_id.to_string(),
        }
    }

    async fn dial(&self, path: &str) -> Result<WsStream, TransportError> {
        let url = ws_url(&self.server_url, path)?;
        let mut request = url.as_str().into_client_request()?;
        let id = HeaderValue::from_str(&self.node_id).map_err(|e| TransportError::Handshake(e.to_string()))?;
        request.headers_mut().insert(NODE_ID_HEADER, id);
        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(ws)
    }
}

impl Connector for WsConnector {
    async fn open(&self) -> Result<(BoxSink<CmdResponse>, BoxStream<CmdRequest>), TransportError> {
        let (sink, stream) = self.dial(COMMAND_PATH).await?.split();

        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|response: CmdResponse| {
                future::ready(
                    serde_json::to_string(&response)
                        .map(|text| Message::Text(text.into()))
                        .map_err(TransportError::from),
                )
            });
        let stream = stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| future::ready(decode_command(msg)));

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

impl TunnelOpener for WsConnector {
    async fn open_tunnel(&self) -> Result<(BoxSink<TunnelFrame>, BoxStream<TunnelFrame>), TransportError> {
        let (sink, stream) = self.dial(TUNNEL_PATH).await?.split();

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

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn decode_command(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<CmdRequest, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => match serde_json::from_str(&text) {
            Ok(request) => Some(Ok(request)),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable command");
                None
            }
        },
        Ok(_) => None,
        Err(e) => Some(Err(e.into())),
    }
}

fn decode_frame(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<TunnelFrame, TransportError>> {
    match msg {
        Ok(Message::Binary(bytes)) => Some(TunnelFrame::decode(&bytes).map_err(TransportError::from)),
        Ok(_) => None,
        Err(e) => Some(Err(e.into())),
    }
}
