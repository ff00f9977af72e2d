//! RTM session plumbing — bootstrap handshake and event-stream tasks.
//!
//! `connect` performs the `rtm.start` handshake and opens the WebSocket
//! the response points at. `spawn_stream` splits the socket into a reader
//! task (inbound frames → typed [`RtmEvent`]s on the engine channel) and a
//! writer task (outbound JSON frames), returning the outbound sender.
//! Dropping that sender ends the writer and closes the socket; the reader
//! reports the close, tagged with the session generation it belongs to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::api::{ApiClient, ApiError};
use super::event::{RtmEvent, Snapshot};
use crate::engine::Input;

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Perform the `rtm.start` handshake and open the event stream.
pub async fn connect(api: &ApiClient) -> Result<(Snapshot, WsStream), ApiError> {
    let response = api.call("rtm.start", &[]).await?;
    let snapshot: Snapshot = serde_json::from_value(response)
        .map_err(|_| ApiError::Malformed("rtm.start snapshot"))?;

    info!("rtm: opening event stream");
    let (ws, _response) = tokio_tungstenite::connect_async(snapshot.url.as_str())
        .await
        .map_err(|e| ApiError::WebSocket(Box::new(e)))?;
    Ok((snapshot, ws))
}

/// Spawn the reader and writer tasks for a connected stream. Returns the
/// sender for outbound frames.
pub fn spawn_stream(
    ws: WsStream,
    gen: u64,
    input_tx: mpsc::UnboundedSender<Input>,
    dump: Arc<AtomicBool>,
) -> mpsc::UnboundedSender<Value> {
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Value>();
    let (mut sink, mut stream) = ws.split();

    // Writer: one JSON object per text frame. Ends when the engine drops
    // the sender.
    let writer_dump = dump.clone();
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let text = frame.to_string();
            if writer_dump.load(Ordering::Relaxed) {
                info!(target: "wire", "rtm> {text}");
            }
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: inbound frames → typed events. One bad frame must not kill
    // the session, so decode failures are logged and swallowed.
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("rtm: stream error: {e}");
                    break;
                }
            };
            if dump.load(Ordering::Relaxed) {
                info!(target: "wire", "rtm< {text}");
            }

            let value: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    warn!("rtm: undecodable frame: {e}");
                    continue;
                }
            };
            if value.get("type").is_none() {
                // Acknowledgements of sent messages carry reply_to/ok but
                // no type.
                debug!("rtm: untyped frame ignored");
                continue;
            }
            let event = match serde_json::from_value::<RtmEvent>(value) {
                Ok(event) => event,
                Err(e) => {
                    warn!("rtm: undecodable event: {e}");
                    continue;
                }
            };
            if input_tx.send(Input::Rtm { gen, event }).is_err() {
                return;
            }
        }
        let _ = input_tx.send(Input::RtmClosed { gen });
    });

    frame_tx
}

/// Build an outbound message frame. The engine assigns the frame id.
pub fn message_frame(channel: &str, text: &str) -> Value {
    json!({ "type": "message", "channel": channel, "text": text })
}

/// Build an outbound ping frame. The engine assigns the frame id.
pub fn ping_frame() -> Value {
    json!({ "type": "ping" })
}
