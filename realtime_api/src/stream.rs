use std::net::TcpStream;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tungstenite::{connect, stream::MaybeTlsStream, Message, WebSocket};

use crate::{row::ChangeEvent, Endpoint, RealtimeError};

const JOIN_REF: &str = "1";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const READ_TIMEOUT: Duration = Duration::from_millis(500);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Phoenix channel frame
#[derive(Debug, Default, Serialize, Deserialize)]
struct ChannelMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(rename = "ref")]
    reference: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Incoming {
    Joined,
    JoinError(String),
    HeartbeatReply,
    Change(ChangeEvent),
    Closed(String),
    System(String),
    Ignored(String),
}

fn reply_status(payload: &serde_json::Value) -> Option<&str> {
    payload.get("status").and_then(|s| s.as_str())
}

fn describe(payload: &serde_json::Value) -> String {
    payload
        .get("response")
        .and_then(|r| r.get("reason"))
        .or_else(|| payload.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}

fn parse_change(payload: &serde_json::Value) -> ChangeEvent {
    let data = payload.get("data").unwrap_or(payload);
    match data.get("type").and_then(|t| t.as_str()) {
        Some("INSERT") | Some("UPDATE") => match data.get("record") {
            Some(record) => ChangeEvent::from_record(record.clone()),
            None => ChangeEvent::Malformed("change event without `record`".to_string()),
        },
        Some("DELETE") => match data.get("old_record") {
            Some(old_record) => ChangeEvent::from_old_record(old_record),
            None => ChangeEvent::Malformed("delete event without `old_record`".to_string()),
        },
        Some(other) => ChangeEvent::Malformed(format!("unknown change type `{other}`")),
        None => ChangeEvent::Malformed("change event without `type`".to_string()),
    }
}

fn parse_message(text: &str) -> Result<Incoming, RealtimeError> {
    let msg: ChannelMessage = serde_json::from_str(text)?;

    let incoming = match msg.event.as_str() {
        "phx_reply" => {
            let is_join = msg.reference.as_deref() == Some(JOIN_REF);
            match (reply_status(&msg.payload), is_join) {
                (Some("ok"), true) => Incoming::Joined,
                (Some("ok"), false) => Incoming::HeartbeatReply,
                (_, true) => Incoming::JoinError(describe(&msg.payload)),
                (_, false) => Incoming::Ignored(format!("reply {}", msg.payload)),
            }
        }
        "postgres_changes" => Incoming::Change(parse_change(&msg.payload)),
        "system" => match reply_status(&msg.payload) {
            Some("error") => Incoming::JoinError(describe(&msg.payload)),
            _ => Incoming::System(describe(&msg.payload)),
        },
        "phx_error" | "phx_close" => Incoming::Closed(format!("{} on `{}`", msg.event, msg.topic)),
        other => Incoming::Ignored(other.to_string()),
    };

    Ok(incoming)
}

fn join_message(endpoint: &Endpoint) -> String {
    json!({
        "topic": endpoint.topic(),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": endpoint.schema,
                    "table": endpoint.table,
                }],
            },
            "access_token": endpoint.access_token,
        },
        "ref": JOIN_REF,
        "join_ref": JOIN_REF,
    })
    .to_string()
}

fn heartbeat_message(reference: u64) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
    .to_string()
}

fn set_read_timeout(socket: &mut Socket, timeout: Duration) -> std::io::Result<()> {
    match socket.get_mut() {
        MaybeTlsStream::Plain(s) => s.set_read_timeout(Some(timeout)),
        MaybeTlsStream::NativeTls(s) => s.get_ref().set_read_timeout(Some(timeout)),
        _ => Ok(()),
    }
}

fn create_websocket(endpoint: &Endpoint) -> Result<Socket, RealtimeError> {
    let (mut socket, _response) = connect(endpoint.url.as_str())?;
    if let Err(e) = set_read_timeout(&mut socket, READ_TIMEOUT) {
        log::warn!("Cannot set websocket read timeout: {e}");
    }
    Ok(socket)
}

/// Sleeps for `duration` unless cancelled first. Returns `false` on cancellation.
fn wait(duration: Duration, cancellation_token: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if cancellation_token.is_cancelled() {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    !cancellation_token.is_cancelled()
}

enum ChannelExit {
    Cancelled,
    ReceiverGone,
    Disconnected,
}

fn run_channel(
    socket: &mut Socket,
    endpoint: &Endpoint,
    event_tx: &mpsc::Sender<ChangeEvent>,
    cancellation_token: &CancellationToken,
) -> Result<ChannelExit, RealtimeError> {
    socket.send(Message::Text(join_message(endpoint)))?;

    let mut heartbeat_ref = 1u64;
    let mut last_heartbeat = Instant::now();

    loop {
        if cancellation_token.is_cancelled() {
            return Ok(ChannelExit::Cancelled);
        }

        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            heartbeat_ref += 1;
            socket.send(Message::Text(heartbeat_message(heartbeat_ref)))?;
            last_heartbeat = Instant::now();
        }

        let text = match socket.read() {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                log::warn!("WebSocket is closing: {frame:?}");
                return Ok(ChannelExit::Disconnected);
            }
            Ok(_) => continue,
            Err(tungstenite::Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(e) => return Err(e.into()),
        };

        let incoming = match parse_message(&text) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Cannot parse realtime message: {e}");
                log::debug!("{text}");
                continue;
            }
        };

        match incoming {
            Incoming::Joined => log::info!("Subscribed to `{}`", endpoint.topic()),
            Incoming::JoinError(reason) => return Err(RealtimeError::JoinRejected(reason)),
            Incoming::HeartbeatReply => log::trace!("heartbeat acknowledged"),
            Incoming::Change(event) => {
                if event_tx.blocking_send(event).is_err() {
                    return Ok(ChannelExit::ReceiverGone);
                }
            }
            Incoming::Closed(reason) => {
                log::warn!("Realtime channel closed: {reason}");
                return Ok(ChannelExit::Disconnected);
            }
            Incoming::System(msg) => log::info!("Realtime: {msg}"),
            Incoming::Ignored(event) => log::debug!("Ignoring realtime event `{event}`"),
        }
    }
}

/// Subscribes to row changes of `endpoint.table` and forwards them over `event_tx`.
///
/// Blocks the calling thread, run it with `spawn_blocking`. Reconnects after socket failures and
/// returns `Ok` once cancelled or when `event_tx` is closed. A refused join is returned as
/// `RealtimeError::JoinRejected` since retrying will not change the outcome.
pub fn start(
    endpoint: &Endpoint,
    event_tx: mpsc::Sender<ChangeEvent>,
    cancellation_token: CancellationToken,
) -> Result<(), RealtimeError> {
    loop {
        if cancellation_token.is_cancelled() {
            break;
        }

        let mut socket = match create_websocket(endpoint) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Error connecting to realtime websocket: {e}");
                if !wait(RECONNECT_DELAY, &cancellation_token) {
                    break;
                }
                continue;
            }
        };

        let result = run_channel(&mut socket, endpoint, &event_tx, &cancellation_token);
        if let Err(e) = socket.close(None) {
            log::debug!("Error closing websocket: {e}");
        }

        match result {
            Ok(ChannelExit::Cancelled) => break,
            Ok(ChannelExit::ReceiverGone) => {
                log::warn!("Change event receiver dropped, closing realtime stream");
                break;
            }
            Ok(ChannelExit::Disconnected) => log::info!("Reconnecting to realtime websocket"),
            Err(e @ RealtimeError::JoinRejected(_)) => return Err(e),
            Err(e) => log::error!("Realtime stream error: {e}, reconnecting"),
        }

        if !wait(RECONNECT_DELAY, &cancellation_token) {
            break;
        }
    }

    Ok(())
}
