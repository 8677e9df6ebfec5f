pub mod status;

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures_util::{SinkExt, StreamExt, TryFutureExt};
use serde_json::json;
use share_common::{Notice, Topic, WsMessage};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::{config::Config, snapshot::Snapshot};

/// Unique client id counter.
static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// State of currently connected clients.
/// - Key is client id
/// - Value is sender of `warp::ws::Message`
type Clients = Arc<RwLock<HashMap<usize, mpsc::UnboundedSender<Message>>>>;

/// Requests from the web interface to the session
#[derive(Debug, PartialEq)]
pub enum MpscTopic {
    Sharing(bool),
}

/// Read side handed to every connection
#[derive(Clone)]
struct Views {
    identity: String,
    snapshot: watch::Receiver<Snapshot>,
    sharing: watch::Receiver<bool>,
}

impl Views {
    fn status_msg(&self) -> Option<String> {
        let snapshot = self.snapshot.borrow().clone();
        let is_sharing = *self.sharing.borrow();
        let status = status::sharing_status(&self.identity, &snapshot, is_sharing);
        notification_text(Topic::SharingStatus, &status)
    }

    fn snapshot_msg(&self) -> Option<String> {
        let snapshot = self.snapshot.borrow().clone();
        notification_text(Topic::Snapshot, &snapshot)
    }
}

fn notification_text<T: serde::Serialize>(topic: Topic, data: &T) -> Option<String> {
    let value = serde_json::to_value(data)
        .map_err(|e| log::error!("Error serializing {topic:?}: {e}"))
        .ok()?;
    WsMessage::notification(topic, value)
        .to_json()
        .map_err(|e| log::error!("Error converting WsMessage to string: {e}"))
        .ok()
}

/// `GET /snapshot` and the `/websocket` upgrade
fn routes(
    views: Views,
    clients: Clients,
    data_from_srv_tx: mpsc::UnboundedSender<MpscTopic>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_clients = warp::any().map(move || clients.clone());

    let websocket = {
        let views = views.clone();
        warp::path("websocket")
            .and(warp::ws())
            .and(with_clients)
            .map(move |ws: warp::ws::Ws, clients: Clients| {
                let tx = data_from_srv_tx.clone();
                let views = views.clone();
                ws.on_upgrade(move |socket| {
                    ShareServer::client_connected(socket, clients, tx, views)
                })
            })
    };

    let snapshot = warp::get()
        .and(warp::path("snapshot"))
        .and(warp::path::end())
        .map(move || {
            let snapshot = views.snapshot.borrow().clone();
            warp::reply::json(&snapshot)
        });

    snapshot.or(websocket)
}

pub struct ShareServer;

impl ShareServer {
    /// Serves `/snapshot` and `/websocket` until `exit_signal_rx` fires
    pub async fn start(
        config: Config,
        identity: String,
        port: u16,
        data_from_srv_tx: mpsc::UnboundedSender<MpscTopic>,
        snapshot_rx: watch::Receiver<Snapshot>,
        mut notices_rx: mpsc::UnboundedReceiver<Notice>,
        exit_signal_rx: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let sharing_rx = match config.sharing.lock() {
            Ok(v) => v.watch(),
            Err(e) => anyhow::bail!("Error subscribing to config value `sharing`: {e}"),
        };

        let views = Views {
            identity,
            snapshot: snapshot_rx,
            sharing: sharing_rx,
        };

        let clients = Clients::default(); // Keep track of all connected clients
        let routes = routes(views.clone(), clients.clone(), data_from_srv_tx);

        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        log::info!("Listening on http://{}", address);
        let signal = async {
            exit_signal_rx.await.ok();
        };
        let (_addr, server) =
            match warp::serve(routes).try_bind_with_graceful_shutdown(address, signal) {
                Ok(r) => r,
                Err(e) => anyhow::bail!(e),
            };

        // Push snapshot changes, sharing toggles and notices to every client
        let broadcaster = tokio::task::spawn({
            let mut views = views.clone();
            let clients = clients.clone();
            async move {
                let mut last_snapshot = views.snapshot.borrow_and_update().clone();
                loop {
                    tokio::select! {
                        changed = views.snapshot.changed() => {
                            if changed.is_err() {
                                log::warn!("Snapshot sender dropped");
                                break;
                            }
                            let snapshot = views.snapshot.borrow_and_update().clone();
                            let diff = last_snapshot.diff(&snapshot);
                            last_snapshot = snapshot;
                            if diff.is_empty() {
                                continue;
                            }
                            if let Some(msg) = notification_text(Topic::SnapshotDiff, &diff) {
                                broadcast(&clients, msg).await;
                            }
                            // participant count and own location live in the status
                            if let Some(msg) = views.status_msg() {
                                broadcast(&clients, msg).await;
                            }
                        }
                        changed = views.sharing.changed() => {
                            if changed.is_err() {
                                log::warn!("Sharing status sender dropped");
                                break;
                            }
                            views.sharing.borrow_and_update();
                            if let Some(msg) = views.status_msg() {
                                broadcast(&clients, msg).await;
                            }
                        }
                        Some(notice) = notices_rx.recv() => {
                            if let Some(msg) = notification_text(Topic::Notice, &notice) {
                                broadcast(&clients, msg).await;
                            }
                        }
                    }
                }
            }
        });

        tokio::select! {
            _ = server => log::warn!("Server exited"),
            status = broadcaster => log::error!("Broadcaster exited: {status:?}"),
        }

        tracing::warn!("Exiting server task");

        Ok(())
    }

    async fn client_connected(
        ws: WebSocket,
        clients: Clients,
        tx: mpsc::UnboundedSender<MpscTopic>,
        views: Views,
    ) {
        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);

        // Split the socket into a sender and receive of messages.
        let (mut client_ws_tx, mut client_ws_rx) = ws.split();

        // Use an unbounded channel to handle buffering and flushing of messages
        // to the websocket...
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let mut rx = UnboundedReceiverStream::new(client_rx);

        tokio::task::spawn(async move {
            while let Some(message) = rx.next().await {
                client_ws_tx
                    .send(message)
                    .unwrap_or_else(|e| {
                        log::error!("websocket send error: {}", e);
                    })
                    .await;
            }
        });

        // Registered before the initial state is read so no diff falls in between
        clients.write().await.insert(client_id, client_tx.clone());

        for msg in [views.snapshot_msg(), views.status_msg()].into_iter().flatten() {
            if let Err(disconnected) = client_tx.send(Message::text(msg)) {
                log::info!("Error {disconnected}");
            }
        }

        while let Some(result) = client_ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    log::error!("websocket error(uid={}): {}", client_id, e);
                    break;
                }
            };

            if let Err(e) = handle_messages(&client_tx, msg, &tx, &views.snapshot) {
                log::error!("{}", e);
            }
        }

        // client_ws_rx stream will keep processing as long as the client stays
        // connected. Once they disconnect, remove from the client list
        clients.write().await.remove(&client_id);
    }
}

/// Broadcast message to all connected clients
async fn broadcast(clients: &Clients, msg: String) {
    for (&_client_id, tx) in clients.read().await.iter() {
        if let Err(disconnected) = tx.send(Message::text(&msg)) {
            log::error!("Error {disconnected}");
        }
    }
}

fn send(client: &mpsc::UnboundedSender<Message>, msg: &WsMessage) -> anyhow::Result<()> {
    let msg_str = msg.to_json()?;

    if let Err(disconnected) = client.send(Message::text(msg_str)) {
        log::info!("Error {disconnected}");
    }

    Ok(())
}

/// Clients send commands in the following format
/// {
///  "id": "<some id to connect the commands and responses>",
///  "type": "command",
///  "topic": "start" | "stop" | "get-snapshot",
///  "data": null
/// }
///
/// The server answers with the same id
/// {
///   "id": "<same id as the command>",
///   "type": "response",
///   "topic": "<same topic>",
///   "data": {"status": true} | {"status": false, "reason": "..."} | <snapshot>
/// }
fn handle_messages(
    client: &mpsc::UnboundedSender<Message>,
    msg: Message,
    tx: &mpsc::UnboundedSender<MpscTopic>,
    snapshot: &watch::Receiver<Snapshot>,
) -> anyhow::Result<()> {
    if msg.is_close() {
        let frame = msg.close_frame();
        let (code, reason) = match frame {
            Some(cr) => (cr.0.to_string(), cr.1),
            None => ("".to_string(), ""),
        };
        log::info!("WebSocket closing - code `{}`, reason `{}`", code, reason);
        return Ok(());
    }

    if msg.is_ping() || msg.is_pong() {
        return Ok(());
    }

    let Ok(msg) = msg.to_str() else {
        anyhow::bail!("Non text message received: {msg:?}");
    };

    let ws_msg = WsMessage::from_json(msg)?;

    let forward = |enable: bool| match tx.send(MpscTopic::Sharing(enable)) {
        Ok(()) => json!({"status": true}),
        Err(e) => json!({"status": false, "reason": e.to_string()}),
    };

    match ws_msg.topic {
        Topic::StartSharing => send(client, &ws_msg.response_with_data(forward(true)))?,
        Topic::StopSharing => send(client, &ws_msg.response_with_data(forward(false)))?,
        Topic::GetSnapshot => {
            let data = serde_json::to_value(&*snapshot.borrow())?;
            send(client, &ws_msg.response_with_data(data))?;
        }
        Topic::Unknown => log::error!("Unknown command received"),
        topic => log::warn!("Unexpected topic `{topic:?}` from client"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use share_common::MessageType;

    fn response(rx: &mut mpsc::UnboundedReceiver<Message>) -> WsMessage {
        let msg = rx.try_recv().expect("no response sent");
        WsMessage::from_json(msg.to_str().unwrap()).unwrap()
    }

    #[test]
    fn start_and_stop_are_forwarded_to_session() {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let start = WsMessage::command(Topic::StartSharing, None);
        handle_messages(&client_tx, Message::text(start.to_json().unwrap()), &tx, &snapshot_rx)
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), MpscTopic::Sharing(true));
        let resp = response(&mut client_rx);
        assert_eq!(resp.id, start.id);
        assert_eq!(resp.r#type, MessageType::Response);
        assert_eq!(resp.data, Some(json!({"status": true})));

        let stop = WsMessage::command(Topic::StopSharing, None);
        handle_messages(&client_tx, Message::text(stop.to_json().unwrap()), &tx, &snapshot_rx)
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), MpscTopic::Sharing(false));
        assert_eq!(response(&mut client_rx).id, stop.id);
    }

    #[test]
    fn closed_session_is_reported_to_client() {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let (_snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let start = WsMessage::command(Topic::StartSharing, None);
        handle_messages(&client_tx, Message::text(start.to_json().unwrap()), &tx, &snapshot_rx)
            .unwrap();
        let data = response(&mut client_rx).data.unwrap();
        assert_eq!(data["status"], false);
    }

    #[test]
    fn get_snapshot_returns_current_entries() {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut store = crate::store::LocationStore::new("me", None);
        store.ingest(share_common::ParticipantLocation::new("b", 1.0, 2.0, 10));
        store.ingest(share_common::ParticipantLocation::new("a", 3.0, 4.0, 20));
        let (_snapshot_tx, snapshot_rx) = watch::channel(store.snapshot());

        let cmd = WsMessage::command(Topic::GetSnapshot, None);
        handle_messages(&client_tx, Message::text(cmd.to_json().unwrap()), &tx, &snapshot_rx)
            .unwrap();
        let data = response(&mut client_rx).data.unwrap();
        assert_eq!(data[0]["id"], "a");
        assert_eq!(data[1]["id"], "b");
    }

    #[test]
    fn garbage_is_an_error() {
        let (client_tx, _client_rx) = mpsc::unbounded_channel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        assert!(handle_messages(&client_tx, Message::text("hello"), &tx, &snapshot_rx).is_err());
        assert!(handle_messages(&client_tx, Message::binary(vec![1u8]), &tx, &snapshot_rx).is_err());
    }

    #[test]
    fn unknown_topic_is_ignored() {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let raw = r#"{"id":"1","type":"command","topic":"reboot","data":null}"#;
        handle_messages(&client_tx, Message::text(raw), &tx, &snapshot_rx).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn new_client_is_registered_before_initial_state() {
        let mut store = crate::store::LocationStore::new("me", None);
        store.ingest(share_common::ParticipantLocation::new("a", 3.0, 4.0, 20));
        let (_snapshot_tx, snapshot_rx) = watch::channel(store.snapshot());
        let (_sharing_tx, sharing_rx) = watch::channel(true);
        let views = Views {
            identity: "me".into(),
            snapshot: snapshot_rx,
            sharing: sharing_rx,
        };
        let clients = Clients::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut client = warp::test::ws()
            .path("/websocket")
            .handshake(routes(views, clients.clone(), tx))
            .await
            .expect("handshake");

        let first = client.recv().await.unwrap();
        let first = WsMessage::from_json(first.to_str().unwrap()).unwrap();
        assert_eq!(first.topic, Topic::Snapshot);
        assert_eq!(first.data.unwrap()[0]["id"], "a");
        // diffs broadcast from here on reach this client
        assert_eq!(clients.read().await.len(), 1);

        let second = client.recv().await.unwrap();
        let second = WsMessage::from_json(second.to_str().unwrap()).unwrap();
        assert_eq!(second.topic, Topic::SharingStatus);
        assert_eq!(second.data.unwrap()["is_sharing"], true);

        broadcast(&clients, "diff".to_string()).await;
        assert_eq!(client.recv().await.unwrap().to_str().unwrap(), "diff");
    }

    #[tokio::test]
    async fn snapshot_route_returns_json_array() {
        let mut store = crate::store::LocationStore::new("me", None);
        store.ingest(share_common::ParticipantLocation::new("b", 1.0, 2.0, 10));
        let (_snapshot_tx, snapshot_rx) = watch::channel(store.snapshot());
        let (_sharing_tx, sharing_rx) = watch::channel(false);
        let views = Views {
            identity: "me".into(),
            snapshot: snapshot_rx,
            sharing: sharing_rx,
        };
        let (tx, _rx) = mpsc::unbounded_channel();

        let resp = warp::test::request()
            .method("GET")
            .path("/snapshot")
            .reply(&routes(views, Clients::default(), tx))
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body[0]["id"], "b");
    }
}
