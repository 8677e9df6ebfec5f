use std::{path::PathBuf, sync::Arc, time::Duration};

use realtime_api::{ChangeEvent, LocationRow, RealtimeClient};
use share_common::{Notice, ParticipantLocation};
use tokio::sync::{
    mpsc::{self, unbounded_channel, UnboundedReceiver, UnboundedSender},
    oneshot, watch,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{
    config::Config,
    gate::BroadcastGate,
    geo::{Fix, GeoSource, ReplaySource, Unsupported},
    server::{MpscTopic, ShareServer},
    session::Session,
    snapshot::Snapshot,
    store::LocationStore,
    EnvVars,
};

/// Capacity of the backend change channel
const INBOUND_CAPACITY: usize = 64;

pub struct Options {
    /// Replay the track points of this file as the local position
    pub gpx: Option<PathBuf>,
    /// Stationary local position
    pub position: Option<Fix>,
    /// Interval between two reported positions
    pub period: Duration,
    /// Start sharing without waiting for a command from the web interface
    pub share: bool,
}

fn geo_source(opts: &Options) -> anyhow::Result<Box<dyn GeoSource + Send>> {
    if let Some(path) = &opts.gpx {
        return Ok(Box::new(ReplaySource::from_gpx(path, opts.period)?));
    }
    if let Some(fix) = opts.position {
        return Ok(Box::new(ReplaySource::fixed(fix, opts.period)));
    }
    log::warn!("No position source configured, location sharing is unavailable");
    Ok(Box::new(Unsupported))
}

async fn inbound_task(
    client: Arc<RealtimeClient>,
    inbound_tx: mpsc::Sender<ChangeEvent>,
    cancellation_token: CancellationToken,
) {
    let name = "inbound_task";

    // Rows written before this client connected
    match client.fetch_locations().await {
        Ok(events) => {
            log::info!("Fetched {} locations from `{}`", events.len(), client.table());
            for event in events {
                if let Err(e) = inbound_tx.send(event).await {
                    if !cancellation_token.is_cancelled() {
                        log::error!("{name}: cannot send data over inbound_tx: {e}");
                    }
                    tracing::warn!("exiting {name}");
                    return;
                }
            }
        }
        Err(e) => log::error!("Error fetching current locations: {e}"),
    }

    let endpoint = match client.endpoint() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            log::error!("Invalid realtime endpoint: {e}");
            tracing::warn!("exiting {name}");
            return;
        }
    };

    let cancellation_token_clone = cancellation_token.clone();
    let streaming_task = tokio::task::spawn_blocking(move || {
        realtime_api::stream::start(&endpoint, inbound_tx, cancellation_token_clone)
            .map_err(|e| log::error!("Error streaming: {e}"))
            .ok();
        log::warn!("Location change streaming stopped");
    });

    if let Err(e) = streaming_task.await {
        log::error!("Error waiting for streaming task: {e}");
    }

    tracing::warn!("exiting {name}");
}

async fn publish(
    client: &RealtimeClient,
    report: &ParticipantLocation,
    notices: &UnboundedSender<Notice>,
) {
    let Some(row) = LocationRow::from_observation(
        &report.id,
        report.latitude,
        report.longitude,
        report.observed_at,
    ) else {
        log::error!("Cannot publish report with timestamp {}", report.observed_at);
        return;
    };

    if let Err(e) = client.upsert_location(&row).await {
        log::error!("Error publishing location: {e}");
        if let Err(e) = notices.send(Notice::PublishFailed(e.to_string())) {
            log::debug!("Notice receiver gone: {e}");
        }
    }
}

/// Newest pending report. Older queued reports are superseded and never written.
fn latest(
    mut report: ParticipantLocation,
    outbound_rx: &mut UnboundedReceiver<ParticipantLocation>,
) -> ParticipantLocation {
    let mut skipped = 0;
    while let Ok(next) = outbound_rx.try_recv() {
        report = next;
        skipped += 1;
    }
    if skipped > 0 {
        log::debug!("Skipping {skipped} superseded location reports");
    }
    report
}

async fn publisher_task(
    client: Arc<RealtimeClient>,
    mut outbound_rx: UnboundedReceiver<ParticipantLocation>,
    notices: UnboundedSender<Notice>,
    cancellation_token: CancellationToken,
) {
    let name = "publisher_task";

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            report = outbound_rx.recv() => match report {
                Some(report) => {
                    let report = latest(report, &mut outbound_rx);
                    publish(&client, &report, &notices).await;
                }
                None => {
                    if !cancellation_token.is_cancelled() {
                        log::error!("outbound_rx channel closed, exiting {name}");
                    }
                    break;
                }
            },
        }
    }

    tracing::warn!("exiting {name}");
}

async fn web_server_task(
    config: Config,
    identity: String,
    http_port: u16,
    commands_tx: UnboundedSender<MpscTopic>,
    snapshot_rx: watch::Receiver<Snapshot>,
    notices_rx: UnboundedReceiver<Notice>,
    cancellation_token: CancellationToken,
) {
    let name = "web_server_task";
    let (server_exit_signal_tx, server_exit_signal_rx) = oneshot::channel();

    let mut server_task = tokio::task::spawn(ShareServer::start(
        config,
        identity,
        http_port,
        commands_tx,
        snapshot_rx,
        notices_rx,
        server_exit_signal_rx,
    ));

    tokio::select! {
        status = &mut server_task => match status {
            Ok(Ok(())) => (),
            Ok(Err(e)) => log::error!("Web server error: {e}"),
            Err(e) => log::error!("Error waiting for web server: {e}"),
        },
        _ = cancellation_token.cancelled() => {
            if server_exit_signal_tx.send(()).is_err() {
                log::warn!("Web server already stopped");
            }
            if let Err(e) = server_task.await {
                log::error!("Error waiting for web server: {e}");
            }
        }
    }

    tracing::warn!("exiting {name}");
}

pub async fn run(env: &EnvVars, opts: Options) -> anyhow::Result<()> {
    let client = Arc::new(RealtimeClient::new(
        &env.backend_url,
        &env.api_key,
        env.access_token.clone(),
        &env.table,
    )?);
    let config = Config::new(opts.share);
    let source = geo_source(&opts)?;

    // Positions from the geo source
    let (geo_tx, geo_rx) = unbounded_channel();
    // Own reports waiting to be written to the backend
    let (outbound_tx, outbound_rx) = unbounded_channel();
    // Toast style messages for the user
    let (notices_tx, notices_rx) = unbounded_channel();
    // Rows received from the backend
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    // Start and stop requests from the web interface
    let (commands_tx, commands_rx) = unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

    let store = LocationStore::new(env.participant_id.clone(), env.expiry_ms());
    let gate = BroadcastGate::new(
        env.participant_id.clone(),
        source,
        geo_tx,
        outbound_tx,
        notices_tx.clone(),
    );
    let session = Session::new(store, gate, config.clone(), notices_tx.clone(), snapshot_tx);

    let cancellation_token = CancellationToken::new();
    let task_tracker = TaskTracker::new();

    // Serves the snapshot and accepts sharing commands
    let web_server_task_handle = {
        let config = config.clone();
        let cancellation_token = cancellation_token.clone();
        let identity = env.participant_id.clone();
        let http_port = env.http_port;
        task_tracker.spawn(async move {
            web_server_task(
                config,
                identity,
                http_port,
                commands_tx,
                snapshot_rx,
                notices_rx,
                cancellation_token,
            )
            .await;
        })
    };

    // Initial fetch followed by the realtime subscription
    let inbound_task_handle = {
        let client = client.clone();
        let cancellation_token = cancellation_token.clone();
        task_tracker.spawn(async move {
            inbound_task(client, inbound_tx, cancellation_token).await;
        })
    };

    // Writes own reports to the backend
    let publisher_task_handle = {
        let client = client.clone();
        let cancellation_token = cancellation_token.clone();
        task_tracker.spawn(async move {
            publisher_task(client, outbound_rx, notices_tx, cancellation_token).await;
        })
    };

    // Owns the store and the broadcast gate
    let session_task_handle = {
        let cancellation_token = cancellation_token.clone();
        task_tracker.spawn(async move {
            session
                .run(geo_rx, inbound_rx, commands_rx, cancellation_token)
                .await;
        })
    };

    // After spawning all the tasks, close the tracker
    task_tracker.close();

    // Wait for any one of the tasks to exit
    tokio::select! {
        status = session_task_handle => tracing::info!("session task done: {:?}", status),
        status = inbound_task_handle => tracing::info!("inbound task done: {:?}", status),
        status = publisher_task_handle => tracing::info!("publisher task done: {:?}", status),
        status = web_server_task_handle => tracing::info!("web server task done: {:?}", status),
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl+C received"),
    }

    tracing::info!("stopping tasks and exiting...");
    // One or more tasks exited, tell the remaining tasks to exit
    cancellation_token.cancel();
    // Wait for all tasks to exit
    task_tracker.wait().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(latitude: f64, observed_at: i64) -> ParticipantLocation {
        ParticipantLocation::new("me", latitude, 13.4, observed_at)
    }

    #[tokio::test]
    async fn backlog_is_collapsed_to_newest_report() {
        let mut server = mockito::Server::new_async().await;
        let newest = report(52.59, 1_700_000_009_000);
        let mock = server
            .mock("POST", "/rest/v1/user_locations")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!([
                {"user_id": "me", "latitude": 52.59}
            ])))
            .with_status(201)
            .expect(1)
            .create_async()
            .await;
        let client =
            Arc::new(RealtimeClient::new(&server.url(), "anon", None, "user_locations").unwrap());

        // reports that piled up while the previous upsert was in flight
        let (outbound_tx, outbound_rx) = unbounded_channel();
        for i in 0..9 {
            outbound_tx
                .send(report(52.5 + i as f64 / 100.0, 1_700_000_000_000 + i * 1_000))
                .unwrap();
        }
        outbound_tx.send(newest).unwrap();
        drop(outbound_tx);

        let (notices_tx, mut notices_rx) = unbounded_channel();
        publisher_task(client, outbound_rx, notices_tx, CancellationToken::new()).await;

        mock.assert_async().await;
        // a stale upsert would not match the mock and fail with a notice
        assert!(notices_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_publish_is_a_notice() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/rest/v1/user_locations")
            .with_status(503)
            .create_async()
            .await;
        let client =
            Arc::new(RealtimeClient::new(&server.url(), "anon", None, "user_locations").unwrap());

        let (outbound_tx, outbound_rx) = unbounded_channel();
        outbound_tx.send(report(52.5, 1_700_000_000_000)).unwrap();
        drop(outbound_tx);

        let (notices_tx, mut notices_rx) = unbounded_channel();
        publisher_task(client, outbound_rx, notices_tx, CancellationToken::new()).await;

        assert!(matches!(
            notices_rx.try_recv(),
            Ok(Notice::PublishFailed(_))
        ));
    }

    #[test]
    fn latest_keeps_single_report() {
        let (_tx, mut rx) = unbounded_channel();
        assert_eq!(latest(report(1.0, 1), &mut rx), report(1.0, 1));
    }
}
